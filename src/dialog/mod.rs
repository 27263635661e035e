//! Dialog layer (RFC 3261 §12): call state that outlives any one
//! transaction, keyed by (Call-ID, local tag, remote tag).

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;
pub mod server_dialog;

use crate::Result;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Param, Request};
use std::fmt;

pub use dialog_layer::DialogLayer;

/// Identifies a dialog uniquely for the lifetime of the user agent process:
/// the Call-ID plus the tags each side assigned to its own leg. Before a
/// to-tag is known (a client dialog still in `Calling`), `to_tag` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.from_tag, self.to_tag)
    }
}

fn tag_of(params: &[Param]) -> String {
    params
        .iter()
        .find_map(|p| match p {
            Param::Tag(t) => Some(t.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

impl TryFrom<&Request> for DialogId {
    type Error = crate::Error;

    /// Builds the id a dialog created *by sending* `request` would have:
    /// `from_tag` is ours, `to_tag` is not yet known.
    fn try_from(request: &Request) -> Result<Self> {
        let from = request.from_header()?.typed()?;
        Ok(Self {
            call_id: request.call_id_header()?.value().to_string(),
            from_tag: tag_of(&from.params),
            to_tag: String::new(),
        })
    }
}

impl DialogId {
    /// Builds the id as seen from the receiving side of `request`: our tag
    /// is the request's To tag (assigned by us on the first response), the
    /// remote tag is the request's From tag.
    pub fn from_request_as_uas(request: &Request) -> Result<Self> {
        let from = request.from_header()?.typed()?;
        let to = request.to_header()?.typed()?;
        Ok(Self {
            call_id: request.call_id_header()?.value().to_string(),
            from_tag: tag_of(&to.params),
            to_tag: tag_of(&from.params),
        })
    }
}
