//! Small helpers that bridge `rsip`'s typed headers to the shapes the
//! transaction and dialog layers want, without re-implementing parsing.

use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Param, Request};

/// Extract the target `Uri` from a `Contact` header value such as
/// `<sip:bob@192.0.2.4:5060>;expires=3600`.
pub fn extract_uri_from_contact(value: &str) -> Result<rsip::Uri> {
    let inner = value
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(uri, _)| uri)
        .unwrap_or(value.trim());
    rsip::Uri::try_from(inner).map_err(|e| Error::ProtocolViolation(format!("bad Contact uri: {e}")))
}

/// Returns the request's top `Via` branch, or `None` if absent/unparsable.
pub fn top_via_branch(request: &Request) -> Option<String> {
    let via = request.via_header().ok()?.typed().ok()?;
    via.params.iter().find_map(|p| match p {
        Param::Branch(b) => Some(b.to_string()),
        _ => None,
    })
}
