//! Client-side SIP (RFC 3261) user-agent library.
//!
//! The core is the transaction/dialog layer, the message codec (built on
//! top of the [`rsip`] crate), and the digest-authentication retry loop.
//! Media, SDP construction, and DNS resolution of SIP URIs are treated as
//! narrow external collaborators, not implemented here.

pub mod dialog;
pub mod error;
pub mod flow_tracker;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;
pub mod useragent;

pub use error::{Error, Result};
