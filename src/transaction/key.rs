//! Transaction identity and matching.

use crate::rsip_ext::top_via_branch;
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Method, Request, Response};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn for_method(method: &Method, role: TransactionRole) -> Self {
        match (method, role) {
            (Method::Invite, TransactionRole::Client) => TransactionKind::InviteClient,
            (Method::Invite, TransactionRole::Server) => TransactionKind::InviteServer,
            (_, TransactionRole::Client) => TransactionKind::NonInviteClient,
            (_, TransactionRole::Server) => TransactionKind::NonInviteServer,
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::InviteServer)
    }
}

/// Keyed by (branch, sent-by of top Via, method) per RFC 3261 §17.1.3/§17.2.3,
/// with ACK collapsing onto the INVITE transaction's key. Falls back to the
/// RFC 2543 (Call-ID, From-tag, To-tag, CSeq, request-URI) tuple when the top
/// Via branch does not carry the `z9hG4bK` magic cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Rfc3261 {
        branch: String,
        sent_by: String,
        method: Method,
        role: TransactionRole,
    },
    Rfc2543 {
        call_id: String,
        from_tag: String,
        to_tag: String,
        cseq: u32,
        request_uri: String,
        role: TransactionRole,
    },
}

const MAGIC_COOKIE: &str = "z9hG4bK";

fn tag_of(params: &[rsip::Param]) -> String {
    params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Tag(t) => Some(t.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// ACK to a non-2xx final response matches the INVITE server transaction, so
/// its key is computed against `Method::Invite` rather than `Method::Ack`.
fn matching_method(method: Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        m => m,
    }
}

impl TransactionKey {
    pub fn from_request(request: &Request, role: TransactionRole) -> Result<Self> {
        let method = matching_method(request.method);
        match top_via_branch(request) {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) => {
                let via = request.via_header()?.typed()?;
                Ok(TransactionKey::Rfc3261 {
                    branch,
                    sent_by: via.uri.host_with_port.to_string(),
                    method,
                    role,
                })
            }
            _ => {
                let from = request.from_header()?.typed()?;
                let to = request.to_header()?.typed()?;
                let cseq = request.cseq_header()?.typed()?;
                Ok(TransactionKey::Rfc2543 {
                    call_id: request.call_id_header()?.value().to_string(),
                    from_tag: tag_of(&from.params),
                    to_tag: tag_of(&to.params),
                    cseq: cseq.seq,
                    request_uri: request.uri.to_string(),
                    role,
                })
            }
        }
    }

    /// Computes the key a response must match against, from the client's
    /// point of view (role is always `Client` since only a client
    /// transaction ever compares itself against a response).
    pub fn from_response(response: &Response) -> Result<Self> {
        let via = response.via_header()?.typed()?;
        let branch = via
            .params
            .iter()
            .find_map(|p| match p {
                rsip::Param::Branch(b) => Some(b.to_string()),
                _ => None,
            })
            .ok_or_else(|| Error::ProtocolViolation("response Via missing branch".to_string()))?;
        let cseq = response.cseq_header()?.typed()?;
        if branch.starts_with(MAGIC_COOKIE) {
            Ok(TransactionKey::Rfc3261 {
                branch,
                sent_by: via.uri.host_with_port.to_string(),
                method: matching_method(cseq.method),
                role: TransactionRole::Client,
            })
        } else {
            let from = response.from_header()?.typed()?;
            let to = response.to_header()?.typed()?;
            Ok(TransactionKey::Rfc2543 {
                call_id: response.call_id_header()?.value().to_string(),
                from_tag: tag_of(&from.params),
                to_tag: tag_of(&to.params),
                cseq: cseq.seq,
                request_uri: String::new(),
                role: TransactionRole::Client,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::endpoint::{Endpoint, EndpointOption};

    fn sample_request(endpoint: &Endpoint) -> Request {
        let local = crate::transport::SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: rsip::HostWithPort {
                host: std::net::IpAddr::from([127, 0, 0, 1]).into(),
                port: Some(5060.into()),
            },
        };
        let via = endpoint.inner.get_via(Some(local), None).unwrap();
        let from = rsip::typed::From {
            display_name: None,
            uri: "sip:alice@example.com".try_into().unwrap(),
            params: vec![],
        };
        let to = rsip::typed::To {
            display_name: None,
            uri: "sip:bob@example.com".try_into().unwrap(),
            params: vec![],
        };
        endpoint.make_request(
            Method::Options,
            "sip:bob@example.com".try_into().unwrap(),
            via,
            from,
            to,
            1,
        )
    }

    #[test]
    fn request_and_its_response_share_a_key() {
        let endpoint = Endpoint::new(EndpointOption::default());
        let request = sample_request(&endpoint);
        let response = endpoint.make_response(&request, rsip::StatusCode::OK, None);

        let client_key = TransactionKey::from_request(&request, TransactionRole::Client).unwrap();
        let response_key = TransactionKey::from_response(&response).unwrap();
        assert_eq!(client_key, response_key);
        assert!(matches!(client_key, TransactionKey::Rfc3261 { .. }));
    }

    #[test]
    fn ack_to_non_2xx_matches_the_invite_transaction_key() {
        let endpoint = Endpoint::new(EndpointOption::default());
        let mut invite = sample_request(&endpoint);
        invite.method = Method::Invite;
        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();

        let mut ack = invite.clone();
        ack.method = Method::Ack;
        let ack_key = TransactionKey::from_request(&ack, TransactionRole::Client).unwrap();

        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn missing_magic_cookie_falls_back_to_rfc2543_tuple() {
        let endpoint = Endpoint::new(EndpointOption::default());
        let mut request = sample_request(&endpoint);
        for header in request.headers.iter_mut() {
            if let rsip::Header::Via(v) = header {
                if let Ok(mut typed) = v.clone().typed() {
                    typed.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
                    typed.params.push(rsip::Param::Branch("nomagic".into()));
                    *v = typed.into();
                }
            }
        }
        let key = TransactionKey::from_request(&request, TransactionRole::Client).unwrap();
        assert!(matches!(key, TransactionKey::Rfc2543 { .. }));
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKey::Rfc3261 {
                branch,
                sent_by,
                method,
                role,
            } => write!(f, "3261:{:?}:{}:{}:{:?}", role, branch, sent_by, method),
            TransactionKey::Rfc2543 {
                call_id,
                from_tag,
                to_tag,
                cseq,
                request_uri,
                role,
            } => write!(
                f,
                "2543:{:?}:{}:{}:{}:{}:{}",
                role, call_id, from_tag, to_tag, cseq, request_uri
            ),
        }
    }
}
