//! Request/response construction helpers shared by the dialog layer and the
//! user-agent facade, kept out of `Endpoint` itself so message assembly
//! stays in one narrow place rather than scattered at call sites.

use super::endpoint::EndpointInner;
use rsip::headers::*;
use rsip::prelude::*;
use rsip::{Method, Request, Response, SipMessage, StatusCode, Uri};

/// Builds a request with the headers every SIP request must carry (Via,
/// Max-Forwards, From, To, CSeq, Call-ID, Contact, User-Agent), leaving
/// route-set/auth/body manipulation to the caller.
pub fn make_request(
    endpoint: &EndpointInner,
    method: Method,
    req_uri: Uri,
    via: rsip::typed::Via,
    from: rsip::typed::From,
    to: rsip::typed::To,
    seq: u32,
) -> Request {
    let call_id = super::make_call_id(None);
    let headers: rsip::Headers = vec![
        via.into(),
        MaxForwards::from(70).into(),
        from.into(),
        to.into(),
        CSeq::from(rsip::typed::CSeq { seq, method }).into(),
        call_id.into(),
        UserAgent::from(endpoint.user_agent.clone()).into(),
        ContentLength::from(0).into(),
    ]
    .into();

    Request {
        method,
        uri: req_uri,
        version: rsip::Version::V2,
        headers,
        body: Default::default(),
    }
}

/// Builds a response reusing the request's Via/From/To/CSeq/Call-ID
/// (RFC 3261 §8.2.6): every header that correlates a response to its
/// request is copied verbatim, only To may gain a local tag.
pub fn make_response(request: &Request, status_code: StatusCode, body: Option<Vec<u8>>) -> Response {
    let mut headers = rsip::Headers::default();
    for header in request.headers.iter() {
        match header {
            rsip::Header::Via(_)
            | rsip::Header::From(_)
            | rsip::Header::To(_)
            | rsip::Header::CSeq(_)
            | rsip::Header::CallId(_) => headers.push(header.clone()),
            _ => {}
        }
    }
    let body = body.unwrap_or_default();
    headers.push(ContentLength::from(body.len() as u32).into());

    Response {
        status_code,
        version: rsip::Version::V2,
        headers,
        body,
    }
}

/// Tags the To header of a response in place, for the first response a
/// server transaction sends that establishes a dialog. The To tag is
/// assigned once, at the first non-100 response, and never changes after.
pub fn ensure_to_tag(response: &mut Response, tag: &str) -> crate::Result<()> {
    let mut to = response.to_header()?.typed()?;
    if to.params.iter().any(|p| matches!(p, rsip::Param::Tag(_))) {
        return Ok(());
    }
    to.params.push(rsip::Param::Tag(tag.into()));
    let new_header: rsip::Header = to.into();
    for h in response.headers.iter_mut() {
        if matches!(h, rsip::Header::To(_)) {
            *h = new_header;
            break;
        }
    }
    Ok(())
}

/// Wraps a built request/response for handoff through the transport layer.
pub fn into_message(request: Request) -> SipMessage {
    SipMessage::Request(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::endpoint::{Endpoint, EndpointOption};

    fn endpoint() -> Endpoint {
        Endpoint::new(EndpointOption::default())
    }

    fn via(endpoint: &Endpoint) -> rsip::typed::Via {
        let local = crate::transport::SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: rsip::HostWithPort {
                host: std::net::IpAddr::from([127, 0, 0, 1]).into(),
                port: Some(5060.into()),
            },
        };
        endpoint.inner.get_via(Some(local), None).unwrap()
    }

    #[test]
    fn make_request_carries_the_mandatory_headers() {
        let endpoint = endpoint();
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
        let request = make_request(
            &endpoint.inner,
            Method::Register,
            "sip:example.com".try_into().unwrap(),
            via(&endpoint),
            from,
            to,
            42,
        );

        assert!(request.via_header().is_ok());
        assert!(request.from_header().is_ok());
        assert!(request.to_header().is_ok());
        assert!(request.call_id_header().is_ok());
        assert_eq!(request.cseq_header().unwrap().typed().unwrap().seq, 42);
        assert!(request
            .headers
            .iter()
            .any(|h| matches!(h, rsip::Header::UserAgent(_))));
    }

    #[test]
    fn make_response_copies_correlating_headers_but_not_contact() {
        let endpoint = endpoint();
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
        let mut request = make_request(
            &endpoint.inner,
            Method::Invite,
            "sip:bob@example.com".try_into().unwrap(),
            via(&endpoint),
            from,
            to,
            1,
        );
        request.headers.unique_push(rsip::Header::Contact(
            rsip::typed::Contact {
                display_name: None,
                uri: "sip:alice@192.0.2.1:5060".try_into().unwrap(),
                params: vec![],
            }
            .into(),
        ));

        let response = make_response(&request, StatusCode::OK, Some(b"v=0".to_vec()));
        assert_eq!(response.status_code, StatusCode::OK);
        assert!(response.via_header().is_ok());
        assert!(response.from_header().is_ok());
        assert!(response.to_header().is_ok());
        assert!(response.call_id_header().is_ok());
        assert!(!response.headers.iter().any(|h| matches!(h, rsip::Header::Contact(_))));
        assert_eq!(response.body, b"v=0".to_vec());
    }

    #[test]
    fn ensure_to_tag_assigns_once_and_is_idempotent() {
        let endpoint = endpoint();
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
        let request = make_request(
            &endpoint.inner,
            Method::Invite,
            "sip:bob@example.com".try_into().unwrap(),
            via(&endpoint),
            from,
            to,
            1,
        );
        let mut response = make_response(&request, StatusCode::Ringing, None);
        ensure_to_tag(&mut response, "tag-one").unwrap();
        ensure_to_tag(&mut response, "tag-two").unwrap();

        let to = response.to_header().unwrap().typed().unwrap();
        let tag = to.params.iter().find_map(|p| match p {
            rsip::Param::Tag(t) => Some(t.to_string()),
            _ => None,
        });
        assert_eq!(tag.as_deref(), Some("tag-one"));
    }
}
