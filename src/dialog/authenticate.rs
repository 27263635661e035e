//! RFC 2617/3261 §22 Digest authentication for outgoing requests. Challenge
//! headers are parsed from their raw string value rather than through
//! `rsip`'s typed header API, since the parameter set (qop, nonce, opaque,
//! stale) is the same handful of directives either way and it keeps this
//! module decoupled from that API's exact shape.

use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::make_cnonce;
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Mutex;

/// Credentials for one realm. A user agent holding several registrations
/// typically keeps one `Credential` per registrar.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

#[derive(Debug, Clone)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<String>,
    algorithm: String,
    stale: bool,
}

/// Owns the `nc` (nonce-count) sequence RFC 2617 §3.2.2 requires per
/// `(realm, nonce)` pair, shared by every transaction an endpoint sends
/// through the same challenge.
#[derive(Default)]
pub struct Authenticator {
    nc: Mutex<HashMap<(String, String), u32>>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_nc(&self, realm: &str, nonce: &str) -> u32 {
        let mut table = self.nc.lock().unwrap();
        let counter = table.entry((realm.to_string(), nonce.to_string())).or_insert(0);
        *counter += 1;
        *counter
    }
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

/// Parses the parameter list of a `WWW-Authenticate`/`Proxy-Authenticate`
/// header value, e.g. `Digest realm="example.com", nonce="...", qop="auth"`.
fn parse_challenge(raw: &str) -> Result<DigestChallenge> {
    let raw = raw.trim();
    let rest = raw
        .strip_prefix("Digest")
        .ok_or_else(|| Error::UnsupportedChallenge(raw.to_string()))?;

    let mut realm = None;
    let mut nonce = None;
    let mut opaque = None;
    let mut qop = None;
    let mut algorithm = "MD5".to_string();
    let mut stale = false;

    for part in rest.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(unquote(value)),
            "nonce" => nonce = Some(unquote(value)),
            "opaque" => opaque = Some(unquote(value)),
            "qop" => qop = Some(unquote(value)),
            "algorithm" => algorithm = unquote(value),
            "stale" => stale = unquote(value).eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    if !algorithm.eq_ignore_ascii_case("MD5") {
        return Err(Error::UnsupportedChallenge(format!("algorithm {}", algorithm)));
    }

    Ok(DigestChallenge {
        realm: realm.ok_or_else(|| Error::UnsupportedChallenge("missing realm".to_string()))?,
        nonce: nonce.ok_or_else(|| Error::UnsupportedChallenge("missing nonce".to_string()))?,
        opaque,
        qop,
        algorithm,
        stale,
    })
}

fn hex_md5(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Computes `response` per RFC 2617 §3.2.2: `qop=auth` uses HA1:nonce:nc:cnonce:qop:HA2,
/// the legacy form (`qop` absent) uses plain HA1:nonce:HA2.
fn digest_response(
    cred: &Credential,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    cnonce: &str,
    nc: &str,
) -> String {
    let ha1 = hex_md5(&format!(
        "{}:{}:{}",
        cred.username, challenge.realm, cred.password
    ));
    let ha2 = hex_md5(&format!("{}:{}", method, uri));
    match challenge.qop.as_deref() {
        Some(qop) if qop.contains("auth") => hex_md5(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, challenge.nonce, nc, cnonce, "auth", ha2
        )),
        _ => hex_md5(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

/// Pulls just the realm out of a 401/407's challenge header, for callers
/// that need to report which realm is being challenged without running the
/// full digest exchange (e.g. when no credential is on hand to answer it).
pub fn challenge_realm(resp: &Response) -> Result<String> {
    let (_, raw_challenge) = challenge_header_value(resp)?;
    Ok(parse_challenge(&raw_challenge)?.realm)
}

fn challenge_header_value(resp: &Response) -> Result<(&'static str, String)> {
    for header in resp.headers.iter() {
        match header {
            Header::WwwAuthenticate(h) => return Ok(("Authorization", h.value().to_string())),
            Header::ProxyAuthenticate(h) => return Ok(("Proxy-Authorization", h.value().to_string())),
            _ => {}
        }
    }
    Err(Error::UnsupportedChallenge(
        "401/407 without WWW-Authenticate/Proxy-Authenticate".to_string(),
    ))
}

/// Builds the next attempt of a challenged request, bumping CSeq and branch,
/// and creates a fresh client transaction for it. `tx` is consumed since the
/// challenged transaction is already `Completed`/`Terminated` by the time a
/// final 401/407 is seen.
pub async fn handle_client_authenticate(
    next_seq: u32,
    tx: Transaction,
    resp: Response,
    cred: &Credential,
) -> Result<Transaction> {
    if !matches!(
        resp.status_code,
        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
    ) {
        return Err(Error::ProtocolViolation(
            "handle_client_authenticate called on a non-challenge response".to_string(),
        ));
    }

    let (header_name, raw_challenge) = challenge_header_value(&resp)?;
    let challenge = parse_challenge(&raw_challenge)?;
    if challenge.stale {
        // A stale nonce means the server wants the same credentials retried
        // with a fresh nonce, not a credential failure.
    }

    let mut request = tx.original.clone();
    let method = request.method.to_string();
    let uri = request.uri.to_string();
    let cnonce = make_cnonce();
    let nc = format!(
        "{:08x}",
        tx.endpoint.authenticator.next_nc(&challenge.realm, &challenge.nonce)
    );
    let response_digest = digest_response(cred, &challenge, &method, &uri, &cnonce, &nc);

    let mut auth_params = vec![
        format!("username=\"{}\"", cred.username),
        format!("realm=\"{}\"", challenge.realm),
        format!("nonce=\"{}\"", challenge.nonce),
        format!("uri=\"{}\"", uri),
        format!("response=\"{}\"", response_digest),
        format!("algorithm={}", challenge.algorithm),
    ];
    if let Some(opaque) = &challenge.opaque {
        auth_params.push(format!("opaque=\"{}\"", opaque));
    }
    if let Some(qop) = &challenge.qop {
        let qop = if qop.contains("auth") { "auth" } else { qop.as_str() };
        auth_params.push(format!("qop={}", qop));
        auth_params.push(format!("cnonce=\"{}\"", cnonce));
        auth_params.push(format!("nc={}", nc));
    }
    let header_value = format!("Digest {}", auth_params.join(", "));
    let header = match header_name {
        "Authorization" => Header::Authorization(header_value.into()),
        _ => Header::ProxyAuthorization(header_value.into()),
    };
    request.headers.unique_push(header);

    let cseq = request.cseq_header()?.typed()?;
    request.headers.unique_push(
        rsip::typed::CSeq {
            seq: next_seq,
            method: cseq.method,
        }
        .into(),
    );
    for via in request.headers.iter_mut() {
        if let Header::Via(v) = via {
            if let Ok(mut typed) = v.clone().typed() {
                typed.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
                typed.params.push(crate::transaction::make_branch());
                *v = typed.into();
            }
        }
    }

    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    Ok(Transaction::new_client(key, request, tx.endpoint.clone(), None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_response_matches_rfc2617_example() {
        // RFC 2617 §3.5 worked example.
        let cred = Credential {
            username: "Mufasa".to_string(),
            password: "Circle Of Life".to_string(),
            realm: None,
        };
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: None,
            qop: Some("auth".to_string()),
            algorithm: "MD5".to_string(),
            stale: false,
        };
        let response = digest_response(
            &cred,
            &challenge,
            "GET",
            "/dir/index.html",
            "0a4f113b",
            "00000001",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_response_without_qop_uses_legacy_form() {
        let cred = Credential {
            username: "alice".to_string(),
            password: "secret".to_string(),
            realm: None,
        };
        let challenge = DigestChallenge {
            realm: "example.com".to_string(),
            nonce: "abcd1234".to_string(),
            opaque: None,
            qop: None,
            algorithm: "MD5".to_string(),
            stale: false,
        };
        let with_nc = digest_response(&cred, &challenge, "REGISTER", "sip:example.com", "x", "1");
        let ha1 = hex_md5("alice:example.com:secret");
        let ha2 = hex_md5("REGISTER:sip:example.com");
        let expected = hex_md5(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
        assert_eq!(with_nc, expected);
    }

    #[test]
    fn parse_challenge_reads_every_directive() {
        let challenge = parse_challenge(
            "Digest realm=\"example.com\", nonce=\"n1\", opaque=\"o1\", qop=\"auth\", algorithm=MD5, stale=true",
        )
        .unwrap();
        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "n1");
        assert_eq!(challenge.opaque.as_deref(), Some("o1"));
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert!(challenge.stale);
    }

    #[test]
    fn parse_challenge_rejects_unsupported_algorithm() {
        let err = parse_challenge("Digest realm=\"x\", nonce=\"y\", algorithm=SHA-256").unwrap_err();
        assert!(matches!(err, Error::UnsupportedChallenge(_)));
    }
}
