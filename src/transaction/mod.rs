pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;

use rand::Rng;

/// 8 hex chars.
pub fn make_tag() -> String {
    hex_token(4)
}

/// `z9hG4bK` + 16 hex chars, unique within the user agent for the lifetime
/// of any transaction that could still match.
pub fn make_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", hex_token(8)).into())
}

/// 32 hex chars `@` local-host. Stable across
/// authentication retries since it is generated once per dialog/registration,
/// not per retry.
pub fn make_call_id(host_suffix: Option<&str>) -> rsip::headers::CallId {
    let local = hex_token(16);
    match host_suffix {
        Some(host) => format!("{}@{}", local, host).into(),
        None => format!("{}@{}", local, hostname()).into(),
    }
}

/// 8 hex chars of `cnonce`.
pub fn make_cnonce() -> String {
    hex_token(4)
}

/// CSeq counters start from a random value, not zero, so that restarting a
/// user agent process never risks replaying a sequence number a peer has
/// already seen for the same Call-ID (teacher convention).
pub fn generate_random_cseq() -> u32 {
    rand::rng().random_range(1..=u32::MAX / 2)
}

fn hex_token(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes).map(|_| format!("{:02x}", rng.random::<u8>())).collect()
}

fn hostname() -> String {
    get_if_addrs::get_if_addrs()
        .ok()
        .and_then(|ifaces| {
            ifaces.into_iter().find_map(|i| {
                if i.is_loopback() {
                    return None;
                }
                match i.addr {
                    get_if_addrs::IfAddr::V4(ref addr) => Some(addr.ip.to_string()),
                    _ => None,
                }
            })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
