//! Transport contract: a byte-oriented send/receive port to a
//! `(host, port)` peer, one instance per (local-address, protocol) tuple.
//! Socket machinery itself is an external collaborator; this module only
//! defines the narrow trait the transaction layer drives and the UDP/TCP
//! implementations that satisfy it.

mod tcp;
mod udp;

pub use tcp::TcpConnection;
pub use udp::UdpConnection;

use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A resolved SIP peer: transport type plus host/port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub r#type: Option<rsip::Transport>,
    pub addr: rsip::HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.r#type {
            Some(t) => write!(f, "{}/{}", self.addr, t),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl From<rsip::HostWithPort> for SipAddr {
    fn from(addr: rsip::HostWithPort) -> Self {
        Self { r#type: None, addr }
    }
}

impl From<std::net::IpAddr> for SipAddr {
    fn from(ip: std::net::IpAddr) -> Self {
        Self {
            r#type: None,
            addr: rsip::HostWithPort::from(ip),
        }
    }
}

impl From<SipAddr> for rsip::HostWithPort {
    fn from(value: SipAddr) -> Self {
        value.addr
    }
}

/// The transport contract consumed by the transaction layer.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, msg: &rsip::SipMessage, dest: &SipAddr) -> Result<()>;
    async fn recv(&self) -> Result<(rsip::SipMessage, SipAddr)>;
    fn local_addr(&self) -> SipAddr;
    fn reliable(&self) -> bool;
}

pub type Connection = Arc<dyn Transport>;

/// Registry of live transports plus best-effort DNS/route resolution of a
/// target `Uri` into a `SipAddr`. Only resolves hostnames; it does not
/// implement SIP routing policy (that lives in the dialog layer).
#[derive(Default)]
pub struct TransportLayer {
    connections: std::sync::RwLock<Vec<Connection>>,
}

impl fmt::Debug for TransportLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLayer").finish()
    }
}

impl TransportLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Connection) {
        self.connections.write().unwrap().push(conn);
    }

    /// The local address of the first bound transport, used as a Via
    /// fallback when no NAT-discovered public address is available yet.
    pub fn first_local_addr(&self) -> Option<SipAddr> {
        self.connections.read().unwrap().first().map(|c| c.local_addr())
    }

    /// Find an already-open connection matching the requested transport
    /// type, else resolve the target and return the first applicable
    /// connection (the caller is responsible for actually dialing out on
    /// TCP; this registry only tracks what is already bound).
    pub async fn lookup(
        &self,
        uri: &rsip::Uri,
        _new_conn_sender: NewConnectionSender,
    ) -> Result<(Connection, SipAddr)> {
        let addr = resolve(uri).await?;
        let conns = self.connections.read().unwrap();
        for conn in conns.iter() {
            if addr.r#type.is_none() || conn.local_addr().r#type == addr.r#type {
                return Ok((conn.clone(), addr));
            }
        }
        Err(Error::TransportLayerError(
            "no transport bound for destination".to_string(),
            addr,
        ))
    }
}

/// Channel used to hand a freshly dialed outbound connection's inbound
/// stream back to the endpoint's dispatcher loop.
pub type NewConnectionSender =
    tokio::sync::mpsc::UnboundedSender<(rsip::SipMessage, SipAddr)>;

/// Resolve a SIP URI's transport/host/port into a `SipAddr`. Hostname-to-IP
/// resolution itself is left to the OS resolver at send time (see
/// `UdpConnection`/`TcpConnection`) rather than duplicated here; full SRV/NAPTR
/// resolution of SIP URIs is an external collaborator, exercised via
/// `rsip-dns` only by `dialog::registration` for registrar discovery.
pub async fn resolve(uri: &rsip::Uri) -> Result<SipAddr> {
    let r#type = uri
        .params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Transport(t) => Some(t.clone()),
            _ => None,
        })
        .unwrap_or(rsip::Transport::Udp);
    Ok(SipAddr {
        r#type: Some(r#type),
        addr: uri.host_with_port.clone(),
    })
}
