use super::{SipAddr, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

fn host_with_port(addr: SocketAddr) -> rsip::HostWithPort {
    rsip::HostWithPort {
        host: addr.ip().into(),
        port: Some(addr.port().into()),
    }
}

/// One UDP transport instance per bound local address. Unreliable:
/// the transaction layer is responsible for retransmission.
#[derive(Debug)]
pub struct UdpConnection {
    socket: UdpSocket,
    local: SipAddr,
}

impl UdpConnection {
    pub async fn bind(local: std::net::SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let bound = socket.local_addr()?;
        Ok(Self {
            socket,
            local: SipAddr {
                r#type: Some(rsip::Transport::Udp),
                addr: host_with_port(bound),
            },
        })
    }

    async fn resolve_peer(dest: &SipAddr) -> Result<SocketAddr> {
        let host = dest.addr.host.to_string();
        let port = dest
            .addr
            .port
            .as_ref()
            .and_then(|p| p.to_string().parse::<u16>().ok())
            .unwrap_or(5060);
        tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::TransportLayerError("no address found".to_string(), dest.clone())
            })
    }
}

#[async_trait]
impl Transport for UdpConnection {
    async fn send(&self, msg: &rsip::SipMessage, dest: &SipAddr) -> Result<()> {
        let peer = Self::resolve_peer(dest).await?;
        let bytes: Vec<u8> = msg.to_string().into_bytes();
        self.socket
            .send_to(&bytes, peer)
            .await
            .map_err(|e| Error::TransportLayerError(e.to_string(), dest.clone()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(rsip::SipMessage, SipAddr)> {
        let mut buf = vec![0u8; 65536];
        let (n, peer) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        let msg = rsip::SipMessage::try_from(buf)?;
        let addr = SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: host_with_port(peer),
        };
        Ok((msg, addr))
    }

    fn local_addr(&self) -> SipAddr {
        self.local.clone()
    }

    fn reliable(&self) -> bool {
        false
    }
}
