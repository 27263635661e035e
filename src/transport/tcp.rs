use super::{SipAddr, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

fn host_with_port(addr: SocketAddr) -> rsip::HostWithPort {
    rsip::HostWithPort {
        host: addr.ip().into(),
        port: Some(addr.port().into()),
    }
}

/// A single long-lived TCP connection to one peer. Reliable: Timer A/E
/// retransmission and Timer D/I/K wait are skipped by the transaction layer
/// for transports where `reliable()` is true.
#[derive(Debug)]
pub struct TcpConnection {
    stream: Mutex<TcpStream>,
    local: SipAddr,
    peer: SipAddr,
}

impl TcpConnection {
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(peer).await?;
        let local = stream.local_addr()?;
        Ok(Self {
            local: SipAddr {
                r#type: Some(rsip::Transport::Tcp),
                addr: host_with_port(local),
            },
            peer: SipAddr {
                r#type: Some(rsip::Transport::Tcp),
                addr: host_with_port(peer),
            },
            stream: Mutex::new(stream),
        })
    }

    /// Read exactly one SIP message off the stream: headers terminated by
    /// `\r\n\r\n`, then `Content-Length` bytes of body.
    async fn read_message(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(Error::TransportLost("peer closed connection".to_string()));
            }
            buf.push(byte[0]);
            if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
                break;
            }
        }
        let header_text = String::from_utf8_lossy(&buf);
        let content_length = header_text
            .lines()
            .find_map(|line| {
                let lower = line.to_ascii_lowercase();
                if lower.starts_with("content-length:") || lower.starts_with("l:") {
                    line.split_once(':').and_then(|(_, v)| v.trim().parse::<usize>().ok())
                } else {
                    None
                }
            })
            .unwrap_or(0);
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            stream.read_exact(&mut body).await?;
            buf.extend_from_slice(&body);
        }
        Ok(buf)
    }
}

#[async_trait]
impl Transport for TcpConnection {
    async fn send(&self, msg: &rsip::SipMessage, _dest: &SipAddr) -> Result<()> {
        let bytes = msg.to_string().into_bytes();
        let mut stream = self.stream.lock().await;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| Error::TransportLayerError(e.to_string(), self.peer.clone()))
    }

    async fn recv(&self) -> Result<(rsip::SipMessage, SipAddr)> {
        let raw = {
            let mut stream = self.stream.lock().await;
            Self::read_message(&mut stream).await?
        };
        let msg = rsip::SipMessage::try_from(raw)?;
        Ok((msg, self.peer.clone()))
    }

    fn local_addr(&self) -> SipAddr {
        self.local.clone()
    }

    fn reliable(&self) -> bool {
        true
    }
}
