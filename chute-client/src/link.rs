//! UDP link to one server: a connected socket, one request out, at most one reply back per wait.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chute_core::{decode_reply, encode_request, FrameEncodeError, Reply, Request, MAX_DATAGRAM};
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Connected socket plus the per-attempt reply timeout.
/// Datagrams from any address other than the server are dropped by the kernel.
pub struct Link {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
}

impl Link {
    /// Resolve `server` (`host:port`) and connect an ephemeral socket of the same address family.
    pub async fn connect(server: &str, timeout: Duration) -> Result<Self, LinkError> {
        let addr = tokio::net::lookup_host(server)
            .await
            .map_err(|source| LinkError::Resolve {
                server: server.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| LinkError::Resolve {
                server: server.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })?;
        let local: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        tracing::debug!(%addr, local = %socket.local_addr()?, "link connected");
        Ok(Self {
            socket,
            server: addr,
            timeout,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Send `request` and wait for one reply. `Ok(None)` means no usable reply within the timeout.
    pub async fn exchange(&self, request: &Request) -> Result<Option<Reply>, LinkError> {
        let datagram = encode_request(request)?;
        self.exchange_raw(&datagram).await
    }

    /// Send an already encoded datagram and wait for one reply.
    pub async fn exchange_raw(&self, datagram: &[u8]) -> Result<Option<Reply>, LinkError> {
        self.socket.send(datagram).await?;
        self.recv_reply().await
    }

    /// Wait up to the timeout for a decodable reply. Undecodable datagrams are skipped.
    pub async fn recv_reply(&self) -> Result<Option<Reply>, LinkError> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(n)) => n,
                // ICMP port unreachable from an earlier send; nothing is listening.
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    tracing::debug!(server = %self.server, "connection refused");
                    tokio::time::sleep_until(deadline).await;
                    return Ok(None);
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            match decode_reply(&buf[..n]) {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) => tracing::debug!(error = %e, "ignoring undecodable reply"),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("cannot resolve {server}: {source}")]
    Resolve { server: String, source: io::Error },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}
