//! TCP transport

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BoxedStream, Candidate, Listener, TaskGuard, Transport};
use crate::error::{PeerError, PeerResult};

const SCHEME: &str = "tcp";

/// Transport over plain TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    listen_addr: SocketAddr,
}

impl TcpTransport {
    /// Listen on `listen_addr` (port 0 picks a free port per negotiation).
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }

    /// Parse a `host:port` string.
    pub fn from_addr_str(addr: &str) -> PeerResult<Self> {
        let listen_addr = addr
            .parse()
            .map_err(|e| PeerError::Config(format!("Invalid listen address {}: {}", addr, e)))?;
        Ok(Self::new(listen_addr))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self) -> PeerResult<Listener> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let mut local = listener.local_addr()?;
        if local.ip().is_unspecified() {
            local.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        debug!(addr = %local, "TCP listener bound");

        let (tx, incoming) = mpsc::channel(8);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        debug!(%peer, "Accepted TCP connection");
                        if tx.send(Box::new(stream) as BoxedStream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Listener {
            candidates: vec![Candidate::new(SCHEME, local)],
            incoming,
            _guard: Some(TaskGuard(task)),
        })
    }

    async fn dial(&self, candidate: &Candidate) -> PeerResult<BoxedStream> {
        let addr = match candidate.parts() {
            Some((SCHEME, addr)) => addr,
            _ => {
                return Err(PeerError::Transport(format!(
                    "Unsupported candidate {}",
                    candidate
                )))
            }
        };
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}
