//! Raw bidirectional channels between two peers.
//!
//! A [`Transport`] knows how to listen (producing the candidate addresses a
//! remote may dial) and how to dial a candidate. [`Negotiation`] drives one
//! offer/answer exchange over a transport and yields a [`Link`]: a framed,
//! newline-delimited text stream.
//!
//! Two transports ship with the crate:
//! - [`TcpTransport`] for real nodes
//! - [`MemoryNetwork`] for tests, backed by `tokio::io::duplex`

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::PeerResult;

mod memory;
mod negotiation;
mod tcp;

pub use memory::MemoryNetwork;
pub use negotiation::{
    ConnectionState, DescriptionKind, Negotiation, SessionDescription,
};
pub use tcp::TcpTransport;

/// Longest text frame accepted on a link (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Any byte stream a transport can hand out.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// A boxed byte stream
pub type BoxedStream = Box<dyn ByteStream>;

/// An established channel: newline-delimited text frames.
pub type Link = Framed<BoxedStream, LinesCodec>;

/// Wrap a raw stream into a [`Link`].
pub fn frame(stream: BoxedStream) -> Link {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

/// A dialable address, e.g. `tcp:127.0.0.1:4100` or `mem:7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(String);

impl Candidate {
    /// Build from a scheme and an address
    pub fn new(scheme: &str, address: impl fmt::Display) -> Self {
        Self(format!("{}:{}", scheme, address))
    }

    /// Split into `(scheme, address)`
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }

    /// The full string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bound listener: its candidates and the queue of accepted streams.
///
/// Dropping the listener stops accepting.
pub struct Listener {
    /// Addresses a remote can dial to reach this listener
    pub candidates: Vec<Candidate>,
    /// Streams accepted so far
    pub incoming: mpsc::Receiver<BoxedStream>,
    pub(crate) _guard: Option<TaskGuard>,
}

/// Aborts a background task when dropped.
pub(crate) struct TaskGuard(pub(crate) JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Listen and dial primitives a negotiation runs on.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start listening. Candidate gathering is complete when this returns.
    async fn listen(&self) -> PeerResult<Listener>;

    /// Open a stream to a candidate produced by a remote `listen`.
    async fn dial(&self, candidate: &Candidate) -> PeerResult<BoxedStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_parts() {
        let c = Candidate::new("tcp", "127.0.0.1:4100");
        assert_eq!(c.as_str(), "tcp:127.0.0.1:4100");
        assert_eq!(c.parts(), Some(("tcp", "127.0.0.1:4100")));

        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"tcp:127.0.0.1:4100\"");
    }
}
