//! Offer/answer negotiation of a single link.
//!
//! The offerer listens and publishes its candidates in an offer description.
//! The answerer creates an answer description and dials the offer's
//! candidates. On the first stream that reaches it the offerer waits until
//! the answer has been applied locally, checks that the stream carries both
//! session tokens, and accepts:
//!
//! ```text
//! answerer                                   offerer
//!    | ---- {"offer":..., "answer":...} ------> |   (tokens checked)
//!    | <--- {"accepted":true} ----------------- |
//!    |          link is Connected              |
//! ```
//!
//! Manual pairing carries every candidate inside the offer. Signaling may
//! instead trickle them with [`Negotiation::add_remote_candidate`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::{frame, Candidate, Link, Listener, TaskGuard, Transport};
use crate::error::{PeerError, PeerResult};

/// Which side of the exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    /// Produced by the side that listens
    Offer,
    /// Produced by the side that dials
    Answer,
}

/// What one side tells the other about its end of the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    /// Random token identifying this negotiation attempt
    pub session: String,
    /// Dialable addresses (empty when trickled separately)
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Descriptions are being exchanged
    New,
    /// A stream is open and the token check is in progress
    Connecting,
    /// The link is established
    Connected,
    /// An established link dropped
    Disconnected,
    /// No stream could be established
    Failed,
    /// Torn down locally
    Closed,
}

impl ConnectionState {
    /// States from which a reconnection should be scheduled
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// How long an inbound stream may take to present its session tokens
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize)]
struct LinkHello {
    offer: String,
    answer: String,
}

#[derive(Serialize, Deserialize)]
struct LinkAccept {
    accepted: bool,
}

fn session_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

enum Role {
    Offerer {
        remote: watch::Sender<Option<SessionDescription>>,
        gathered: Vec<Candidate>,
    },
    Answerer {
        remote: SessionDescription,
        candidates: Option<mpsc::UnboundedSender<Candidate>>,
    },
}

/// One in-flight offer/answer exchange.
///
/// Dropping a negotiation aborts its background task.
pub struct Negotiation {
    role: Role,
    local: SessionDescription,
    state: Arc<watch::Sender<ConnectionState>>,
    established: Option<oneshot::Receiver<PeerResult<Link>>>,
    task: TaskGuard,
}

impl std::fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiation")
            .field("local", &self.local)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Negotiation {
    /// Start as the offerer: listen and build the offer.
    ///
    /// Candidate gathering is complete when this returns. With `trickle` the
    /// offer carries no candidates; send [`gathered_candidates`] separately.
    ///
    /// [`gathered_candidates`]: Self::gathered_candidates
    pub async fn create_offer(transport: Arc<dyn Transport>, trickle: bool) -> PeerResult<Self> {
        let listener = transport.listen().await?;
        let gathered = listener.candidates.clone();
        let local = SessionDescription {
            kind: DescriptionKind::Offer,
            session: session_token(),
            candidates: if trickle { Vec::new() } else { gathered.clone() },
        };

        let (remote_tx, remote_rx) = watch::channel(None);
        let state = Arc::new(watch::channel(ConnectionState::New).0);
        let (done_tx, done_rx) = oneshot::channel();

        let task = tokio::spawn(run_offerer(
            listener,
            local.session.clone(),
            remote_rx,
            state.clone(),
            done_tx,
        ));

        Ok(Self {
            role: Role::Offerer {
                remote: remote_tx,
                gathered,
            },
            local,
            state,
            established: Some(done_rx),
            task: TaskGuard(task),
        })
    }

    /// Start as the answerer for a remote offer and begin dialing.
    pub fn accept_offer(transport: Arc<dyn Transport>, offer: SessionDescription) -> PeerResult<Self> {
        if offer.kind != DescriptionKind::Offer {
            return Err(PeerError::InvalidOperation(
                "remote description is not an offer".to_string(),
            ));
        }

        let local = SessionDescription {
            kind: DescriptionKind::Answer,
            session: session_token(),
            candidates: Vec::new(),
        };

        let (cand_tx, cand_rx) = mpsc::unbounded_channel();
        for candidate in &offer.candidates {
            let _ = cand_tx.send(candidate.clone());
        }
        // A complete offer means no more candidates will follow
        let candidates = if offer.candidates.is_empty() {
            Some(cand_tx)
        } else {
            None
        };

        let state = Arc::new(watch::channel(ConnectionState::New).0);
        let (done_tx, done_rx) = oneshot::channel();
        let hello = LinkHello {
            offer: offer.session.clone(),
            answer: local.session.clone(),
        };

        let task = tokio::spawn(run_answerer(
            transport,
            hello,
            cand_rx,
            state.clone(),
            done_tx,
        ));

        Ok(Self {
            role: Role::Answerer {
                remote: offer,
                candidates,
            },
            local,
            state,
            established: Some(done_rx),
            task: TaskGuard(task),
        })
    }

    /// Our description
    pub fn local_description(&self) -> &SessionDescription {
        &self.local
    }

    /// The remote description, once known
    pub fn remote_description(&self) -> Option<SessionDescription> {
        match &self.role {
            Role::Offerer { remote, .. } => remote.borrow().clone(),
            Role::Answerer { remote, .. } => Some(remote.clone()),
        }
    }

    /// Candidates our listener produced (empty for an answerer)
    pub fn gathered_candidates(&self) -> &[Candidate] {
        match &self.role {
            Role::Offerer { gathered, .. } => gathered,
            Role::Answerer { .. } => &[],
        }
    }

    /// Whether this side created the offer
    pub fn is_offerer(&self) -> bool {
        matches!(self.role, Role::Offerer { .. })
    }

    /// Apply the remote answer. Only valid once, on the offering side.
    pub fn set_remote_description(&self, answer: SessionDescription) -> PeerResult<()> {
        let Role::Offerer { remote, .. } = &self.role else {
            return Err(PeerError::InvalidOperation(
                "answerer already has its remote description".to_string(),
            ));
        };
        if answer.kind != DescriptionKind::Answer {
            return Err(PeerError::InvalidOperation(
                "remote description is not an answer".to_string(),
            ));
        }
        if remote.borrow().is_some() {
            return Err(PeerError::InvalidOperation(
                "remote description already set".to_string(),
            ));
        }
        remote.send_replace(Some(answer));
        Ok(())
    }

    /// Add a trickled candidate on the answering side.
    pub fn add_remote_candidate(&self, candidate: Candidate) -> PeerResult<()> {
        match &self.role {
            Role::Answerer {
                candidates: Some(tx),
                ..
            } => tx
                .send(candidate)
                .map_err(|_| PeerError::Transport("negotiation finished".to_string())),
            _ => Err(PeerError::InvalidOperation(
                "negotiation does not accept trickled candidates".to_string(),
            )),
        }
    }

    /// Signal that no more trickled candidates will arrive.
    pub fn end_of_candidates(&mut self) {
        if let Role::Answerer { candidates, .. } = &mut self.role {
            candidates.take();
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait for the link. Can only be awaited once.
    pub async fn connected(&mut self) -> PeerResult<Link> {
        self.link_future()?.await
    }

    /// Detach the wait for the link so the negotiation stays usable (for
    /// trickled candidates) while the caller awaits it elsewhere.
    pub fn link_future(&mut self) -> PeerResult<BoxFuture<'static, PeerResult<Link>>> {
        let rx = self.established.take().ok_or_else(|| {
            PeerError::InvalidOperation("link already taken".to_string())
        })?;
        Ok(async move {
            rx.await
                .map_err(|_| PeerError::Transport("negotiation aborted".to_string()))?
        }
        .boxed())
    }

    /// Give up on this negotiation.
    pub fn close(&mut self) {
        self.task.0.abort();
        self.established.take();
        self.state.send_replace(ConnectionState::Closed);
    }
}

async fn run_offerer(
    mut listener: Listener,
    local_session: String,
    mut remote: watch::Receiver<Option<SessionDescription>>,
    state: Arc<watch::Sender<ConnectionState>>,
    done: oneshot::Sender<PeerResult<Link>>,
) {
    while let Some(stream) = listener.incoming.recv().await {
        state.send_replace(ConnectionState::Connecting);
        let mut link = frame(stream);

        let hello: LinkHello = match tokio::time::timeout(HELLO_TIMEOUT, link.next()).await {
            Ok(Some(Ok(line))) => match serde_json::from_str(&line) {
                Ok(hello) => hello,
                Err(e) => {
                    debug!(error = %e, "Ignoring stream with malformed hello");
                    continue;
                }
            },
            Ok(_) => continue,
            Err(_) => {
                debug!("Dropping stream that sent no hello");
                continue;
            }
        };
        if hello.offer != local_session {
            warn!("Ignoring stream for a different offer");
            continue;
        }

        // Hold the stream until the answer has been applied locally
        let answer_session = loop {
            if let Some(desc) = remote.borrow_and_update().as_ref() {
                break desc.session.clone();
            }
            if remote.changed().await.is_err() {
                return;
            }
        };
        if hello.answer != answer_session {
            warn!("Ignoring stream for a different answer");
            continue;
        }

        let Ok(accept) = serde_json::to_string(&LinkAccept { accepted: true }) else {
            continue;
        };
        if let Err(e) = link.send(accept).await {
            debug!(error = %e, "Failed to accept stream");
            continue;
        }

        state.send_replace(ConnectionState::Connected);
        let _ = done.send(Ok(link));
        return;
    }

    state.send_replace(ConnectionState::Failed);
    let _ = done.send(Err(PeerError::Transport("listener closed".to_string())));
}

async fn run_answerer(
    transport: Arc<dyn Transport>,
    hello: LinkHello,
    mut candidates: mpsc::UnboundedReceiver<Candidate>,
    state: Arc<watch::Sender<ConnectionState>>,
    done: oneshot::Sender<PeerResult<Link>>,
) {
    while let Some(candidate) = candidates.recv().await {
        state.send_replace(ConnectionState::Connecting);
        match try_candidate(transport.as_ref(), &candidate, &hello).await {
            Ok(link) => {
                debug!(%candidate, "Link established");
                state.send_replace(ConnectionState::Connected);
                let _ = done.send(Ok(link));
                return;
            }
            Err(e) => debug!(%candidate, error = %e, "Candidate failed"),
        }
    }

    state.send_replace(ConnectionState::Failed);
    let _ = done.send(Err(PeerError::Transport(
        "no candidate could be reached".to_string(),
    )));
}

async fn try_candidate(
    transport: &dyn Transport,
    candidate: &Candidate,
    hello: &LinkHello,
) -> PeerResult<Link> {
    let stream = transport.dial(candidate).await?;
    let mut link = frame(stream);

    let line = serde_json::to_string(hello).map_err(|e| PeerError::Serialization(e.to_string()))?;
    link.send(line)
        .await
        .map_err(|e| PeerError::Transport(e.to_string()))?;

    match link.next().await {
        Some(Ok(line)) => {
            let accept: LinkAccept = serde_json::from_str(&line)
                .map_err(|e| PeerError::Transport(format!("Bad accept: {}", e)))?;
            if accept.accepted {
                Ok(link)
            } else {
                Err(PeerError::Transport("link refused".to_string()))
            }
        }
        Some(Err(e)) => Err(PeerError::Transport(e.to_string())),
        None => Err(PeerError::Transport("closed before accept".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn net() -> Arc<dyn Transport> {
        Arc::new(MemoryNetwork::new())
    }

    #[tokio::test]
    async fn test_full_exchange_connects() {
        let transport = net();
        let mut offerer = Negotiation::create_offer(transport.clone(), false)
            .await
            .unwrap();
        assert_eq!(offerer.local_description().candidates.len(), 1);

        let mut answerer =
            Negotiation::accept_offer(transport, offerer.local_description().clone()).unwrap();
        offerer
            .set_remote_description(answerer.local_description().clone())
            .unwrap();

        let (a, b) = tokio::join!(offerer.connected(), answerer.connected());
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        a.send("from offerer".to_string()).await.unwrap();
        assert_eq!(b.next().await.unwrap().unwrap(), "from offerer");
        b.send("from answerer".to_string()).await.unwrap();
        assert_eq!(a.next().await.unwrap().unwrap(), "from answerer");

        assert_eq!(offerer.state(), ConnectionState::Connected);
        assert_eq!(answerer.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_offerer_waits_for_answer() {
        let transport = net();
        let mut offerer = Negotiation::create_offer(transport.clone(), false)
            .await
            .unwrap();
        let answerer =
            Negotiation::accept_offer(transport, offerer.local_description().clone()).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(100), offerer.connected()).await;
        assert!(pending.is_err(), "must not connect before the answer is applied");
        drop(answerer);
    }

    #[tokio::test]
    async fn test_wrong_answer_is_not_accepted() {
        let transport = net();
        let mut offerer = Negotiation::create_offer(transport.clone(), false)
            .await
            .unwrap();
        let _answerer =
            Negotiation::accept_offer(transport.clone(), offerer.local_description().clone())
                .unwrap();
        let stranger =
            Negotiation::accept_offer(transport, offerer.local_description().clone()).unwrap();

        // Apply an answer from a negotiation that never dialed first
        offerer
            .set_remote_description(stranger.local_description().clone())
            .unwrap();
        drop(stranger);

        let result = tokio::time::timeout(Duration::from_millis(200), offerer.connected()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_trickled_candidates() {
        let transport = net();
        let mut offerer = Negotiation::create_offer(transport.clone(), true)
            .await
            .unwrap();
        assert!(offerer.local_description().candidates.is_empty());
        assert_eq!(offerer.gathered_candidates().len(), 1);

        let mut answerer =
            Negotiation::accept_offer(transport, offerer.local_description().clone()).unwrap();
        offerer
            .set_remote_description(answerer.local_description().clone())
            .unwrap();

        answerer
            .add_remote_candidate(Candidate::new("mem", 9999))
            .unwrap();
        for c in offerer.gathered_candidates().to_vec() {
            answerer.add_remote_candidate(c).unwrap();
        }

        let (a, b) = tokio::join!(offerer.connected(), answerer.connected());
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_candidates_fail() {
        let transport = net();
        let offer = SessionDescription {
            kind: DescriptionKind::Offer,
            session: "x".to_string(),
            candidates: vec![Candidate::new("mem", 424242)],
        };
        let mut answerer = Negotiation::accept_offer(transport, offer).unwrap();
        assert!(matches!(
            answerer.connected().await,
            Err(PeerError::Transport(_))
        ));
        assert_eq!(answerer.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_role_checks() {
        let transport = net();
        let offerer = Negotiation::create_offer(transport.clone(), false)
            .await
            .unwrap();
        assert!(offerer
            .set_remote_description(offerer.local_description().clone())
            .is_err());
        assert!(offerer
            .add_remote_candidate(Candidate::new("mem", 1))
            .is_err());

        let answerer =
            Negotiation::accept_offer(transport.clone(), offerer.local_description().clone())
                .unwrap();
        assert!(Negotiation::accept_offer(transport, answerer.local_description().clone()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_dialer_does_not_block_accept() {
        let transport = net();
        let mut offerer = Negotiation::create_offer(transport.clone(), false)
            .await
            .unwrap();
        let candidate = offerer.local_description().candidates[0].clone();

        // Connects first and never says anything
        let _silent = transport.dial(&candidate).await.unwrap();

        let mut answerer =
            Negotiation::accept_offer(transport, offerer.local_description().clone()).unwrap();
        offerer
            .set_remote_description(answerer.local_description().clone())
            .unwrap();

        let (a, b) = tokio::time::timeout(HELLO_TIMEOUT * 3, async {
            tokio::join!(offerer.connected(), answerer.connected())
        })
        .await
        .expect("silent stream held up the accept loop");
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_close_marks_closed() {
        let mut offerer = Negotiation::create_offer(net(), false).await.unwrap();
        offerer.close();
        assert_eq!(offerer.state(), ConnectionState::Closed);
        assert!(offerer.connected().await.is_err());
    }
}
