//! Relay session for one friend pair

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SignalKind, SignalMessage};
use crate::crypto::SessionKey;
use crate::relay::{RelayConnector, RelayLink};
use crate::supervisor::Backoff;
use crate::transport::TaskGuard;

/// What a signaling session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// The relay link is (re)established and queued messages were flushed
    RelayConnected,
    /// The relay link dropped; outbound messages queue until it returns
    RelayDisconnected,
    /// A control message from the friend
    Message(SignalMessage),
}

/// Most control messages held while the relay is unreachable
pub const MAX_QUEUED: usize = 64;

/// A persistent, self-healing connection to a pair's relay room.
///
/// Messages passed to [`send`](Self::send) are delivered in order. While the
/// relay is unreachable they are queued, and a newer offer, answer or hello
/// replaces the queued ones it supersedes. Frames that fail to open and our
/// own echoes are dropped.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalKind>,
    events: mpsc::UnboundedReceiver<SignalEvent>,
    _task: TaskGuard,
}

impl SignalingClient {
    /// Start the session task.
    pub fn start(
        connector: Arc<dyn RelayConnector>,
        room: String,
        key: SessionKey,
        my_fingerprint: String,
        backoff: Backoff,
    ) -> Self {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let session = Session {
            connector,
            room,
            key,
            my_fingerprint,
            backoff,
            queue: VecDeque::new(),
            events: events_tx,
        };
        let task = tokio::spawn(session.run(commands));

        Self {
            outbound,
            events,
            _task: TaskGuard(task),
        }
    }

    /// Queue a control message for the friend.
    pub fn send(&self, kind: SignalKind) {
        let _ = self.outbound.send(kind);
    }

    /// Next event; `None` once the session has stopped.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.events.recv().await
    }
}

struct Session {
    connector: Arc<dyn RelayConnector>,
    room: String,
    key: SessionKey,
    my_fingerprint: String,
    backoff: Backoff,
    queue: VecDeque<SignalKind>,
    events: mpsc::UnboundedSender<SignalEvent>,
}

enum Outcome {
    LinkLost,
    Stopped,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SignalKind>) {
        loop {
            match self.connector.connect(&self.room).await {
                Ok(link) => {
                    self.backoff.reset();
                    info!(room = %self.room, queued = self.queue.len(), "Relay connected");
                    match self.serve(link, &mut commands).await {
                        Outcome::Stopped => return,
                        Outcome::LinkLost => {
                            if self.events.send(SignalEvent::RelayDisconnected).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!(room = %self.room, error = %e, "Relay connection failed"),
            }

            // Keep queueing while we wait to reconnect
            let delay = self.backoff.next_delay();
            debug!(room = %self.room, ?delay, "Relay retry scheduled");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = commands.recv() => match cmd {
                        Some(kind) => self.enqueue(kind),
                        None => return,
                    },
                }
            }
        }
    }

    async fn serve(
        &mut self,
        mut link: RelayLink,
        commands: &mut mpsc::UnboundedReceiver<SignalKind>,
    ) -> Outcome {
        while let Some(kind) = self.queue.pop_front() {
            let Some(frame) = self.seal(&kind) else {
                continue;
            };
            if link.outgoing.send(frame).is_err() {
                self.queue.push_front(kind);
                return Outcome::LinkLost;
            }
        }
        if self.events.send(SignalEvent::RelayConnected).is_err() {
            return Outcome::Stopped;
        }

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(kind) = cmd else {
                        return Outcome::Stopped;
                    };
                    if let Some(frame) = self.seal(&kind) {
                        if link.outgoing.send(frame).is_err() {
                            self.enqueue(kind);
                            return Outcome::LinkLost;
                        }
                    }
                }
                frame = link.incoming.recv() => {
                    let Some(text) = frame else {
                        warn!(room = %self.room, "Relay link closed");
                        return Outcome::LinkLost;
                    };
                    self.deliver(&text);
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        match SignalMessage::open(text, &self.key) {
            Ok(msg) if msg.sender_fingerprint == self.my_fingerprint => {}
            Ok(msg) => {
                debug!(kind = msg.kind.name(), "Signal received");
                let _ = self.events.send(SignalEvent::Message(msg));
            }
            Err(e) => warn!(room = %self.room, error = %e, "Dropping undecodable signal"),
        }
    }

    fn seal(&self, kind: &SignalKind) -> Option<String> {
        let msg = SignalMessage {
            kind: kind.clone(),
            sender_fingerprint: self.my_fingerprint.clone(),
        };
        match msg.seal(&self.key) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "Failed to seal signal");
                None
            }
        }
    }

    fn enqueue(&mut self, kind: SignalKind) {
        match &kind {
            // An offer starts a new negotiation; older offers and their
            // candidates are dead
            SignalKind::Offer { .. } => self
                .queue
                .retain(|k| !matches!(k, SignalKind::Offer { .. } | SignalKind::Candidate { .. })),
            SignalKind::Answer { .. } => {
                self.queue.retain(|k| !matches!(k, SignalKind::Answer { .. }))
            }
            SignalKind::Hello => self.queue.retain(|k| *k != SignalKind::Hello),
            SignalKind::Candidate { .. } => {}
        }
        if self.queue.len() >= MAX_QUEUED {
            if let Some(dropped) = self.queue.pop_front() {
                debug!(room = %self.room, kind = dropped.name(), "Signal queue full");
            }
        }
        self.queue.push_back(kind);
    }
}
