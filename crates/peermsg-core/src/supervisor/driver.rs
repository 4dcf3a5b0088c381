//! Signaling-driven renegotiation for one friend
//!
//! Runs as a single task per friend while a relay is configured. It owns the
//! signaling session, at most one pending negotiation, and at most one retry
//! timer. Renegotiation starts when:
//! - the relay link comes up and the channel is not connected (hello, offer)
//! - the friend offers (answer)
//! - the friend says hello while the channel is idle (offer)
//! - the channel fails or drops (offer after backoff)
//!
//! When both sides offer at once, the side with the smaller fingerprint is
//! polite: it abandons its own offer and answers. The other side ignores the
//! colliding offer.

use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::channel::ChannelState;
use super::Inner;
use crate::error::{PeerError, PeerResult};
use crate::signaling::{SignalEvent, SignalKind, SignalMessage, SignalingClient};
use crate::transport::{Link, Negotiation, TaskGuard};

/// Notifications from the supervisor to a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverCommand {
    /// A link was installed by any path
    LinkInstalled,
    /// The installed link dropped
    LinkLost,
}

/// Handle kept in the registry; dropping it stops the driver.
pub(crate) struct DriverHandle {
    pub(crate) commands: mpsc::UnboundedSender<DriverCommand>,
    _task: TaskGuard,
}

struct Pending {
    negotiation: Negotiation,
    link: BoxFuture<'static, PeerResult<Link>>,
}

pub(crate) struct Driver {
    inner: Weak<Inner>,
    peer: String,
    polite: bool,
    signaling: SignalingClient,
    backoff: Backoff,
    pending: Option<Pending>,
    retry: Option<Pin<Box<Sleep>>>,
    connected: bool,
}

impl Driver {
    /// Spawn the driver for `peer`.
    pub(crate) fn spawn(
        inner: &Arc<Inner>,
        peer: String,
        signaling: SignalingClient,
        connected: bool,
    ) -> DriverHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            inner: Arc::downgrade(inner),
            polite: inner.identity.fingerprint() < peer.as_str(),
            peer,
            signaling,
            backoff: Backoff::from_config(&inner.config),
            pending: None,
            retry: None,
            connected,
        };
        DriverHandle {
            commands,
            _task: TaskGuard(tokio::spawn(driver.run(rx))),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DriverCommand>) {
        loop {
            tokio::select! {
                // Link changes first so a fresh link is known before signals
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => return,
                },
                event = self.signaling.recv() => match event {
                    Some(event) => self.on_signal(event).await,
                    None => return,
                },
                result = wait_pending(&mut self.pending) => self.on_link_result(result),
                _ = wait_retry(&mut self.retry) => {
                    self.retry = None;
                    if !self.connected && self.pending.is_none() {
                        self.start_offer().await;
                    }
                }
            }
        }
    }

    fn on_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::LinkInstalled => {
                self.connected = true;
                self.backoff.reset();
                self.retry = None;
                self.pending = None;
            }
            DriverCommand::LinkLost => {
                self.connected = false;
                self.schedule_retry();
            }
        }
    }

    async fn on_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::RelayConnected => {
                self.signaling.send(SignalKind::Hello);
                if !self.connected && self.pending.is_none() {
                    self.start_offer().await;
                }
            }
            SignalEvent::RelayDisconnected => {
                debug!(peer = %self.peer, "Signaling relay down, queueing");
            }
            SignalEvent::Message(msg) => self.on_message(msg).await,
        }
    }

    /// Handle one control message from the friend.
    ///
    /// A `hello` only starts an offer while the channel is down and nothing
    /// is pending. A connected side never re-offers on `hello`: a peer that
    /// lost its link is itself disconnected and sends its own offer, and
    /// answering that offer replaces our half-open link.
    async fn on_message(&mut self, msg: SignalMessage) {
        if msg.sender_fingerprint != self.peer {
            warn!(peer = %self.peer, sender = %msg.sender_fingerprint, "Signal from unexpected sender");
            return;
        }

        match msg.kind {
            SignalKind::Hello => {
                if !self.connected && self.pending.is_none() {
                    self.start_offer().await;
                }
            }
            SignalKind::Offer { description } => {
                if let Some(pending) = &self.pending {
                    if pending.negotiation.is_offerer() {
                        if !self.polite {
                            debug!(peer = %self.peer, "Ignoring colliding offer");
                            return;
                        }
                        debug!(peer = %self.peer, "Offer collision, yielding");
                    }
                }
                self.answer(description);
            }
            SignalKind::Answer {
                description,
                in_reply_to,
            } => {
                let Some(pending) = &self.pending else {
                    return;
                };
                if !pending.negotiation.is_offerer()
                    || pending.negotiation.local_description().session != in_reply_to
                {
                    debug!(peer = %self.peer, "Ignoring stale answer");
                    return;
                }
                if let Err(e) = pending.negotiation.set_remote_description(description) {
                    warn!(peer = %self.peer, error = %e, "Could not apply answer");
                }
            }
            SignalKind::Candidate { candidate, session } => {
                let Some(pending) = &self.pending else {
                    return;
                };
                let matches = pending
                    .negotiation
                    .remote_description()
                    .map(|d| d.session == session)
                    .unwrap_or(false);
                if pending.negotiation.is_offerer() || !matches {
                    return;
                }
                if let Err(e) = pending.negotiation.add_remote_candidate(candidate) {
                    debug!(peer = %self.peer, error = %e, "Candidate not applied");
                }
            }
        }
    }

    fn answer(&mut self, offer: crate::transport::SessionDescription) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let offer_session = offer.session.clone();
        let mut negotiation = match Negotiation::accept_offer(inner.transport.clone(), offer) {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Could not answer offer");
                return;
            }
        };

        self.signaling.send(SignalKind::Answer {
            description: negotiation.local_description().clone(),
            in_reply_to: offer_session,
        });
        debug!(peer = %self.peer, "Answer sent");
        self.begin(&inner, negotiation_link(&mut negotiation, &inner), negotiation);
    }

    async fn start_offer(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut negotiation = match Negotiation::create_offer(inner.transport.clone(), true).await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Could not create offer");
                inner.set_state(&self.peer, ChannelState::Failed);
                self.schedule_retry();
                return;
            }
        };

        let session = negotiation.local_description().session.clone();
        self.signaling.send(SignalKind::Offer {
            description: negotiation.local_description().clone(),
        });
        for candidate in negotiation.gathered_candidates() {
            self.signaling.send(SignalKind::Candidate {
                candidate: candidate.clone(),
                session: session.clone(),
            });
        }
        debug!(peer = %self.peer, "Offer sent");
        self.begin(&inner, negotiation_link(&mut negotiation, &inner), negotiation);
    }

    fn begin(
        &mut self,
        inner: &Arc<Inner>,
        link: Option<BoxFuture<'static, PeerResult<Link>>>,
        negotiation: Negotiation,
    ) {
        let Some(link) = link else {
            return;
        };
        self.pending = Some(Pending { negotiation, link });
        if !self.connected {
            inner.set_state(&self.peer, ChannelState::Connecting);
        }
    }

    fn on_link_result(&mut self, result: PeerResult<Link>) {
        self.pending = None;
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match result {
            Ok(link) => {
                info!(peer = %self.peer, "Channel renegotiated");
                if let Err(e) = inner.install_link(&self.peer, link) {
                    warn!(peer = %self.peer, error = %e, "Could not install link");
                }
            }
            Err(e) => {
                if self.connected {
                    debug!(peer = %self.peer, error = %e, "Spare negotiation failed");
                    return;
                }
                warn!(peer = %self.peer, error = %e, "Negotiation failed");
                inner.set_state(&self.peer, ChannelState::Failed);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }
        let delay = self.backoff.next_delay();
        info!(peer = %self.peer, ?delay, "Reconnect scheduled");
        self.retry = Some(Box::pin(tokio::time::sleep(delay)));
    }
}

/// The link future of a fresh negotiation, bounded by the configured timeout.
fn negotiation_link(
    negotiation: &mut Negotiation,
    inner: &Inner,
) -> Option<BoxFuture<'static, PeerResult<Link>>> {
    let timeout = inner.config.negotiation_timeout();
    let link = negotiation.link_future().ok()?;
    Some(
        async move {
            tokio::time::timeout(timeout, link)
                .await
                .map_err(|_| PeerError::Transport("negotiation timed out".to_string()))?
        }
        .boxed(),
    )
}

async fn wait_pending(pending: &mut Option<Pending>) -> PeerResult<Link> {
    match pending {
        Some(p) => (&mut p.link).await,
        None => std::future::pending().await,
    }
}

async fn wait_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
