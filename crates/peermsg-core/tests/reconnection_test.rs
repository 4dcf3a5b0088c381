//! Reconnection Tests
//!
//! Verify relay-assisted renegotiation after a channel is lost:
//! 1. A node restarts and its friend reconnects through the relay
//! 2. Messages written while apart are backfilled once the channel is back
//! 3. Without a relay, or after an explicit close, nothing is retried
//!
//! Backoff and negotiation timeouts are shortened so the tests run in
//! well under a second of real time.

use std::sync::Arc;
use std::time::Duration;

use peermsg_core::relay::RelayConnector;
use peermsg_core::storage::{MemoryStore, Store};
use peermsg_core::{ChannelState, Config, MemoryNetwork, MemoryRelay, Messenger, PeerEvent};

// ============================================================================
// Test Utilities
// ============================================================================

fn fast_config(name: &str) -> Config {
    Config {
        display_name: name.to_string(),
        reconnect_min_ms: 20,
        reconnect_max_ms: 200,
        negotiation_timeout_ms: 1_000,
        ..Config::default()
    }
}

/// A node whose store outlives restarts
struct TestContext {
    name: String,
    store: Arc<MemoryStore>,
    net: MemoryNetwork,
    relay: Option<MemoryRelay>,
}

impl TestContext {
    fn new(name: &str, net: &MemoryNetwork, relay: Option<&MemoryRelay>) -> Self {
        Self {
            name: name.to_string(),
            store: Arc::new(MemoryStore::new()),
            net: net.clone(),
            relay: relay.cloned(),
        }
    }

    async fn start(&self) -> anyhow::Result<Messenger> {
        let relay = self
            .relay
            .clone()
            .map(|r| Arc::new(r) as Arc<dyn RelayConnector>);
        Ok(Messenger::with_parts(
            self.store.clone(),
            fast_config(&self.name),
            Arc::new(self.net.clone()),
            relay,
        )
        .await?)
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("Timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

fn connected(node: &Messenger, peer: &str) -> bool {
    node.supervisor().state_of(peer) == Some(ChannelState::Connected)
}

async fn pair(a: &Messenger, b: &Messenger) -> anyhow::Result<()> {
    let offer = a.create_invite().await?;
    let answer = b.accept_invite(&offer).await?;
    a.complete_invite(&answer).await?;
    let (fa, fb) = (a.fingerprint().to_string(), b.fingerprint().to_string());
    eventually("pairing", || connected(a, &fb) && connected(b, &fa)).await
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_reconnects_after_restart() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let relay = MemoryRelay::new();
    let alice_ctx = TestContext::new("Alice", &net, Some(&relay));
    let bob_ctx = TestContext::new("Bob", &net, Some(&relay));

    let alice = alice_ctx.start().await?;
    let bob = bob_ctx.start().await?;
    pair(&alice, &bob).await?;
    let fa = alice.fingerprint().to_string();
    let fb = bob.fingerprint().to_string();

    let mut alice_events = alice.subscribe();
    drop(bob);
    eventually("alice notices", || !connected(&alice, &fb)).await?;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PeerEvent::ChannelClosed { peer }) = alice_events.recv().await {
                return peer;
            }
        }
    })
    .await?;
    assert_eq!(closed, fb);

    // Same store, same identity, fresh process
    let bob = bob_ctx.start().await?;
    assert_eq!(bob.fingerprint(), fb);
    eventually("renegotiated channel", || {
        connected(&alice, &fb) && connected(&bob, &fa)
    })
    .await?;

    let msg = alice.send_text("welcome back")?;
    eventually("message after reconnect", || {
        bob.messages(10)
            .map(|m| m.iter().any(|x| x.id == msg.id))
            .unwrap_or(false)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_messages_written_apart_are_backfilled() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let relay = MemoryRelay::new();
    let alice_ctx = TestContext::new("Alice", &net, Some(&relay));
    let bob_ctx = TestContext::new("Bob", &net, Some(&relay));

    let alice = alice_ctx.start().await?;
    let bob = bob_ctx.start().await?;
    pair(&alice, &bob).await?;
    let fb = bob.fingerprint().to_string();

    drop(bob);
    eventually("alice notices", || !connected(&alice, &fb)).await?;
    let missed = alice.send_text("you were away")?;
    assert!(missed.delivered_to.is_empty());

    let bob = bob_ctx.start().await?;
    eventually("backfill", || {
        bob.messages(10)
            .map(|m| m.iter().any(|x| x.id == missed.id))
            .unwrap_or(false)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_relay_outage_delays_but_does_not_prevent_reconnect() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let relay = MemoryRelay::new();
    let alice_ctx = TestContext::new("Alice", &net, Some(&relay));
    let bob_ctx = TestContext::new("Bob", &net, Some(&relay));

    let alice = alice_ctx.start().await?;
    let bob = bob_ctx.start().await?;
    pair(&alice, &bob).await?;
    let fa = alice.fingerprint().to_string();
    let fb = bob.fingerprint().to_string();

    relay.set_offline(true);
    relay.drop_connections();
    drop(bob);
    eventually("alice notices", || !connected(&alice, &fb)).await?;

    let bob = bob_ctx.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!connected(&bob, &fa));

    relay.set_offline(false);
    eventually("channel after outage", || {
        connected(&alice, &fb) && connected(&bob, &fa)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_without_relay_lost_channel_stays_down() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let alice_ctx = TestContext::new("Alice", &net, None);
    let bob_ctx = TestContext::new("Bob", &net, None);

    let alice = alice_ctx.start().await?;
    let bob = bob_ctx.start().await?;
    pair(&alice, &bob).await?;
    let fb = bob.fingerprint().to_string();

    drop(bob);
    eventually("disconnect", || {
        alice.supervisor().state_of(&fb) == Some(ChannelState::Disconnected)
    })
    .await?;

    let _bob = bob_ctx.start().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        alice.supervisor().state_of(&fb),
        Some(ChannelState::Disconnected)
    );
    Ok(())
}

#[tokio::test]
async fn test_closed_channel_is_not_retried() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let relay = MemoryRelay::new();
    let alice_ctx = TestContext::new("Alice", &net, Some(&relay));
    let bob_ctx = TestContext::new("Bob", &net, Some(&relay));

    let alice = alice_ctx.start().await?;
    let bob = bob_ctx.start().await?;
    pair(&alice, &bob).await?;
    let fb = bob.fingerprint().to_string();

    alice.supervisor().close(&fb)?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.supervisor().state_of(&fb), Some(ChannelState::Closed));
    assert!(alice.supervisor().open_peers().is_empty());
    Ok(())
}
