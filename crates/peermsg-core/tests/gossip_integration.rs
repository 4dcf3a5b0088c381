//! Gossip Replication Integration Tests
//!
//! Multi-node topologies over the in-memory network:
//! - a chain A - B - C where B relays between friends who never paired
//! - a triangle where every node hears the same message twice
//! - a node that drops its first friend and meets a second one later

use std::sync::Arc;
use std::time::Duration;

use peermsg_core::storage::{MemoryStore, Store};
use peermsg_core::{
    ChannelState, Config, MemoryNetwork, Message, Messenger, PeerEvent, WireFrame,
};
use tokio::sync::broadcast;

// ============================================================================
// Test Utilities
// ============================================================================

struct TestNode {
    messenger: Messenger,
    store: Arc<MemoryStore>,
}

impl TestNode {
    async fn new(net: &MemoryNetwork, name: &str) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let config = Config {
            display_name: name.to_string(),
            ..Config::default()
        };
        let messenger =
            Messenger::with_parts(store.clone(), config, Arc::new(net.clone()), None).await?;
        Ok(Self { messenger, store })
    }

    fn fp(&self) -> String {
        self.messenger.fingerprint().to_string()
    }

    fn stored(&self, message: &Message) -> Option<Message> {
        self.store.load_message(&message.id).ok().flatten()
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("Timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn pair(a: &TestNode, b: &TestNode) -> anyhow::Result<()> {
    let offer = a.messenger.create_invite().await?;
    let answer = b.messenger.accept_invite(&offer).await?;
    a.messenger.complete_invite(&answer).await?;

    let (fa, fb) = (a.fp(), b.fp());
    eventually("both channels", || {
        a.messenger.supervisor().state_of(&fb) == Some(ChannelState::Connected)
            && b.messenger.supervisor().state_of(&fa) == Some(ChannelState::Connected)
    })
    .await
}

/// Count `MessageStored` events seen within `window`
async fn stored_events(rx: &mut broadcast::Receiver<PeerEvent>, window: Duration) -> usize {
    let mut count = 0;
    let _ = tokio::time::timeout(window, async {
        while let Ok(event) = rx.recv().await {
            if matches!(event, PeerEvent::MessageStored { .. }) {
                count += 1;
            }
        }
    })
    .await;
    count
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_chain_relays_through_middle_node() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "A").await?;
    let b = TestNode::new(&net, "B").await?;
    let c = TestNode::new(&net, "C").await?;
    pair(&a, &b).await?;
    pair(&b, &c).await?;

    let msg = a.messenger.send_text("over the hill")?;

    eventually("message at C", || c.stored(&msg).is_some()).await?;

    let at_b = b.stored(&msg).expect("B stored the message");
    assert!(at_b.delivered_to.contains(&a.fp()));

    let at_c = c.stored(&msg).expect("C stored the message");
    assert_eq!(at_c.sender_fingerprint, a.fp());
    assert!(at_c.delivered_to.contains(&b.fp()));
    assert!(at_c.seen_by(&a.fp()));
    assert!(at_c.seen_by(&c.fp()));
    Ok(())
}

#[tokio::test]
async fn test_no_forward_back_to_sender() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "A").await?;
    let b = TestNode::new(&net, "B").await?;
    let c = TestNode::new(&net, "C").await?;
    pair(&a, &b).await?;
    pair(&b, &c).await?;

    let mut a_events = a.messenger.subscribe();
    let msg = a.messenger.send_text("one way")?;
    eventually("message at C", || c.stored(&msg).is_some()).await?;

    // Nothing echoes back to A: its copy never gains a delivery mark
    assert_eq!(stored_events(&mut a_events, Duration::from_millis(200)).await, 1);
    let at_a = a.stored(&msg).expect("A kept its own message");
    assert!(at_a.delivered_to.is_empty());
    assert_eq!(a.store.message_count()?, 1);
    Ok(())
}

#[tokio::test]
async fn test_triangle_stores_each_message_once() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "A").await?;
    let b = TestNode::new(&net, "B").await?;
    let c = TestNode::new(&net, "C").await?;
    pair(&a, &b).await?;
    pair(&b, &c).await?;
    pair(&a, &c).await?;

    let mut c_events = c.messenger.subscribe();
    let msg = a.messenger.send_text("everyone")?;

    eventually("message at B and C", || {
        b.stored(&msg).is_some() && c.stored(&msg).is_some()
    })
    .await?;
    assert_eq!(stored_events(&mut c_events, Duration::from_millis(200)).await, 1);
    assert_eq!(c.store.message_count()?, 1);

    // C heard it from A directly and possibly again through B
    let at_c = c.stored(&msg).expect("stored");
    assert!(at_c.delivered_to.contains(&a.fp()));
    Ok(())
}

#[tokio::test]
async fn test_late_friend_catches_up_through_have() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "A").await?;
    let b = TestNode::new(&net, "B").await?;
    let c = TestNode::new(&net, "C").await?;
    pair(&a, &b).await?;

    let early = a.messenger.send_text("before C joined")?;
    eventually("message at B", || b.stored(&early).is_some()).await?;

    // C only ever talks to B, and gets A's message from B's inventory
    pair(&b, &c).await?;
    eventually("backfill at C", || c.stored(&early).is_some()).await?;
    Ok(())
}

#[tokio::test]
async fn test_known_message_is_stored_once_after_reconnect() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, "A").await?;
    let b = TestNode::new(&net, "B").await?;
    let c = TestNode::new(&net, "C").await?;
    pair(&a, &b).await?;

    let m1 = a.messenger.send_text("m1")?;
    eventually("m1 at B", || b.stored(&m1).is_some()).await?;

    // B goes away, then C meets A and gets m1 through A's inventory
    let (fa, fb, fc) = (a.fp(), b.fp(), c.fp());
    b.messenger.supervisor().close(&fa)?;
    eventually("A notices", || {
        a.messenger.supervisor().state_of(&fb) != Some(ChannelState::Connected)
    })
    .await?;
    pair(&a, &c).await?;
    eventually("m1 at C", || c.stored(&m1).is_some()).await?;

    // B and C meet; both already hold m1, so the have exchange moves nothing
    let mut a_events = a.messenger.subscribe();
    let mut b_events = b.messenger.subscribe();
    let mut c_events = c.messenger.subscribe();
    pair(&b, &c).await?;
    assert_eq!(stored_events(&mut b_events, Duration::from_millis(200)).await, 0);
    assert_eq!(stored_events(&mut c_events, Duration::from_millis(200)).await, 0);
    assert_eq!(b.store.message_count()?, 1);
    assert_eq!(c.store.message_count()?, 1);
    let at_c = c.stored(&m1).expect("C stored m1");
    assert_eq!(at_c.delivered_to.iter().collect::<Vec<_>>(), vec![&fa]);

    // B pushes m1 to C anyway, twice
    let copy = b.stored(&m1).expect("B stored m1").forwarded_to(&fc);
    for _ in 0..2 {
        b.messenger
            .supervisor()
            .send_frame(&fc, &WireFrame::Chat(copy.clone()))?;
    }
    eventually("C records B as a deliverer", || {
        c.stored(&m1)
            .map(|m| m.delivered_to.contains(&fb))
            .unwrap_or(false)
    })
    .await?;

    assert_eq!(stored_events(&mut c_events, Duration::from_millis(200)).await, 0);
    assert_eq!(c.store.message_count()?, 1);
    let at_c = c.stored(&m1).expect("C stored m1");
    assert_eq!(at_c.delivered_to.len(), 2);
    assert!(at_c.delivered_to.contains(&fa) && at_c.delivered_to.contains(&fb));

    // The duplicate is merged, not forwarded on to A
    assert_eq!(stored_events(&mut a_events, Duration::from_millis(200)).await, 0);
    assert_eq!(a.store.message_count()?, 1);
    assert!(a.stored(&m1).expect("A kept m1").delivered_to.is_empty());
    Ok(())
}
