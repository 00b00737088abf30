//! Reference flooding broadcast.
//!
//! The [`Flooder`] is the sample application of the membership layer: it
//! implements [`MeshCallback`] and floods every payload across the overlay
//! exactly once per node.
//!
//! Each broadcast travels as `origin-id(6) ‖ payload`. A node receiving a
//! flood frame computes the 20-byte SHA-1 of `payload ‖ encoded-origin-id`
//! and membership-tests it against a bounded LRU set: a fresh id is handed
//! to the local consumer and re-sent to every active peer except the link
//! it arrived on; a known id is dropped. Keying on the originator rather
//! than the immediate sender keeps delivery at-most-once even when a
//! message reaches a node over several paths.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::debug;

use crate::node::Node;
use crate::protocols::MeshCallback;
use crate::wire::{NodeId, ID_LEN};

/// Bound on remembered message ids. Old entries age out LRU-fashion, so a
/// long-lived node cannot grow the set without limit.
const SEEN_CAPACITY: usize = 16 * 1024;

const DELIVER_CHANNEL_CAPACITY: usize = 256;
const RELAY_CHANNEL_CAPACITY: usize = 1024;

/// SHA-1 of `payload ‖ encoded-origin-id`.
type MessageId = [u8; 20];

/// A payload delivered by the flood layer, tagged with its originator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloodMessage {
    pub origin: NodeId,
    pub payload: Vec<u8>,
}

struct RelayJob {
    /// Link the frame arrived on; `None` for locally originated floods.
    skip: Option<NodeId>,
    body: Vec<u8>,
}

/// Flooding broadcast endpoint.
///
/// Create it first, hand it to [`Node::bind`](Node::bind) as the callback,
/// then [`attach`](Flooder::attach) the node handle so the flooder can
/// reach the active view.
pub struct Flooder {
    node: OnceLock<Node>,
    seen: Mutex<LruCache<MessageId, ()>>,
    deliver_tx: mpsc::Sender<FloodMessage>,
    relay_tx: mpsc::Sender<RelayJob>,
    relay_rx: Mutex<Option<mpsc::Receiver<RelayJob>>>,
}

impl Flooder {
    /// Create a flooder and the receiver its deliveries arrive on.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<FloodMessage>) {
        let (deliver_tx, deliver_rx) = mpsc::channel(DELIVER_CHANNEL_CAPACITY);
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let cap = NonZeroUsize::new(SEEN_CAPACITY).expect("capacity must be non-zero");
        let flooder = Flooder {
            node: OnceLock::new(),
            seen: Mutex::new(LruCache::new(cap)),
            deliver_tx,
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
        };
        (Arc::new(flooder), deliver_rx)
    }

    /// Wire the node handle in and start the relay worker. Called once,
    /// after the node is bound; later calls are ignored.
    pub fn attach(&self, node: Node) {
        if self.node.set(node.clone()).is_err() {
            debug!("flooder is already attached");
            return;
        }
        let rx = self.relay_rx.lock().expect("relay receiver lock poisoned").take();
        if let Some(rx) = rx {
            tokio::spawn(relay_loop(node, rx));
        }
    }

    /// Flood a payload to the overlay. The local consumer does not receive
    /// its own broadcasts.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        let node = self.node.get().context("flooder is not attached to a node")?;
        let origin = node.self_id();
        let mid = message_id(&payload, &origin);
        self.remember(mid);

        let mut body = Vec::with_capacity(ID_LEN + payload.len());
        body.extend_from_slice(&origin.encode());
        body.extend_from_slice(&payload);
        let _ = self.relay_tx.send(RelayJob { skip: None, body }).await;
        Ok(())
    }

    /// Record a message id; returns `true` when it was not known before.
    fn remember(&self, mid: MessageId) -> bool {
        self.seen.lock().expect("seen set lock poisoned").put(mid, ()).is_none()
    }
}

#[async_trait]
impl MeshCallback for Flooder {
    async fn link_up(&self, peer: NodeId) {
        debug!(%peer, "flood link up");
    }

    async fn link_down(&self, peer: NodeId) {
        debug!(%peer, "flood link down");
    }

    async fn deliver(&self, from: NodeId, payload: Vec<u8>) {
        if payload.len() < ID_LEN {
            debug!(peer = %from, len = payload.len(), "malformed flood frame");
            return;
        }
        let origin = NodeId::decode(&payload[..ID_LEN]);
        let data = payload[ID_LEN..].to_vec();
        if !self.remember(message_id(&data, &origin)) {
            return;
        }

        let msg = FloodMessage { origin, payload: data };
        if self.deliver_tx.send(msg).await.is_err() {
            debug!("flood consumer dropped");
        }
        let _ = self.relay_tx.send(RelayJob { skip: Some(from), body: payload }).await;
    }
}

/// Fan relayed frames out to the active view. Runs apart from the
/// connection tasks so a slow peer never stalls the link a frame arrived
/// on.
async fn relay_loop(node: Node, mut rx: mpsc::Receiver<RelayJob>) {
    while let Some(job) = rx.recv().await {
        for peer in node.peers().await {
            if Some(peer.id) == job.skip {
                continue;
            }
            if let Err(e) = peer.conn.send(job.body.clone()).await {
                debug!(peer = %peer.id, error = %e, "flood relay failed");
            }
        }
    }
}

fn message_id(payload: &[u8], origin: &NodeId) -> MessageId {
    let mut hasher = Sha1::new();
    hasher.update(payload);
    hasher.update(origin.encode());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(n: u8, port: u16) -> NodeId {
        NodeId::new(Ipv4Addr::new(127, 0, 0, n), port)
    }

    fn flood_body(origin: NodeId, payload: &[u8]) -> Vec<u8> {
        let mut body = origin.encode().to_vec();
        body.extend_from_slice(payload);
        body
    }

    #[test]
    fn message_ids_depend_on_payload_and_origin() {
        let a = id(1, 7001);
        let b = id(1, 7002);
        assert_eq!(message_id(b"x", &a), message_id(b"x", &a));
        assert_ne!(message_id(b"x", &a), message_id(b"y", &a));
        assert_ne!(message_id(b"x", &a), message_id(b"x", &b));
    }

    #[tokio::test]
    async fn duplicate_payload_is_delivered_once() {
        let (flooder, mut rx) = Flooder::new();
        let origin = id(1, 7001);
        let body = flood_body(origin, b"hello");

        // Same flood arriving over two different links.
        flooder.deliver(id(2, 7002), body.clone()).await;
        flooder.deliver(id(3, 7003), body).await;

        let msg = rx.try_recv().expect("first copy should be delivered");
        assert_eq!(msg.origin, origin);
        assert_eq!(msg.payload, b"hello");
        assert!(rx.try_recv().is_err(), "second copy must be deduplicated");
    }

    #[tokio::test]
    async fn distinct_origins_are_distinct_messages() {
        let (flooder, mut rx) = Flooder::new();
        let body_a = flood_body(id(1, 7001), b"hello");
        let body_b = flood_body(id(4, 7004), b"hello");

        flooder.deliver(id(2, 7002), body_a).await;
        flooder.deliver(id(2, 7002), body_b).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn short_frame_is_ignored() {
        let (flooder, mut rx) = Flooder::new();
        flooder.deliver(id(2, 7002), vec![1, 2, 3]).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_requires_an_attached_node() {
        let (flooder, _rx) = Flooder::new();
        assert!(flooder.broadcast(b"hello".to_vec()).await.is_err());
    }
}
