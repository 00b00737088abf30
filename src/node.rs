//! # Membership Node
//!
//! The [`Node`] is the entry point of the membership layer. It owns the
//! active and passive views and drives the HyParView protocol: join and
//! forward-join random walks, periodic shuffles, neighbour promotion, and
//! failure recovery.
//!
//! The node follows the handle/actor pattern: [`Node`] is a cheap-to-clone
//! handle whose methods post commands over a channel, and a private
//! [`NodeActor`] owns all mutable state. The actor processes one event at
//! a time: commands from handles, peer events from connection tasks, and
//! shuffle timer ticks are merged by a single `select!` loop, so the view
//! invariants hold at every await point:
//!
//! - the views are disjoint and never contain the node's own identifier;
//! - `|active| ≤ active_size`, `|passive| ≤ passive_size`;
//! - every active peer has a live connection task;
//! - at most one connection exists per active peer.

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connect::{Connector, NeighbourReply};
use crate::connection::{self, ConnectionHandle, PeerEvent};
use crate::protocols::MeshCallback;
use crate::wire::{NodeId, Priority};

const CMD_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Protocol parameters. The defaults suit a small overlay; tests pin every
/// field explicitly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum size of the active view.
    pub active_size: usize,
    /// Maximum size of the passive view.
    pub passive_size: usize,
    /// Active random walk length: initial TTL of forward-join and shuffle
    /// walks.
    pub arwl: u8,
    /// Passive random walk length: the forwarded TTL at which a walking
    /// forward-join target is copied into the passive view.
    pub prwl: u8,
    /// Active-view sample size for shuffle exchange lists.
    pub k_active: usize,
    /// Passive-view sample size for shuffle exchange lists.
    pub k_passive: usize,
    /// Interval between shuffle ticks. `None` disables periodic shuffles.
    pub shuffle_period: Option<Duration>,
    /// Receive timeout for handshake reads and partially received frames.
    pub timeout: Duration,
    /// Socket write timeout.
    pub send_timeout: Duration,
    /// Outgoing TCP connect timeout.
    pub connect_timeout: Duration,
    /// Seed for the node's random walk and sampling decisions. `None`
    /// seeds from entropy; tests pin it for deterministic scenarios.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_size: 5,
            passive_size: 30,
            arwl: 6,
            prwl: 3,
            k_active: 3,
            k_passive: 4,
            shuffle_period: Some(Duration::from_secs(10)),
            timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            rng_seed: None,
        }
    }
}

/// View-state errors surfaced by node operations.
#[derive(Debug, PartialEq, Eq)]
pub enum MembershipError {
    /// The peer is already in the active view.
    AlreadyInActive,
    /// The peer is not in the active view.
    NotInActive,
}

impl fmt::Display for MembershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipError::AlreadyInActive => write!(f, "peer is already in the active view"),
            MembershipError::NotInActive => write!(f, "peer is not in the active view"),
        }
    }
}

impl std::error::Error for MembershipError {}

/// An active-view entry: an identifier plus the handle of its live
/// connection.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: NodeId,
    pub conn: ConnectionHandle,
}

enum Command {
    JoinCluster(NodeId, oneshot::Sender<Result<()>>),
    Shuffle,
    Disconnect(NodeId, oneshot::Sender<Result<(), MembershipError>>),
    GetPeers(oneshot::Sender<Vec<Peer>>),
    GetPassive(oneshot::Sender<Vec<NodeId>>),
    Stop(oneshot::Sender<()>),
}

// ============================================================================
// Node Handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running membership node.
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    self_id: NodeId,
}

impl Node {
    /// Bind the listener, seed the PRNG, and spawn the node actor. The
    /// node's identifier is the actual bound address, so a port of `0`
    /// picks a free one.
    pub async fn bind(addr: &str, config: Config, target: Arc<dyn MeshCallback>) -> Result<Node> {
        let addr: SocketAddrV4 = addr.parse().context("listen address must be an IPv4 ip:port")?;
        let listener = TcpListener::bind(SocketAddr::V4(addr))
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        let self_id = match listener.local_addr()? {
            SocketAddr::V4(v4) => NodeId::from(v4),
            SocketAddr::V6(_) => anyhow::bail!("listener bound to an IPv6 address"),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let listener_task = tokio::spawn(accept_loop(
            listener,
            event_tx.clone(),
            target.clone(),
            config.clone(),
        ));

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let actor = NodeActor {
            self_id,
            connector: Connector::new(self_id, event_tx, target, config.clone()),
            config,
            active: Vec::new(),
            passive: Vec::new(),
            last_xlist: Vec::new(),
            rng,
            listener: listener_task,
        };
        tokio::spawn(actor.run(cmd_rx, event_rx));

        info!(node = %self_id, "membership node listening");
        Ok(Node { cmd_tx, self_id })
    }

    /// This node's identifier: the address its listener is bound to.
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Join the overlay through `contact`: open a connection, send JOIN,
    /// and install the contact as an active peer.
    pub async fn join_cluster(&self, contact: NodeId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::JoinCluster(contact, tx))
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))?
    }

    /// Force an immediate shuffle tick.
    pub async fn shuffle(&self) {
        let _ = self.cmd_tx.send(Command::Shuffle).await;
    }

    /// Sever an active peer deliberately: send DISCONNECT, close the
    /// connection, and keep the identifier as a passive candidate.
    pub async fn disconnect(&self, peer: NodeId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect(peer, tx))
            .await
            .map_err(|_| anyhow::anyhow!("node actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor closed"))??;
        Ok(())
    }

    /// Snapshot of the active view.
    pub async fn peers(&self) -> Vec<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot of the passive view.
    pub async fn passive_peers(&self) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetPassive(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Disconnect every peer and stop the listener.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "incoming connection");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "failed to set nodelay");
                }
                connection::spawn_incoming(stream, events.clone(), target.clone(), config.clone());
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// ============================================================================
// Node Actor (owns the views)
// ============================================================================

struct NodeActor {
    self_id: NodeId,
    config: Config,
    connector: Connector,
    active: Vec<Peer>,
    passive: Vec<NodeId>,
    /// The exchange list of the most recent shuffle this node originated,
    /// used as the eviction hint when its reply arrives.
    last_xlist: Vec<NodeId>,
    rng: StdRng,
    listener: JoinHandle<()>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::Receiver<PeerEvent>,
    ) {
        let period = self.config.shuffle_period.unwrap_or(Duration::from_secs(3600));
        let mut shuffle_timer = tokio::time::interval(period);
        shuffle_timer.tick().await; // Skip the immediate first tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::JoinCluster(contact, reply)) => {
                            let _ = reply.send(self.join_cluster(contact).await);
                        }
                        Some(Command::Shuffle) => self.do_shuffle().await,
                        Some(Command::Disconnect(id, reply)) => {
                            let _ = reply.send(self.disconnect_peer(id).await);
                        }
                        Some(Command::GetPeers(reply)) => {
                            let _ = reply.send(self.active.clone());
                        }
                        Some(Command::GetPassive(reply)) => {
                            let _ = reply.send(self.passive.clone());
                        }
                        Some(Command::Stop(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            // All handles dropped - graceful shutdown
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = shuffle_timer.tick(), if self.config.shuffle_period.is_some() => {
                    self.do_shuffle().await;
                }
            }
        }
        debug!(node = %self.self_id, "membership actor shutting down");
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Join { id, conn } => self.on_join(id, conn).await,
            PeerEvent::JoinReply { id, conn } => {
                self.add_node_active(id, conn).await;
            }
            PeerEvent::Neighbour { id, priority, conn, verdict } => {
                self.on_neighbour(id, priority, conn, verdict).await;
            }
            PeerEvent::ForwardJoin { sender, new, ttl } => {
                self.on_forward_join(sender, new, ttl).await;
            }
            PeerEvent::Shuffle { sender, requester, ttl, xlist } => {
                self.on_shuffle(sender, requester, ttl, xlist).await;
            }
            PeerEvent::ShuffleReply { xlist } => self.on_shuffle_reply(xlist),
            PeerEvent::Disconnected { id } => self.on_disconnected(id).await,
            PeerEvent::LinkError { id, reason } => self.on_link_error(id, reason).await,
        }
    }

    // ------------------------------------------------------------------
    // Join and forward-join
    // ------------------------------------------------------------------

    async fn join_cluster(&mut self, contact: NodeId) -> Result<()> {
        if contact == self.self_id {
            anyhow::bail!("cannot join the overlay through our own identifier");
        }
        if self.in_active(contact) {
            return Err(MembershipError::AlreadyInActive.into());
        }
        let conn = self
            .connector
            .join(contact)
            .await
            .with_context(|| format!("join handshake with {contact} failed"))?;
        self.add_node_active(contact, conn).await;
        Ok(())
    }

    /// A newcomer opened a connection with JOIN: install it, then
    /// advertise it to every other active peer with a forward-join walk.
    /// A join for an already-active id is dropped without a walk; the
    /// duplicate connection dies with the abandoned handle.
    async fn on_join(&mut self, id: NodeId, conn: ConnectionHandle) {
        debug!(peer = %id, "join received");
        if !self.add_node_active(id, conn).await {
            return;
        }
        let ttl = self.config.arwl;
        let others: Vec<Peer> = self.active.iter().filter(|p| p.id != id).cloned().collect();
        for peer in others {
            peer.conn.forward_join(id, ttl).await;
        }
    }

    async fn on_forward_join(&mut self, sender: NodeId, new: NodeId, ttl: u8) {
        if ttl == 0 || self.active.len() == 1 {
            // Walk ends here: connect back to the newcomer.
            if new == self.self_id || self.in_active(new) {
                return;
            }
            match self.connector.join_reply(new).await {
                Ok(conn) => {
                    self.add_node_active(new, conn).await;
                }
                Err(e) => warn!(peer = %new, error = %e, "join reply handshake failed"),
            }
            return;
        }

        let ttl = ttl - 1;
        if ttl == self.config.prwl {
            self.add_node_passive(new);
        }
        let candidates: Vec<Peer> =
            self.active.iter().filter(|p| p.id != sender).cloned().collect();
        // Nobody to continue the walk with: the walk is dropped rather
        // than bounced back.
        if let Some(next) = candidates.choose(&mut self.rng) {
            next.conn.forward_join(new, ttl).await;
        }
    }

    // ------------------------------------------------------------------
    // Shuffle
    // ------------------------------------------------------------------

    async fn do_shuffle(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let active_ids: Vec<NodeId> = self.active.iter().map(|p| p.id).collect();
        let mut xlist = vec![self.self_id];
        xlist.extend(active_ids.choose_multiple(&mut self.rng, self.config.k_active).copied());
        xlist.extend(self.passive.choose_multiple(&mut self.rng, self.config.k_passive).copied());

        if let Some(peer) = self.active.choose(&mut self.rng).cloned() {
            debug!(peer = %peer.id, len = xlist.len(), "shuffle initiated");
            let ttl = self.config.arwl.saturating_sub(1);
            if let Err(e) = peer.conn.shuffle(self.self_id, ttl, xlist.clone()).await {
                debug!(peer = %peer.id, error = %e, "shuffle send failed");
            }
            self.last_xlist = xlist;
        }
    }

    async fn on_shuffle(&mut self, sender: NodeId, requester: NodeId, ttl: u8, xlist: Vec<NodeId>) {
        if ttl > 0 && self.active.len() > 1 {
            let candidates: Vec<Peer> =
                self.active.iter().filter(|p| p.id != sender).cloned().collect();
            if let Some(next) = candidates.choose(&mut self.rng) {
                if let Err(e) = next.conn.shuffle(requester, ttl - 1, xlist).await {
                    debug!(peer = %next.id, error = %e, "shuffle forward failed");
                }
                return;
            }
        }

        // Walk ends here: answer the requester over a one-shot connection
        // with a sample of our passive view, then absorb the offer.
        let reply: Vec<NodeId> =
            self.passive.choose_multiple(&mut self.rng, xlist.len()).copied().collect();
        if requester != self.self_id {
            let connector = self.connector.clone();
            let reply_xlist = reply.clone();
            tokio::spawn(async move {
                if let Err(e) = connector.shuffle_reply(requester, reply_xlist).await {
                    debug!(peer = %requester, error = %e, "shuffle reply send failed");
                }
            });
        }
        self.integrate(xlist, &reply);
    }

    fn on_shuffle_reply(&mut self, xlist: Vec<NodeId>) {
        let hint = std::mem::take(&mut self.last_xlist);
        self.integrate(xlist, &hint);
    }

    // ------------------------------------------------------------------
    // Neighbour and failure recovery
    // ------------------------------------------------------------------

    async fn on_neighbour(
        &mut self,
        id: NodeId,
        priority: Priority,
        conn: ConnectionHandle,
        verdict: oneshot::Sender<bool>,
    ) {
        let accept = id != self.self_id
            && !self.in_active(id)
            && (priority == Priority::High || self.active.len() < self.config.active_size);
        let _ = verdict.send(accept);
        if accept {
            self.add_node_active(id, conn).await;
        } else {
            debug!(peer = %id, ?priority, "neighbour request declined");
        }
    }

    async fn on_link_error(&mut self, id: NodeId, reason: String) {
        if self.remove_active(id).is_some() {
            warn!(peer = %id, %reason, "active peer lost");
            self.recover().await;
        }
    }

    /// The remote closed the link deliberately. It is alive, so it stays
    /// a passive candidate while we look for a replacement.
    async fn on_disconnected(&mut self, id: NodeId) {
        if self.remove_active(id).is_some() {
            debug!(peer = %id, "peer disconnected");
            self.add_node_passive(id);
            self.recover().await;
        }
    }

    /// Promote passive candidates until one accepts a neighbour request
    /// or the passive view is exhausted. Declined candidates remain valid
    /// passive entries; unreachable ones are dropped.
    async fn recover(&mut self) {
        let mut pool = std::mem::take(&mut self.passive);
        let mut declined: Vec<NodeId> = Vec::new();

        while !pool.is_empty() {
            let idx = self.rng.gen_range(0..pool.len());
            let candidate = pool.remove(idx);
            let priority =
                if self.active.is_empty() { Priority::High } else { Priority::Low };
            match self.connector.neighbour(candidate, priority).await {
                Ok(NeighbourReply::Accepted(conn)) => {
                    self.passive = pool;
                    self.passive.extend(declined);
                    self.add_node_active(candidate, conn).await;
                    return;
                }
                Ok(NeighbourReply::Declined) => declined.push(candidate),
                Err(e) => {
                    debug!(peer = %candidate, error = %e, "replacement candidate unreachable");
                }
            }
        }

        self.passive = declined;
        if self.active.is_empty() {
            warn!("active view empty and no passive candidate accepted");
        }
    }

    async fn disconnect_peer(&mut self, id: NodeId) -> Result<(), MembershipError> {
        match self.remove_active(id) {
            Some(peer) => {
                peer.conn.disconnect().await;
                self.add_node_passive(id);
                Ok(())
            }
            None => Err(MembershipError::NotInActive),
        }
    }

    async fn shutdown(&mut self) {
        self.listener.abort();
        for peer in std::mem::take(&mut self.active) {
            peer.conn.disconnect().await;
        }
        self.passive.clear();
    }

    // ------------------------------------------------------------------
    // View policy
    // ------------------------------------------------------------------

    fn in_active(&self, id: NodeId) -> bool {
        self.active.iter().any(|p| p.id == id)
    }

    fn remove_active(&mut self, id: NodeId) -> Option<Peer> {
        let idx = self.active.iter().position(|p| p.id == id)?;
        Some(self.active.remove(idx))
    }

    /// Install a peer in the active view, evicting a random incumbent
    /// into the passive view when full. A candidate that is our own id or
    /// already active is ignored, leaving the views unchanged; its
    /// connection dies with the dropped handle. Returns whether the peer
    /// was newly inserted.
    async fn add_node_active(&mut self, id: NodeId, conn: ConnectionHandle) -> bool {
        if id == self.self_id || self.in_active(id) {
            return false;
        }
        if self.active.len() >= self.config.active_size {
            let idx = self.rng.gen_range(0..self.active.len());
            let victim = self.active.remove(idx);
            debug!(peer = %victim.id, "evicting active peer to make room");
            victim.conn.disconnect().await;
            self.add_node_passive(victim.id);
        }
        self.passive.retain(|n| *n != id);
        self.active.push(Peer { id, conn: conn.clone() });
        conn.go_ahead().await;
        debug!(peer = %id, active = self.active.len(), "active peer added");
        true
    }

    fn add_node_passive(&mut self, id: NodeId) {
        if id == self.self_id || self.in_active(id) || self.passive.contains(&id) {
            return;
        }
        while self.passive.len() >= self.config.passive_size {
            let idx = self.rng.gen_range(0..self.passive.len());
            self.passive.remove(idx);
        }
        self.passive.push(id);
    }

    /// Absorb a shuffle exchange list into the passive view. When room
    /// must be made, entries that also appear in `hint` (identifiers we
    /// just offered the other side) are evicted first.
    fn integrate(&mut self, xlist: Vec<NodeId>, hint: &[NodeId]) {
        let mut fresh: Vec<NodeId> = Vec::new();
        for id in xlist {
            if id != self.self_id
                && !self.in_active(id)
                && !self.passive.contains(&id)
                && !fresh.contains(&id)
            {
                fresh.push(id);
            }
        }
        if fresh.is_empty() {
            return;
        }
        fresh.truncate(self.config.passive_size);

        let mut overflow =
            (self.passive.len() + fresh.len()).saturating_sub(self.config.passive_size);
        let mut i = 0;
        while overflow > 0 && i < self.passive.len() {
            if hint.contains(&self.passive[i]) {
                self.passive.remove(i);
                overflow -= 1;
            } else {
                i += 1;
            }
        }
        while overflow > 0 && !self.passive.is_empty() {
            let idx = self.rng.gen_range(0..self.passive.len());
            self.passive.remove(idx);
            overflow -= 1;
        }
        self.passive.append(&mut fresh);
    }
}
