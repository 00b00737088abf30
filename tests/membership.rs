//! Integration tests for the membership layer.
//!
//! Real nodes bound to loopback TCP, plus scripted peers speaking raw
//! frames where a scenario needs exact control over one side of the wire.

use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use hyparmesh::{decode, Config, Frame, MeshCallback, Node, NodeId, Priority};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// An identifier nothing will ever listen on (its port is burned from the
/// same counter real nodes allocate from).
fn fresh_id() -> NodeId {
    next_addr().parse().expect("loopback address")
}

/// The literal scenario parameters: small views, short walks.
fn test_config() -> Config {
    Config {
        active_size: 3,
        passive_size: 5,
        arwl: 3,
        prwl: 2,
        k_active: 2,
        k_passive: 2,
        shuffle_period: None,
        timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        rng_seed: Some(7),
    }
}

#[derive(Default)]
struct Recorder {
    ups: Mutex<Vec<NodeId>>,
    downs: Mutex<Vec<NodeId>>,
}

#[async_trait]
impl MeshCallback for Recorder {
    async fn link_up(&self, peer: NodeId) {
        self.ups.lock().unwrap().push(peer);
    }
    async fn link_down(&self, peer: NodeId) {
        self.downs.lock().unwrap().push(peer);
    }
    async fn deliver(&self, _from: NodeId, _payload: Vec<u8>) {}
}

async fn spawn_node(config: Config) -> (Node, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let node = Node::bind(&next_addr(), config, recorder.clone()).await.expect("bind failed");
    (node, recorder)
}

async fn active_ids(node: &Node) -> Vec<NodeId> {
    node.peers().await.into_iter().map(|p| p.id).collect()
}

/// Poll `cond` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn recv_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
    loop {
        if let Some(frame) = decode(buf).expect("undecodable frame") {
            return frame;
        }
        let n = timeout(Duration::from_secs(5), stream.read_buf(buf))
            .await
            .expect("timed out waiting for frame")
            .expect("read failed");
        assert!(n > 0, "connection closed while waiting for frame");
    }
}

/// A scripted peer: joins a node with a raw JOIN frame and then exchanges
/// frames under test control.
struct TestPeer {
    id: NodeId,
    stream: TcpStream,
    buf: BytesMut,
}

impl TestPeer {
    async fn join(node: &Node, id: NodeId) -> TestPeer {
        let mut stream =
            TcpStream::connect(node.self_id().socket_addr()).await.expect("connect failed");
        stream.write_all(&Frame::Join(id).encode()).await.expect("write failed");

        let node = node.clone();
        let registered = eventually(move || {
            let node = node.clone();
            async move { node.peers().await.iter().any(|p| p.id == id) }
        })
        .await;
        assert!(registered, "node never registered scripted peer {id}");

        TestPeer { id, stream, buf: BytesMut::new() }
    }

    async fn send(&mut self, frame: Frame) {
        self.stream.write_all(&frame.encode()).await.expect("write failed");
    }

    async fn recv(&mut self) -> Frame {
        recv_frame(&mut self.stream, &mut self.buf).await
    }
}

/// Seed a node's passive view through a one-shot SHUFFLEREPLY carrier.
async fn seed_passive(node: &Node, xlist: Vec<NodeId>) {
    let expected: Vec<NodeId> = xlist.clone();
    let mut stream =
        TcpStream::connect(node.self_id().socket_addr()).await.expect("connect failed");
    stream.write_all(&Frame::ShuffleReply { xlist }.encode()).await.expect("write failed");

    let node = node.clone();
    let seeded = eventually(move || {
        let node = node.clone();
        let expected = expected.clone();
        async move {
            let passive = node.passive_peers().await;
            expected.iter().all(|id| passive.contains(id))
        }
    })
    .await;
    assert!(seeded, "passive view was never seeded");
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test]
async fn two_node_join() {
    let (b, rb) = spawn_node(test_config()).await;
    let (a, ra) = spawn_node(test_config()).await;

    a.join_cluster(b.self_id()).await.expect("join failed");

    let converged = eventually(|| {
        let (a, b) = (a.clone(), b.clone());
        async move {
            active_ids(&a).await == vec![b.self_id()]
                && active_ids(&b).await == vec![a.self_id()]
        }
    })
    .await;
    assert!(converged, "views never converged");

    assert!(a.passive_peers().await.is_empty());
    assert!(b.passive_peers().await.is_empty());
    assert!(ra.ups.lock().unwrap().contains(&b.self_id()));
    assert!(rb.ups.lock().unwrap().contains(&a.self_id()));
}

#[tokio::test]
async fn joining_an_active_peer_again_is_rejected() {
    let (b, _) = spawn_node(test_config()).await;
    let (a, _) = spawn_node(test_config()).await;

    a.join_cluster(b.self_id()).await.expect("join failed");
    let err = a.join_cluster(b.self_id()).await.expect_err("second join must fail");
    assert!(err.to_string().contains("already in the active view"));
}

// ============================================================================
// Forward-join
// ============================================================================

#[tokio::test]
async fn join_fans_out_forward_joins_to_every_other_peer() {
    let (n, _) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&n, fresh_id()).await;
    let mut c = TestPeer::join(&n, fresh_id()).await;

    // C's arrival was advertised to B with the full walk length.
    assert_eq!(b.recv().await, Frame::ForwardJoin { new: c.id, ttl: 3 });

    let (d, _) = spawn_node(test_config()).await;
    d.join_cluster(n.self_id()).await.expect("join failed");

    assert_eq!(b.recv().await, Frame::ForwardJoin { new: d.self_id(), ttl: 3 });
    assert_eq!(c.recv().await, Frame::ForwardJoin { new: d.self_id(), ttl: 3 });
}

#[tokio::test]
async fn duplicate_join_is_not_advertised_again() {
    let (n, _) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&n, fresh_id()).await;
    let mut c = TestPeer::join(&n, fresh_id()).await;
    assert_eq!(b.recv().await, Frame::ForwardJoin { new: c.id, ttl: 3 });

    // A second connection claiming an already-active id is abandoned:
    // the node drops the handle and the socket closes.
    let mut dup =
        TcpStream::connect(n.self_id().socket_addr()).await.expect("connect failed");
    dup.write_all(&Frame::Join(b.id).encode()).await.expect("write failed");
    let mut probe = [0u8; 1];
    let n_read = timeout(Duration::from_secs(5), dup.read(&mut probe))
        .await
        .expect("timed out waiting for the duplicate to be dropped")
        .expect("read failed");
    assert_eq!(n_read, 0, "duplicate join connection must be closed");
    assert_eq!(active_ids(&n).await.len(), 2);

    // The next walk either peer sees is for a genuine newcomer: no
    // FORWARDJOIN was fanned out for the rejected duplicate.
    let (d, _) = spawn_node(test_config()).await;
    d.join_cluster(n.self_id()).await.expect("join failed");
    assert_eq!(c.recv().await, Frame::ForwardJoin { new: d.self_id(), ttl: 3 });
    assert_eq!(b.recv().await, Frame::ForwardJoin { new: d.self_id(), ttl: 3 });
}

#[tokio::test]
async fn forward_join_walk_ends_in_a_join_reply() {
    let (n, _) = spawn_node(test_config()).await;
    let (e, re) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&n, fresh_id()).await;

    b.send(Frame::ForwardJoin { new: e.self_id(), ttl: 0 }).await;

    let linked = eventually(|| {
        let (n, e) = (n.clone(), e.clone());
        async move {
            active_ids(&n).await.contains(&e.self_id())
                && active_ids(&e).await == vec![n.self_id()]
        }
    })
    .await;
    assert!(linked, "join reply never produced an active link");
    assert!(re.ups.lock().unwrap().contains(&n.self_id()));
}

#[tokio::test]
async fn forward_join_integrates_target_at_the_passive_walk_length() {
    let (n, _) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&n, fresh_id()).await;
    let mut c = TestPeer::join(&n, fresh_id()).await;
    // Drain the advertisement B got for C.
    assert_eq!(b.recv().await, Frame::ForwardJoin { new: c.id, ttl: 3 });

    let newcomer = fresh_id();
    b.send(Frame::ForwardJoin { new: newcomer, ttl: 3 }).await;

    // The forwarded TTL hits prwl here, so the walk target is remembered
    // and the walk continues away from the sender.
    assert_eq!(c.recv().await, Frame::ForwardJoin { new: newcomer, ttl: 2 });
    let remembered = eventually(|| {
        let n = n.clone();
        async move { n.passive_peers().await.contains(&newcomer) }
    })
    .await;
    assert!(remembered, "walk target never entered the passive view");
}

// ============================================================================
// Neighbour
// ============================================================================

#[tokio::test]
async fn low_priority_neighbour_is_declined_when_full() {
    let config = Config { active_size: 1, ..test_config() };
    let (n, _) = spawn_node(config).await;
    let p1 = TestPeer::join(&n, fresh_id()).await;

    let mut stream =
        TcpStream::connect(n.self_id().socket_addr()).await.expect("connect failed");
    let request = Frame::Neighbour { id: fresh_id(), priority: Priority::Low };
    stream.write_all(&request.encode()).await.expect("write failed");

    let mut reply = [0u8; 1];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("timed out waiting for reply")
        .expect("read failed");
    assert_eq!(reply[0], b'D');

    // The declined connection is closed without further frames.
    let mut rest = [0u8; 8];
    let n_read = timeout(Duration::from_secs(5), stream.read(&mut rest))
        .await
        .expect("timed out waiting for close")
        .expect("read failed");
    assert_eq!(n_read, 0);

    // No view mutation.
    assert_eq!(active_ids(&n).await, vec![p1.id]);
    assert!(n.passive_peers().await.is_empty());
}

#[tokio::test]
async fn high_priority_neighbour_evicts_the_incumbent() {
    let config = Config { active_size: 1, ..test_config() };
    let (n, rn) = spawn_node(config).await;
    let mut p1 = TestPeer::join(&n, fresh_id()).await;

    let p2 = fresh_id();
    let mut stream =
        TcpStream::connect(n.self_id().socket_addr()).await.expect("connect failed");
    let request = Frame::Neighbour { id: p2, priority: Priority::High };
    stream.write_all(&request.encode()).await.expect("write failed");

    let mut reply = [0u8; 1];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("timed out waiting for reply")
        .expect("read failed");
    assert_eq!(reply[0], b'A');

    // The incumbent is told to go and lands in the passive view.
    assert_eq!(p1.recv().await, Frame::Disconnect);
    let settled = eventually(|| {
        let n = n.clone();
        let p1_id = p1.id;
        async move {
            active_ids(&n).await == vec![p2] && n.passive_peers().await == vec![p1_id]
        }
    })
    .await;
    assert!(settled, "eviction never settled");
    assert!(rn.ups.lock().unwrap().contains(&p2));
    assert!(rn.downs.lock().unwrap().contains(&p1.id));
}

// ============================================================================
// Shuffle
// ============================================================================

#[tokio::test]
async fn shuffle_carries_self_and_samples_of_both_views() {
    let (a, _) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&a, fresh_id()).await;
    let p = fresh_id();
    let q = fresh_id();
    seed_passive(&a, vec![p, q]).await;

    a.shuffle().await;

    match b.recv().await {
        Frame::Shuffle { requester, ttl, xlist } => {
            assert_eq!(requester, a.self_id());
            assert_eq!(ttl, 2);
            assert_eq!(xlist.len(), 4);
            assert_eq!(xlist[0], a.self_id());
            assert!(xlist.contains(&b.id));
            assert!(xlist.contains(&p));
            assert!(xlist.contains(&q));
        }
        other => panic!("expected SHUFFLE, got {other:?}"),
    }
}

#[tokio::test]
async fn shuffle_walk_moves_away_from_the_sender() {
    let (n, _) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&n, fresh_id()).await;
    let mut c = TestPeer::join(&n, fresh_id()).await;
    assert_eq!(b.recv().await, Frame::ForwardJoin { new: c.id, ttl: 3 });

    let requester = fresh_id();
    let offered = fresh_id();
    b.send(Frame::Shuffle { requester, ttl: 2, xlist: vec![offered] }).await;

    assert_eq!(c.recv().await, Frame::Shuffle { requester, ttl: 1, xlist: vec![offered] });
}

#[tokio::test]
async fn terminal_shuffle_answers_the_requester_directly() {
    let (n, _) = spawn_node(test_config()).await;
    let mut b = TestPeer::join(&n, fresh_id()).await;
    let q = fresh_id();
    seed_passive(&n, vec![q]).await;

    // Stand in for the shuffle requester.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let requester = match listener.local_addr().expect("local addr") {
        std::net::SocketAddr::V4(v4) => NodeId::from(v4),
        other => panic!("unexpected address family: {other}"),
    };

    let x1 = fresh_id();
    let x2 = fresh_id();
    b.send(Frame::Shuffle { requester, ttl: 2, xlist: vec![x1, x2] }).await;

    // The walk ends at N (single active peer), which answers over a
    // one-shot connection with a passive sample.
    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("requester never contacted")
        .expect("accept failed");
    let mut buf = BytesMut::new();
    assert_eq!(recv_frame(&mut stream, &mut buf).await, Frame::ShuffleReply { xlist: vec![q] });

    let integrated = eventually(|| {
        let n = n.clone();
        async move {
            let passive = n.passive_peers().await;
            passive.contains(&x1) && passive.contains(&x2)
        }
    })
    .await;
    assert!(integrated, "offered identifiers never reached the passive view");
}

// ============================================================================
// Failure recovery
// ============================================================================

#[tokio::test]
async fn link_failure_promotes_a_passive_candidate() {
    let (n, rn) = spawn_node(test_config()).await;
    let (y, _) = spawn_node(test_config()).await;
    let x = TestPeer::join(&n, fresh_id()).await;
    let x_id = x.id;
    seed_passive(&n, vec![y.self_id()]).await;

    // The active peer dies without a word.
    drop(x);

    let recovered = eventually(|| {
        let (n, y) = (n.clone(), y.clone());
        async move {
            active_ids(&n).await == vec![y.self_id()]
                && active_ids(&y).await == vec![n.self_id()]
        }
    })
    .await;
    assert!(recovered, "replacement never promoted");
    assert!(n.passive_peers().await.is_empty());
    assert!(rn.downs.lock().unwrap().contains(&x_id));
}

#[tokio::test]
async fn declined_candidates_stay_in_the_passive_view() {
    // A candidate that declines every neighbour request.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let decliner = match listener.local_addr().expect("local addr") {
        std::net::SocketAddr::V4(v4) => NodeId::from(v4),
        other => panic!("unexpected address family: {other}"),
    };
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let mut request = [0u8; 7];
            if stream.read_exact(&mut request).await.is_err() {
                continue;
            }
            assert_eq!(request[0], b'H', "empty active view must ask with high priority");
            let _ = stream.write_all(&[b'D']).await;
        }
    });

    let (n, _) = spawn_node(test_config()).await;
    let x = TestPeer::join(&n, fresh_id()).await;
    seed_passive(&n, vec![decliner]).await;

    drop(x);

    let settled = eventually(|| {
        let n = n.clone();
        async move {
            n.peers().await.is_empty() && n.passive_peers().await == vec![decliner]
        }
    })
    .await;
    assert!(settled, "recovery loop did not keep the declined candidate");
}

// ============================================================================
// Disconnect and shutdown
// ============================================================================

#[tokio::test]
async fn deliberate_disconnect_lets_the_overlay_heal_itself() {
    let (a, _) = spawn_node(test_config()).await;
    let (b, _) = spawn_node(test_config()).await;
    a.join_cluster(b.self_id()).await.expect("join failed");
    let joined = eventually(|| {
        let (a, b) = (a.clone(), b.clone());
        async move { !active_ids(&a).await.is_empty() && !active_ids(&b).await.is_empty() }
    })
    .await;
    assert!(joined);

    a.disconnect(b.self_id()).await.expect("disconnect failed");

    // B keeps A as a passive candidate and promotes it straight back.
    let healed = eventually(|| {
        let (a, b) = (a.clone(), b.clone());
        async move {
            active_ids(&a).await == vec![b.self_id()]
                && active_ids(&b).await == vec![a.self_id()]
        }
    })
    .await;
    assert!(healed, "overlay did not heal after deliberate disconnect");

    let err = a.disconnect(fresh_id()).await.expect_err("unknown peer must fail");
    assert!(err.to_string().contains("not in the active view"));
}

#[tokio::test]
async fn stop_notifies_peers_with_disconnect() {
    let (a, _) = spawn_node(test_config()).await;
    let (b, rb) = spawn_node(test_config()).await;
    a.join_cluster(b.self_id()).await.expect("join failed");
    let joined = eventually(|| {
        let b = b.clone();
        async move { !active_ids(&b).await.is_empty() }
    })
    .await;
    assert!(joined);

    a.stop().await;

    let cleared = eventually(|| {
        let b = b.clone();
        async move { b.peers().await.is_empty() }
    })
    .await;
    assert!(cleared, "peer never observed the shutdown");
    assert!(rb.downs.lock().unwrap().contains(&a.self_id()));
}
