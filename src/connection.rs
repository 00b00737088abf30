//! Per-connection state machine.
//!
//! Every TCP socket is owned by exactly one spawned task for its whole
//! life. The task translates bytes to frames and frames to events, and is
//! the only place the socket is read or written. The node talks to it
//! through a [`ConnectionHandle`] (command channel in), and the task talks
//! to the node through the shared [`PeerEvent`] channel (events out).
//! There is no shared mutable state between the two.
//!
//! Outgoing connections start in `WaitForSocket`: the handshake frame has
//! been written by the connect layer, but the frame loop does not start
//! until the node confirms peer registration with `go_ahead`. If the node
//! abandons the handle instead (duplicate peer), the task closes the socket
//! silently.
//!
//! Incoming connections start in `WaitIncoming`: the first frame decides
//! the connection's fate. JOIN and JOINREPLY promote it to the active frame
//! loop once the node registers the peer; NEIGHBOUR asks the node for a
//! verdict and answers ACCEPT or DECLINE on the wire; SHUFFLEREPLY is a
//! one-shot carrier that is consumed and closed. Declined and one-shot
//! connections are `Temporary`: they never notify link-down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::node::Config;
use crate::protocols::MeshCallback;
use crate::wire::{self, Frame, NodeId, Priority, MAX_XLIST_LEN};

/// Commands a node issues against a live connection.
pub(crate) enum ConnCommand {
    /// Peer registration confirmed; start the active frame loop.
    GoAhead,
    /// Frame an application payload as MESSAGE and write it.
    Send { payload: Vec<u8>, done: oneshot::Sender<io::Result<()>> },
    /// Write a FORWARDJOIN frame.
    ForwardJoin { new: NodeId, ttl: u8 },
    /// Write a SHUFFLE frame.
    Shuffle { requester: NodeId, ttl: u8, xlist: Vec<NodeId> },
    /// Write DISCONNECT, close the socket, notify link-down, terminate.
    Disconnect { done: oneshot::Sender<()> },
}

/// Events a connection surfaces to the node.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// Incoming connection opened with JOIN.
    Join { id: NodeId, conn: ConnectionHandle },
    /// Incoming connection opened with JOINREPLY.
    JoinReply { id: NodeId, conn: ConnectionHandle },
    /// Incoming neighbour request awaiting an accept/decline verdict.
    Neighbour {
        id: NodeId,
        priority: Priority,
        conn: ConnectionHandle,
        verdict: oneshot::Sender<bool>,
    },
    /// FORWARDJOIN frame received on an active link.
    ForwardJoin { sender: NodeId, new: NodeId, ttl: u8 },
    /// SHUFFLE frame received on an active link.
    Shuffle { sender: NodeId, requester: NodeId, ttl: u8, xlist: Vec<NodeId> },
    /// One-shot SHUFFLEREPLY consumed from an incoming connection.
    ShuffleReply { xlist: Vec<NodeId> },
    /// The remote closed the link gracefully with DISCONNECT.
    Disconnected { id: NodeId },
    /// The link died: socket error, timeout, EOF, or protocol violation.
    LinkError { id: NodeId, reason: String },
}

/// Cheap-to-clone handle to a connection task.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    peer: NodeId,
    cmd_tx: mpsc::Sender<ConnCommand>,
}

impl ConnectionHandle {
    /// Identifier of the remote end.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Send an application payload, framed as MESSAGE. Resolves once the
    /// write has been accepted by the socket. A failed write also raises a
    /// link error at the node and terminates the connection.
    pub async fn send(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCommand::Send { payload, done: tx })
            .await
            .map_err(|_| anyhow::anyhow!("connection to {} is closed", self.peer))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("connection to {} is closed", self.peer))??;
        Ok(())
    }

    /// Enqueue a FORWARDJOIN frame.
    pub(crate) async fn forward_join(&self, new: NodeId, ttl: u8) {
        let _ = self.cmd_tx.send(ConnCommand::ForwardJoin { new, ttl }).await;
    }

    /// Enqueue a SHUFFLE frame. The exchange list length must fit in the
    /// one-byte wire field.
    pub(crate) async fn shuffle(
        &self,
        requester: NodeId,
        ttl: u8,
        xlist: Vec<NodeId>,
    ) -> anyhow::Result<()> {
        if xlist.len() > MAX_XLIST_LEN {
            anyhow::bail!("exchange list of {} entries exceeds wire limit", xlist.len());
        }
        self.cmd_tx
            .send(ConnCommand::Shuffle { requester, ttl, xlist })
            .await
            .map_err(|_| anyhow::anyhow!("connection to {} is closed", self.peer))?;
        Ok(())
    }

    /// Send DISCONNECT and tear the connection down. Resolves once the
    /// task has written the frame and closed the socket.
    pub(crate) async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ConnCommand::Disconnect { done: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Confirm peer registration and start the frame loop.
    pub(crate) async fn go_ahead(&self) {
        let _ = self.cmd_tx.send(ConnCommand::GoAhead).await;
    }

    /// Handle backed by a raw channel, for exercising view policy without
    /// a socket.
    #[cfg(test)]
    pub(crate) fn stub(peer: NodeId) -> (Self, mpsc::Receiver<ConnCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        (Self { peer, cmd_tx }, cmd_rx)
    }
}

const CMD_CHANNEL_CAPACITY: usize = 64;

/// Spawn the task for an outgoing connection whose handshake frame has
/// already been written. The task idles in `WaitForSocket` until the node
/// sends `go_ahead`.
pub(crate) fn spawn_outgoing(
    peer: NodeId,
    stream: TcpStream,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
) -> ConnectionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
    let link = Link { peer, cmd_rx, events, target, config };
    tokio::spawn(link.wait_go_ahead(stream));
    ConnectionHandle { peer, cmd_tx }
}

/// Spawn the task for a freshly accepted incoming connection. The peer is
/// not yet known; the first frame determines it.
pub(crate) fn spawn_incoming(
    stream: TcpStream,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
) {
    tokio::spawn(wait_incoming(stream, events, target, config));
}

/// How an active frame loop ended.
enum LoopEnd {
    /// Remote sent DISCONNECT.
    Remote,
    /// Local disconnect, or the node dropped every handle.
    Local,
    /// Socket or protocol failure.
    Failed(String),
}

struct Link {
    peer: NodeId,
    cmd_rx: mpsc::Receiver<ConnCommand>,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
}

impl Link {
    /// `WaitForSocket`: hold the socket until the node has registered the
    /// peer. A dropped handle means the node discarded this connection.
    async fn wait_go_ahead(mut self, stream: TcpStream) {
        match self.cmd_rx.recv().await {
            Some(ConnCommand::GoAhead) => self.run_active(stream).await,
            Some(ConnCommand::Disconnect { done }) => {
                let _ = done.send(());
            }
            Some(_) | None => {
                debug!(peer = %self.peer, "connection abandoned before go-ahead");
            }
        }
    }

    /// `Active`: pump frames and commands until the link ends.
    async fn run_active(mut self, stream: TcpStream) {
        self.target.link_up(self.peer).await;
        debug!(peer = %self.peer, "link up");

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let end = loop {
            // Drain every complete frame before touching the socket again.
            let mut ended = None;
            loop {
                match wire::decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if let Some(end) = self.handle_frame(frame).await {
                            ended = Some(end);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        ended = Some(LoopEnd::Failed(e.to_string()));
                        break;
                    }
                }
            }
            if let Some(end) = ended {
                break end;
            }

            tokio::select! {
                read = read_chunk(&mut reader, &mut buf, self.config.timeout) => {
                    match read {
                        Ok(0) => break LoopEnd::Failed("connection closed by peer".into()),
                        Ok(_) => {}
                        Err(e) => break LoopEnd::Failed(e.to_string()),
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Some(end) = handle_command(
                                &mut writer, cmd, self.config.send_timeout,
                            ).await {
                                break end;
                            }
                        }
                        None => break LoopEnd::Local,
                    }
                }
            }
        };

        self.target.link_down(self.peer).await;
        debug!(peer = %self.peer, "link down");
        match end {
            LoopEnd::Remote => {
                let _ = self.events.send(PeerEvent::Disconnected { id: self.peer }).await;
            }
            LoopEnd::Local => {}
            LoopEnd::Failed(reason) => {
                debug!(peer = %self.peer, %reason, "connection failed");
                let _ = self
                    .events
                    .send(PeerEvent::LinkError { id: self.peer, reason })
                    .await;
            }
        }
    }

    /// Dispatch one decoded frame. Returns the loop end when the frame
    /// terminates the connection.
    async fn handle_frame(&mut self, frame: Frame) -> Option<LoopEnd> {
        match frame {
            Frame::Message(payload) => {
                self.target.deliver(self.peer, payload).await;
                None
            }
            Frame::ForwardJoin { new, ttl } => {
                let event = PeerEvent::ForwardJoin { sender: self.peer, new, ttl };
                if self.events.send(event).await.is_err() {
                    return Some(LoopEnd::Local);
                }
                None
            }
            Frame::Shuffle { requester, ttl, xlist } => {
                let event = PeerEvent::Shuffle { sender: self.peer, requester, ttl, xlist };
                if self.events.send(event).await.is_err() {
                    return Some(LoopEnd::Local);
                }
                None
            }
            Frame::Disconnect => Some(LoopEnd::Remote),
            other => Some(LoopEnd::Failed(format!(
                "unexpected frame on active connection: {other:?}"
            ))),
        }
    }
}

/// Execute one node command against the write half. Returns the loop end
/// when the command terminates the connection.
async fn handle_command(
    writer: &mut OwnedWriteHalf,
    cmd: ConnCommand,
    send_timeout: Duration,
) -> Option<LoopEnd> {
    match cmd {
        // Registration was already confirmed; nothing to do.
        ConnCommand::GoAhead => None,
        ConnCommand::Send { payload, done } => {
            match write_frame(writer, &Frame::Message(payload), send_timeout).await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                    None
                }
                Err(e) => {
                    let reason = e.to_string();
                    let _ = done.send(Err(e));
                    Some(LoopEnd::Failed(reason))
                }
            }
        }
        ConnCommand::ForwardJoin { new, ttl } => {
            match write_frame(writer, &Frame::ForwardJoin { new, ttl }, send_timeout).await {
                Ok(()) => None,
                Err(e) => Some(LoopEnd::Failed(e.to_string())),
            }
        }
        ConnCommand::Shuffle { requester, ttl, xlist } => {
            let frame = Frame::Shuffle { requester, ttl, xlist };
            match write_frame(writer, &frame, send_timeout).await {
                Ok(()) => None,
                Err(e) => Some(LoopEnd::Failed(e.to_string())),
            }
        }
        ConnCommand::Disconnect { done } => {
            // Best effort: the socket closes either way.
            let _ = write_frame(writer, &Frame::Disconnect, send_timeout).await;
            let _ = done.send(());
            Some(LoopEnd::Local)
        }
    }
}

/// `WaitIncoming`: read the first frame of an accepted connection and
/// dispatch on it.
async fn wait_incoming(
    mut stream: TcpStream,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
) {
    let mut tag = [0u8; 1];
    if let Err(e) = read_exact_timeout(&mut stream, &mut tag, config.timeout).await {
        debug!(error = %e, "incoming connection died before first frame");
        return;
    }

    match tag[0] {
        wire::TYPE_JOIN | wire::TYPE_JOIN_REPLY => {
            let Ok(id) = read_id(&mut stream, config.timeout).await else { return };
            let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
            let conn = ConnectionHandle { peer: id, cmd_tx };
            let event = if tag[0] == wire::TYPE_JOIN {
                PeerEvent::Join { id, conn }
            } else {
                PeerEvent::JoinReply { id, conn }
            };
            if events.send(event).await.is_err() {
                return;
            }
            let link = Link { peer: id, cmd_rx, events, target, config };
            link.wait_go_ahead(stream).await;
        }
        wire::TYPE_HIGH_NEIGHBOUR | wire::TYPE_LOW_NEIGHBOUR => {
            let Ok(id) = read_id(&mut stream, config.timeout).await else { return };
            let priority = if tag[0] == wire::TYPE_HIGH_NEIGHBOUR {
                Priority::High
            } else {
                Priority::Low
            };
            neighbour_verdict(stream, id, priority, events, target, config).await;
        }
        wire::TYPE_SHUFFLE_REPLY => {
            let Ok(xlist) = read_xlist(&mut stream, config.timeout).await else { return };
            // One-shot carrier: consume and close.
            let _ = events.send(PeerEvent::ShuffleReply { xlist }).await;
        }
        other => {
            warn!(tag = other, "unknown first byte on incoming connection");
        }
    }
}

/// Ask the node whether to accept a neighbour request, answer on the wire,
/// and either enter the frame loop or close as a `Temporary` connection.
async fn neighbour_verdict(
    mut stream: TcpStream,
    id: NodeId,
    priority: Priority,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
) {
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
    let conn = ConnectionHandle { peer: id, cmd_tx };
    let event = PeerEvent::Neighbour { id, priority, conn, verdict: verdict_tx };
    if events.send(event).await.is_err() {
        return;
    }

    let accepted = matches!(timeout(config.timeout, verdict_rx).await, Ok(Ok(true)));
    if accepted {
        if let Err(e) = write_stream_frame(&mut stream, &Frame::Accept, config.send_timeout).await
        {
            debug!(peer = %id, error = %e, "failed to answer neighbour request");
            return;
        }
        let link = Link { peer: id, cmd_rx, events, target, config };
        link.run_active(stream).await;
    } else {
        // Temporary connection: decline and close without link-down.
        let _ = write_stream_frame(&mut stream, &Frame::Decline, config.send_timeout).await;
        debug!(peer = %id, "declined neighbour request");
    }
}

async fn read_exact_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    dur: Duration,
) -> io::Result<()> {
    match timeout(dur, stream.read_exact(buf)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}

async fn read_id(stream: &mut TcpStream, dur: Duration) -> io::Result<NodeId> {
    let mut bytes = [0u8; wire::ID_LEN];
    read_exact_timeout(stream, &mut bytes, dur).await?;
    Ok(NodeId::decode(&bytes))
}

async fn read_xlist(stream: &mut TcpStream, dur: Duration) -> io::Result<Vec<NodeId>> {
    let mut len = [0u8; 1];
    read_exact_timeout(stream, &mut len, dur).await?;
    let mut bytes = vec![0u8; len[0] as usize * wire::ID_LEN];
    read_exact_timeout(stream, &mut bytes, dur).await?;
    Ok(bytes.chunks_exact(wire::ID_LEN).map(NodeId::decode).collect())
}

/// Read more bytes into the frame buffer. A partially buffered frame must
/// complete within the receive timeout; an idle connection may stay quiet
/// indefinitely.
async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    dur: Duration,
) -> io::Result<usize> {
    if buf.is_empty() {
        reader.read_buf(buf).await
    } else {
        match timeout(dur, reader.read_buf(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "frame read timed out")),
        }
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &Frame,
    dur: Duration,
) -> io::Result<()> {
    match timeout(dur, writer.write_all(&frame.encode())).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

async fn write_stream_frame(
    stream: &mut TcpStream,
    frame: &Frame,
    dur: Duration,
) -> io::Result<()> {
    match timeout(dur, stream.write_all(&frame.encode())).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}
