//! Outgoing connection establishment.
//!
//! Every outgoing control handshake (JOIN, JOINREPLY, NEIGHBOUR,
//! SHUFFLEREPLY) goes through the [`Connector`]: dial the remote with the
//! configured connect timeout, bind the local side to the node's own
//! address, set `nodelay`, write the leading control frame, then hand the
//! socket to a connection task (or close it, for one-shot carriers).
//!
//! Failures are typed ([`ConnectError`]) and returned to the node, which
//! decides whether to surface or keep trying other candidates; a DECLINE
//! answer to a neighbour request is a normal outcome, not an error.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::connection::{self, ConnectionHandle, PeerEvent};
use crate::node::Config;
use crate::protocols::MeshCallback;
use crate::wire::{Frame, NodeId, Priority, TYPE_ACCEPT, TYPE_DECLINE};

/// Failure modes of an outgoing handshake.
#[derive(Debug)]
pub enum ConnectError {
    /// Connect, read, or write did not finish within its timeout.
    Timeout,
    /// The socket failed outright.
    Io(io::Error),
    /// A neighbour request was answered with something other than ACCEPT
    /// or DECLINE.
    UnexpectedReply(u8),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Timeout => write!(f, "handshake timed out"),
            ConnectError::Io(e) => write!(f, "handshake failed: {e}"),
            ConnectError::UnexpectedReply(byte) => {
                write!(f, "unexpected neighbour reply byte 0x{byte:02x}")
            }
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        ConnectError::Io(e)
    }
}

/// Outcome of an outgoing neighbour request.
pub(crate) enum NeighbourReply {
    /// The remote answered ACCEPT; the connection is live and waiting for
    /// the node's go-ahead.
    Accepted(ConnectionHandle),
    /// The remote answered DECLINE; the socket is closed.
    Declined,
}

/// Opens outgoing connections on behalf of the node.
#[derive(Clone)]
pub(crate) struct Connector {
    self_id: NodeId,
    events: mpsc::Sender<PeerEvent>,
    target: Arc<dyn MeshCallback>,
    config: Config,
}

impl Connector {
    pub(crate) fn new(
        self_id: NodeId,
        events: mpsc::Sender<PeerEvent>,
        target: Arc<dyn MeshCallback>,
        config: Config,
    ) -> Self {
        Self { self_id, events, target, config }
    }

    /// JOIN handshake: the resulting connection waits for the node's
    /// go-ahead.
    pub(crate) async fn join(&self, contact: NodeId) -> Result<ConnectionHandle, ConnectError> {
        let mut stream = self.open(contact).await?;
        self.write_frame(&mut stream, &Frame::Join(self.self_id)).await?;
        Ok(self.adopt(contact, stream))
    }

    /// JOINREPLY handshake, sent to the newcomer at the end of a
    /// forward-join walk.
    pub(crate) async fn join_reply(
        &self,
        remote: NodeId,
    ) -> Result<ConnectionHandle, ConnectError> {
        let mut stream = self.open(remote).await?;
        self.write_frame(&mut stream, &Frame::JoinReply(self.self_id)).await?;
        Ok(self.adopt(remote, stream))
    }

    /// NEIGHBOUR handshake: write the request, then wait for ACCEPT or
    /// DECLINE within the receive timeout.
    pub(crate) async fn neighbour(
        &self,
        remote: NodeId,
        priority: Priority,
    ) -> Result<NeighbourReply, ConnectError> {
        let mut stream = self.open(remote).await?;
        let frame = Frame::Neighbour { id: self.self_id, priority };
        self.write_frame(&mut stream, &frame).await?;

        let mut reply = [0u8; 1];
        match timeout(self.config.timeout, stream.read_exact(&mut reply)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(ConnectError::Io(e)),
            Err(_) => return Err(ConnectError::Timeout),
        }
        match reply[0] {
            TYPE_ACCEPT => Ok(NeighbourReply::Accepted(self.adopt(remote, stream))),
            TYPE_DECLINE => {
                debug!(peer = %remote, "neighbour request declined");
                Ok(NeighbourReply::Declined)
            }
            other => Err(ConnectError::UnexpectedReply(other)),
        }
    }

    /// One-shot SHUFFLEREPLY carrier: write the frame and close.
    pub(crate) async fn shuffle_reply(
        &self,
        remote: NodeId,
        xlist: Vec<NodeId>,
    ) -> Result<(), ConnectError> {
        let mut stream = self.open(remote).await?;
        self.write_frame(&mut stream, &Frame::ShuffleReply { xlist }).await?;
        Ok(())
    }

    async fn open(&self, remote: NodeId) -> Result<TcpStream, ConnectError> {
        let socket = TcpSocket::new_v4()?;
        // The local side binds to the node's own address so the remote sees
        // connections originate from the identity it knows.
        socket.bind(SocketAddr::from((self.self_id.addr(), 0)))?;
        let stream = match timeout(
            self.config.connect_timeout,
            socket.connect(remote.socket_addr()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::Io(e)),
            Err(_) => return Err(ConnectError::Timeout),
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn write_frame(
        &self,
        stream: &mut TcpStream,
        frame: &Frame,
    ) -> Result<(), ConnectError> {
        match timeout(self.config.send_timeout, stream.write_all(&frame.encode())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::Io(e)),
            Err(_) => Err(ConnectError::Timeout),
        }
    }

    /// Transfer socket ownership to a new connection task in
    /// `WaitForSocket`.
    fn adopt(&self, peer: NodeId, stream: TcpStream) -> ConnectionHandle {
        connection::spawn_outgoing(
            peer,
            stream,
            self.events.clone(),
            self.target.clone(),
            self.config.clone(),
        )
    }
}
