//! # Hyparmesh - Partial-View Membership and Flooding Broadcast
//!
//! Hyparmesh implements the HyParView membership protocol over plain TCP:
//!
//! - **Membership**: each node keeps a small *active* view of connected
//!   peers and a larger *passive* view of candidate identifiers known by
//!   hearsay. Failed peers are replaced from the passive view; periodic
//!   shuffles exchange random view samples between random walk endpoints.
//! - **Broadcast**: a reference flooding layer on top delivers every
//!   payload at most once per node via SHA-1 content dedup.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - The node actor owns both views and processes one event at a time
//! - Every TCP socket is owned by exactly one connection task
//! - Components communicate only via async channels; handles are cheap
//!   to clone
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------------|---------------------------------------------------|
//! | `node` | Membership node: views, protocol policy, listener |
//! | `wire` | Identifiers and the framed wire protocol |
//! | `connection` | Per-socket state machine and connection handles |
//! | `connect` | Outgoing connection handshakes |
//! | `protocols` | Application callback trait |
//! | `flood` | Reference flooding broadcast |
//!
//! ## Quick Start
//!
//! ```ignore
//! // Create a flooder and bind a node with it as the callback
//! let (flooder, mut messages) = Flooder::new();
//! let node = Node::bind("127.0.0.1:0", Config::default(), flooder.clone()).await?;
//! flooder.attach(node.clone());
//!
//! // Join the overlay through a known contact and say hello
//! node.join_cluster("127.0.0.1:7001".parse()?).await?;
//! flooder.broadcast(b"hello overlay".to_vec()).await?;
//!
//! // Receive floods from other nodes
//! while let Some(msg) = messages.recv().await {
//!     println!("{}: {:?}", msg.origin, msg.payload);
//! }
//! ```

mod connect;
mod connection;
mod flood;
mod node;
mod protocols;
mod wire;

pub use connect::ConnectError;
pub use connection::ConnectionHandle;
pub use flood::{FloodMessage, Flooder};
pub use node::{Config, MembershipError, Node, Peer};
pub use protocols::MeshCallback;
pub use wire::{decode, Frame, NodeId, Priority, WireError, ID_LEN, MAX_MESSAGE_SIZE};
