//! Callback trait connecting the membership layer to its application.
//!
//! The trait is a capability handed to [`Node::bind`](crate::node::Node::bind)
//! at construction time, never process-wide state. The node and its
//! connection tasks invoke it; the application implements it.
//!
//! | Callback | Fired when |
//! |-------------|-----------------------------------------------------|
//! | `link_up` | a peer entered the active view with a live connection |
//! | `link_down` | an active peer went away (disconnect, failure, eviction) |
//! | `deliver` | an application MESSAGE frame arrived on an active link |

use async_trait::async_trait;

use crate::wire::NodeId;

/// Application-side callback interface.
///
/// Implementations must return promptly: callbacks run on the node's
/// connection tasks, and a stalled callback stalls frame processing for
/// that link.
#[async_trait]
pub trait MeshCallback: Send + Sync {
    /// A new active peer is available for sending.
    async fn link_up(&self, peer: NodeId);

    /// An active peer has gone away. This is the only failure the
    /// application ever observes.
    async fn link_down(&self, peer: NodeId);

    /// An application payload arrived from `from`.
    async fn deliver(&self, from: NodeId, payload: Vec<u8>);
}
