//! Traits the core consumes from its environment
//!
//! The messenger provides a lossless, ordered, reconnecting duplex channel
//! per peer address. The map source is the client's window on the monitor
//! cluster: it can be asked (fire-and-forget) to deliver a newer cluster map.
//!
//! Inbound traffic enters the core through [`MdsClient::dispatch`] and
//! [`MdsClient::peer_reset`], which the embedder wires to its messenger's
//! callbacks.
//!
//! [`MdsClient::dispatch`]: crate::MdsClient::dispatch
//! [`MdsClient::peer_reset`]: crate::MdsClient::peer_reset

use metafs_common::{Epoch, MdsRank};
use metafs_proto::Message;
use std::net::SocketAddr;
use std::sync::Arc;

/// One established channel to a peer
pub trait Connection: Send + Sync {
    /// Queue a message for delivery. Never blocks on the peer.
    fn send(&self, msg: Message);

    /// Nudge the transport so the peer knows we are alive.
    fn keepalive(&self) {}

    /// Tear the channel down; in-flight messages may be lost.
    fn close(&self);
}

/// Connection factory
pub trait Messenger: Send + Sync {
    /// Open (or reuse) a channel to the MDS at `addr`.
    fn connect(&self, rank: MdsRank, addr: SocketAddr) -> Arc<dyn Connection>;
}

/// Source of cluster maps
pub trait MapSource: Send + Sync {
    /// Ask for a map at least as new as `epoch_hint`. Fire-and-forget; the
    /// map arrives later as an inbound `MdsMap` message.
    fn request_map(&self, epoch_hint: Epoch);
}
