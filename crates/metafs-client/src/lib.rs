//! metafs metadata client core
//!
//! The client half of the metadata protocol: it submits namespace operations
//! (lookup, open, create, unlink, rename, readdir, ...) to a cluster of
//! metadata servers, keeps a stateful session with each MDS it talks to,
//! caches revocable capabilities over inode state, and survives MDS failover
//! by replaying shared state to recovering ranks.
//!
//! The embedder supplies a [`Messenger`] (an ordered, lossless, reconnecting
//! channel per peer) and a [`MapSource`] (delivers cluster maps on request)
//! and wires inbound traffic to [`MdsClient::dispatch`]. Everything else —
//! target selection, forwards, unsafe/safe reply phases, capability
//! revocation, lease maintenance, reconnect, shutdown — happens inside
//! [`MdsClient`].

mod caps;
mod client;
mod completion;
mod inode;
mod lease;
mod mdsmap;
mod messenger;
mod request;
mod session;
mod snap;

pub use client::MdsClient;
pub use completion::Completion;
pub use inode::FileMode;
pub use mdsmap::MdsMap;
pub use messenger::{Connection, MapSource, Messenger};
pub use request::{CapDrops, DirectMode, Request, RequestBuilder, RequestCallback, Target};
pub use session::SessionState;

pub use metafs_common::{ClientConfig, Epoch, Error, Ino, MdsRank, MdsState, Result, Tid};
