//! metafs protocol - message definitions
//!
//! This crate contains the typed messages exchanged between the metadata
//! client and the MDS cluster. Fields are named semantically; the wire-level
//! byte layout is the messenger's concern, so messages are plain values
//! rather than generated stubs.

pub mod caps;
pub mod message;
pub mod ops;

pub use caps::CapMask;
pub use message::{
    CapMessage, CapOp, CapReconnect, CapReleaseItem, CapReleaseMessage, DirEntry, Filepath,
    ForwardMessage, FragInfo, InodeInfo, LeaseAction, LeaseInfo, LeaseMessage, MdsMapPayload,
    Message, OpArgs, RankInfo, ReconnectMessage, ReleaseRecord, ReplyDir, ReplyMessage, ReplyTrace,
    RequestMessage, SessionMessage, SessionOp, SnapMessage, SnapRealmInfo, TraceCap,
};
pub use ops::Op;
