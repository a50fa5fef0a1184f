//! Messages exchanged with the MDS cluster
//!
//! One enum covers both directions; each variant names the payload struct.
//! The messenger moves these as opaque values over a lossless, ordered,
//! reconnecting channel per peer.

use crate::caps::CapMask;
use crate::ops::Op;
use metafs_common::{Epoch, Ino, MdsRank, MdsState, Tid};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Any message the client sends or receives
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    MdsMap(MdsMapPayload),
    Session(SessionMessage),
    Request(RequestMessage),
    Reply(ReplyMessage),
    Forward(ForwardMessage),
    Caps(CapMessage),
    CapRelease(CapReleaseMessage),
    Lease(LeaseMessage),
    Snap(SnapMessage),
    Reconnect(ReconnectMessage),
}

impl Message {
    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::MdsMap(_) => "mdsmap",
            Message::Session(_) => "session",
            Message::Request(_) => "request",
            Message::Reply(_) => "reply",
            Message::Forward(_) => "forward",
            Message::Caps(_) => "caps",
            Message::CapRelease(_) => "cap_release",
            Message::Lease(_) => "lease",
            Message::Snap(_) => "snap",
            Message::Reconnect(_) => "reconnect",
        }
    }
}

/// One rank's entry in a cluster map
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankInfo {
    pub state: MdsState,
    /// Network address; absent while the rank is down or failed
    pub addr: Option<SocketAddr>,
}

/// A full cluster map at one epoch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdsMapPayload {
    pub epoch: Epoch,
    /// Entries indexed by rank; length is the cluster's max_mds
    pub ranks: Vec<RankInfo>,
    pub session_timeout: Duration,
    pub session_autoclose: Duration,
    pub max_file_size: u64,
    /// Rank holding the root of the namespace
    pub root: MdsRank,
}

/// Session control operations (both directions)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOp {
    /// Client asks to open a session
    RequestOpen,
    /// MDS acknowledges the open
    Open,
    /// Client asks to renew all caps held on this session
    RequestRenewCaps,
    /// MDS acknowledges the renewal
    RenewCaps,
    /// Client asks to close the session
    RequestClose,
    /// MDS acknowledges the close
    Close,
    /// MDS declares the client's caps stale (missed renewals)
    Stale,
    /// MDS asks the client to trim its cap count
    RecallState,
}

/// A session control message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMessage {
    pub op: SessionOp,
    pub seq: u64,
    /// Target cap count, for `RecallState`
    pub max_caps: Option<usize>,
}

/// An (ino, path) pair locating a request target.
///
/// `path` is relative to `ino`; an empty path addresses `ino` itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filepath {
    pub ino: Ino,
    pub path: String,
}

/// Operation-specific arguments carried in a request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum OpArgs {
    #[default]
    None,
    Open {
        flags: u32,
        mode: u32,
    },
    Mknod {
        mode: u32,
        rdev: u32,
    },
    Setattr {
        /// Which attributes are being set
        mask: u32,
        size: Option<u64>,
        mtime: Option<SystemTime>,
        atime: Option<SystemTime>,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    },
    Readdir {
        /// Directory fragment to list
        frag: u32,
    },
}

/// A cap release embedded in an outgoing request: what the client promises
/// to drop if the operation succeeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub ino: Ino,
    pub cap_id: u64,
    /// Caps retained after the drop
    pub caps: CapMask,
    pub wanted: CapMask,
    pub seq: u64,
    pub issue_seq: u64,
    pub mseq: u64,
    /// Set when a dentry lease is being released along with the cap
    pub dname: Option<String>,
}

/// A metadata request (client → MDS)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMessage {
    pub tid: Tid,
    /// Minimum tid still in flight at this client; lets the MDS trim its
    /// reply cache.
    pub oldest_client_tid: Tid,
    pub mdsmap_epoch: Epoch,
    pub op: Op,
    pub caller_uid: u32,
    pub caller_gid: u32,
    pub args: OpArgs,
    pub path1: Filepath,
    /// Second target, for rename/link
    pub path2: Option<Filepath>,
    pub releases: Vec<ReleaseRecord>,
    /// This send is a replay of a request whose unsafe reply was already
    /// received.
    pub replay: bool,
    /// The caller holds the parent directory locked and wants the dentry
    /// trace back.
    pub want_dentry: bool,
    pub num_fwd: u32,
    pub num_retry: u32,
    /// On replay, the inode the earlier unsafe reply created, so the MDS can
    /// reacquire it.
    pub ino_hint: Option<Ino>,
}

/// A directory fragment's placement as reported in a reply trace
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FragInfo {
    /// Fragment identifier: low `bits` bits of the name hash equal `value`
    pub value: u32,
    pub bits: u8,
    /// Authoritative rank for this fragment, if known
    pub auth: Option<MdsRank>,
    /// Ranks holding replicas of this fragment
    pub dist: Vec<MdsRank>,
}

/// A capability granted inline in a reply trace
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceCap {
    pub cap_id: u64,
    pub issued: CapMask,
    pub wanted: CapMask,
    pub seq: u64,
    pub mseq: u64,
    /// The granting MDS is authoritative for this inode
    pub auth: bool,
}

/// Inode attributes carried in a reply trace or readdir page
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InodeInfo {
    pub ino: Ino,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub symlink: Option<String>,
    pub frags: Vec<FragInfo>,
    pub cap: Option<TraceCap>,
    /// Snap realm this inode belongs to
    pub snap_realm: Ino,
}

/// Dentry lease terms attached to a trace or readdir entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub duration_ms: u32,
    pub seq: u64,
}

/// The dentry+inode trace of a reply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyTrace {
    /// Parent directory, when the reply names a dentry
    pub dir: Option<InodeInfo>,
    pub dname: Option<String>,
    pub dlease: Option<LeaseInfo>,
    /// Target inode of the operation
    pub target: Option<InodeInfo>,
}

/// One entry of a readdir page
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub lease: LeaseInfo,
    pub inode: InodeInfo,
}

/// Readdir results attached to a reply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyDir {
    pub entries: Vec<DirEntry>,
    /// No further fragments after this one
    pub end: bool,
    /// The listing covers the whole directory
    pub complete: bool,
}

/// A snap realm record: the client's (or server's) knowledge of one realm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapRealmInfo {
    pub ino: Ino,
    pub seq: u64,
    pub parent: Ino,
}

/// An MDS reply (unsafe or safe)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub tid: Tid,
    pub op: Op,
    /// 0 on success, positive errno otherwise
    pub result: i32,
    /// Durable commit acknowledgement (vs in-memory)
    pub safe: bool,
    pub trace: Option<ReplyTrace>,
    pub dir: Option<ReplyDir>,
    /// Snap realm updates that must be applied before the trace
    pub snap: Vec<SnapRealmInfo>,
}

/// Mid-flight redirect of a request to another MDS
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ForwardMessage {
    pub tid: Tid,
    pub next_mds: MdsRank,
    pub fwd_seq: u32,
    /// The forwarding MDS did not relay the request; the client must resend.
    pub must_resend: bool,
}

/// Capability message operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapOp {
    /// MDS grants (or, by shrinking the mask, revokes) caps
    Grant,
    /// MDS acknowledges a client flush
    FlushAck,
    /// Client updates the MDS: acks a revoke, reports dirty state
    Update,
}

/// A capability grant/revoke/flush message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapMessage {
    pub op: CapOp,
    pub ino: Ino,
    pub cap_id: u64,
    pub seq: u64,
    pub issue_seq: u64,
    /// Migration sequence; bumped when the cap moves between MDSs
    pub mseq: u64,
    /// Issued (grant) or retained (update) mask
    pub caps: CapMask,
    pub wanted: CapMask,
    /// Bits the client is flushing (update direction only)
    pub dirty: CapMask,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

/// One released capability in a batched release message
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CapReleaseItem {
    pub ino: Ino,
    pub cap_id: u64,
    pub migrate_seq: u64,
    pub seq: u64,
}

/// A batch of capability releases (client → MDS)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CapReleaseMessage {
    pub items: Vec<CapReleaseItem>,
}

/// Dentry lease actions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseAction {
    /// MDS revokes the lease
    Revoke,
    /// MDS extends a lease whose renewal was requested
    Renew,
    /// Client returns a lease it is about to invalidate anyway
    Release,
    /// Client acknowledges a revoke
    RevokeAck,
}

/// A dentry lease message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseMessage {
    pub action: LeaseAction,
    pub mask: u16,
    /// Parent directory inode
    pub ino: Ino,
    /// Snapshot range the lease covers
    pub first: u64,
    pub last: u64,
    pub seq: u64,
    pub duration_ms: u32,
    pub dname: String,
    /// Hint that a request will follow immediately; the messenger need not
    /// flush the stream for this message alone.
    pub more_to_follow: bool,
}

/// Snap realm updates pushed by an MDS
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapMessage {
    pub realms: Vec<SnapRealmInfo>,
}

/// One cap's record in a reconnect payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapReconnect {
    pub ino: Ino,
    /// Path from the root (stopping at snap boundaries), so a recovering MDS
    /// can reacquire the inode by name.
    pub pathbase: Ino,
    pub path: String,
    pub cap_id: u64,
    pub wanted: CapMask,
    pub issued: CapMask,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub snap_realm: Ino,
}

/// Reconnect payload sent to a recovering MDS
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectMessage {
    /// The client had no session with this MDS
    pub was_closed: bool,
    pub caps: Vec<CapReconnect>,
    pub realms: Vec<SnapRealmInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind() {
        let msg = Message::Forward(ForwardMessage {
            tid: 1,
            next_mds: 0,
            fwd_seq: 1,
            must_resend: false,
        });
        assert_eq!(msg.kind(), "forward");
    }

    #[test]
    fn test_filepath_of_ino() {
        let fp = Filepath {
            ino: Ino::new(0x100),
            path: String::new(),
        };
        assert!(fp.path.is_empty());
    }
}
