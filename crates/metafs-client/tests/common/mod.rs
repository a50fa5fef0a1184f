#![allow(dead_code)]

//! Shared fixtures: a recording messenger, a recording map source, and
//! message builders for driving the client end-to-end.

use metafs_client::{ClientConfig, Connection, MapSource, MdsClient, Messenger};
use metafs_common::{Epoch, Ino, MdsRank, MdsState};
use metafs_proto::{
    InodeInfo, MdsMapPayload, Message, RankInfo, ReplyMessage, ReplyTrace, RequestMessage,
    SessionMessage, SessionOp, TraceCap,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

pub struct FakeConn {
    rank: MdsRank,
    outbox: Arc<Mutex<Vec<(MdsRank, Message)>>>,
}

impl Connection for FakeConn {
    fn send(&self, msg: Message) {
        self.outbox.lock().unwrap().push((self.rank, msg));
    }
    fn close(&self) {}
}

/// Records every message the client sends, tagged with the target rank.
pub struct FakeMessenger {
    pub sent: Arc<Mutex<Vec<(MdsRank, Message)>>>,
}

impl FakeMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// All request messages sent so far, in order.
    pub fn requests(&self) -> Vec<(MdsRank, RequestMessage)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(rank, msg)| match msg {
                Message::Request(req) => Some((*rank, req.clone())),
                _ => None,
            })
            .collect()
    }

    /// All session messages of the given op sent so far.
    pub fn session_msgs(&self, op: SessionOp) -> Vec<(MdsRank, SessionMessage)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(rank, msg)| match msg {
                Message::Session(m) if m.op == op => Some((*rank, m.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Messenger for FakeMessenger {
    fn connect(&self, rank: MdsRank, _addr: SocketAddr) -> Arc<dyn Connection> {
        Arc::new(FakeConn {
            rank,
            outbox: self.sent.clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeMapSource {
    pub asked: Mutex<Vec<Epoch>>,
}

impl MapSource for FakeMapSource {
    fn request_map(&self, epoch_hint: Epoch) {
        self.asked.lock().unwrap().push(epoch_hint);
    }
}

pub fn setup() -> (Arc<MdsClient>, Arc<FakeMessenger>, Arc<FakeMapSource>) {
    let config = ClientConfig {
        mount_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let messenger = FakeMessenger::new();
    let maps = Arc::new(FakeMapSource::default());
    let client = MdsClient::new(config, messenger.clone(), maps.clone());
    (client, messenger, maps)
}

pub fn mds_addr(rank: MdsRank) -> SocketAddr {
    format!("127.0.0.1:{}", 6800 + rank).parse().unwrap()
}

pub fn map(epoch: Epoch, states: &[MdsState]) -> MdsMapPayload {
    map_with_autoclose(epoch, states, Duration::from_secs(300))
}

pub fn map_with_autoclose(
    epoch: Epoch,
    states: &[MdsState],
    autoclose: Duration,
) -> MdsMapPayload {
    MdsMapPayload {
        epoch,
        ranks: states
            .iter()
            .enumerate()
            .map(|(rank, state)| RankInfo {
                state: *state,
                addr: state.is_up().then(|| mds_addr(rank as MdsRank)),
            })
            .collect(),
        session_timeout: Duration::from_secs(60),
        session_autoclose: autoclose,
        max_file_size: 1 << 40,
        root: 0,
    }
}

pub fn session_msg(op: SessionOp, seq: u64) -> Message {
    Message::Session(SessionMessage {
        op,
        seq,
        max_caps: None,
    })
}

pub fn file_info(ino: u64) -> InodeInfo {
    InodeInfo {
        ino: Ino::new(ino),
        mode: 0o100_644,
        uid: 0,
        gid: 0,
        nlink: 1,
        size: 0,
        mtime: SystemTime::UNIX_EPOCH,
        atime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        symlink: None,
        frags: Vec::new(),
        cap: None,
        snap_realm: Ino::ROOT,
    }
}

pub fn dir_info(ino: u64) -> InodeInfo {
    InodeInfo {
        mode: 0o040_755,
        ..file_info(ino)
    }
}

pub fn with_cap(mut info: InodeInfo, issued: metafs_proto::CapMask, auth: bool) -> InodeInfo {
    info.cap = Some(TraceCap {
        cap_id: info.ino.as_u64(),
        issued,
        wanted: metafs_proto::CapMask::EMPTY,
        seq: 1,
        mseq: 0,
        auth,
    });
    info
}

pub fn with_realm(mut info: InodeInfo, realm: u64) -> InodeInfo {
    info.snap_realm = Ino::new(realm);
    info
}

/// A reply carrying just a target inode trace.
pub fn reply(tid: u64, op: metafs_proto::Op, result: i32, safe: bool, target: Option<InodeInfo>) -> Message {
    Message::Reply(ReplyMessage {
        tid,
        op,
        result,
        safe,
        trace: target.map(|target| ReplyTrace {
            dir: None,
            dname: None,
            dlease: None,
            target: Some(target),
        }),
        dir: None,
        snap: Vec::new(),
    })
}

/// A reply whose trace names a dentry under `dir` resolving to `target`.
pub fn reply_with_dentry(
    tid: u64,
    op: metafs_proto::Op,
    dir: InodeInfo,
    dname: &str,
    target: InodeInfo,
) -> Message {
    Message::Reply(ReplyMessage {
        tid,
        op,
        result: 0,
        safe: true,
        trace: Some(ReplyTrace {
            dir: Some(dir),
            dname: Some(dname.to_string()),
            dlease: None,
            target: Some(target),
        }),
        dir: None,
        snap: Vec::new(),
    })
}

pub fn cap_grant(ino: u64, caps: metafs_proto::CapMask, seq: u64) -> Message {
    Message::Caps(metafs_proto::CapMessage {
        op: metafs_proto::CapOp::Grant,
        ino: Ino::new(ino),
        cap_id: ino,
        seq,
        issue_seq: seq,
        mseq: 0,
        caps,
        wanted: metafs_proto::CapMask::EMPTY,
        dirty: metafs_proto::CapMask::EMPTY,
        size: 0,
        mtime: SystemTime::UNIX_EPOCH,
        atime: SystemTime::UNIX_EPOCH,
    })
}

pub fn lease_revoke(dir: u64, dname: &str, seq: u64) -> Message {
    Message::Lease(metafs_proto::LeaseMessage {
        action: metafs_proto::LeaseAction::Revoke,
        mask: 1,
        ino: Ino::new(dir),
        first: 0,
        last: 0,
        seq,
        duration_ms: 0,
        dname: dname.to_string(),
        more_to_follow: false,
    })
}

/// A safe readdir reply listing `entries` under the traced directory.
pub fn readdir_reply(tid: u64, dir: InodeInfo, entries: &[(String, u64)]) -> Message {
    Message::Reply(ReplyMessage {
        tid,
        op: metafs_proto::Op::Readdir,
        result: 0,
        safe: true,
        trace: Some(ReplyTrace {
            dir: None,
            dname: None,
            dlease: None,
            target: Some(dir),
        }),
        dir: Some(metafs_proto::ReplyDir {
            entries: entries
                .iter()
                .map(|(name, ino)| metafs_proto::DirEntry {
                    name: name.clone(),
                    lease: metafs_proto::LeaseInfo {
                        duration_ms: 30_000,
                        seq: 1,
                    },
                    inode: file_info(*ino),
                })
                .collect(),
            end: true,
            complete: true,
        }),
        snap: Vec::new(),
    })
}

/// Poll until `f` yields a value, panicking after five seconds.
pub fn wait_until<T>(what: &str, f: impl Fn() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = f() {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
