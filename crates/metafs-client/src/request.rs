//! Metadata requests
//!
//! A request is built by the caller, registered with the coordinator (which
//! assigns the tid), and then driven through sends, forwards and retries
//! until a reply or a terminal error. The caller blocks on `completion`;
//! `safe_completion` fires once the MDS has committed the operation durably.

use crate::completion::Completion;
use crate::session::Session;
use metafs_common::{Error, Ino, MdsRank, Tid};
use metafs_proto::{CapMask, Filepath, Op, OpArgs, ReplyMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How to pick the target MDS
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectMode {
    /// Any replica will do
    Any,
    /// Must reach the authoritative MDS for the target
    Auth,
    /// Any active MDS, ignoring locality
    Random,
}

/// What the request operates on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// An inode we already know
    Inode(Ino),
    /// A name under a directory we already know
    Dentry { dir: Ino, name: String },
    /// An explicit path relative to a base inode
    Path { ino: Ino, path: String },
}

impl Target {
    /// The inode consulted for MDS selection and cap releases.
    #[must_use]
    pub fn ino(&self) -> Ino {
        match self {
            Target::Inode(ino) => *ino,
            Target::Dentry { dir, .. } => *dir,
            Target::Path { ino, .. } => *ino,
        }
    }

    /// Encode as the (ino, path) pair the wire format carries.
    #[must_use]
    pub fn to_filepath(&self) -> Filepath {
        match self {
            Target::Inode(ino) => Filepath {
                ino: *ino,
                path: String::new(),
            },
            Target::Dentry { dir, name } => Filepath {
                ino: *dir,
                path: name.clone(),
            },
            Target::Path { ino, path } => Filepath {
                ino: *ino,
                path: path.clone(),
            },
        }
    }

    /// The dentry name, when the target names one.
    #[must_use]
    pub fn dname(&self) -> Option<&str> {
        match self {
            Target::Dentry { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Cap-release hints: what the client promises to drop on success, unless
/// the `unless` mask shows it still wants the cap.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapDrops {
    pub inode_drop: CapMask,
    pub inode_unless: CapMask,
    pub dentry_drop: bool,
    pub old_inode_drop: CapMask,
    pub old_inode_unless: CapMask,
    pub old_dentry_drop: bool,
}

/// Mutable request state.
///
/// Mutated under the coordinator mutex or the owning session's mutex; the
/// inner lock exists so readers (the caller thread collecting results) never
/// see torn state.
pub(crate) struct RequestState {
    /// 0 until registered
    pub tid: Tid,
    /// Current target-selection mode; flips to `Auth` after a stale handle
    pub mode: DirectMode,
    /// Current send target
    pub mds: Option<MdsRank>,
    /// Session used for the current send
    pub session: Option<Arc<Session>>,
    /// Session that told us to forward (its failure also rekicks us)
    pub fwd_session: Option<Arc<Session>>,
    /// Hint from a forward message
    pub resend_mds: Option<MdsRank>,
    pub num_fwd: u32,
    pub attempts: u32,
    pub num_stale: u32,
    pub got_unsafe: bool,
    pub got_safe: bool,
    pub reply: Option<ReplyMessage>,
    pub err: Option<Error>,
    /// When the caller created the request (timeout base)
    pub started: Instant,
    /// When the first send happened
    pub request_started: Option<Instant>,
    /// Inode the reply trace resolved to; replay hint
    pub target_ino: Option<Ino>,
    /// Directory whose unsafe-ops list this request is linked on
    pub unsafe_dir: Option<Ino>,
}

/// Invoked instead of waking `completion` when the request finishes.
/// Must not call back into the client.
pub type RequestCallback = Box<dyn Fn(&Request) + Send + Sync>;

/// An in-flight (or being-built) metadata request
pub struct Request {
    pub op: Op,
    pub args: OpArgs,
    pub caller_uid: u32,
    pub caller_gid: u32,
    pub timeout: Option<Duration>,
    pub target: Target,
    /// Second target, for rename/link
    pub target2: Option<Target>,
    pub drops: CapDrops,
    /// The caller holds this directory locked; ask for the dentry trace and
    /// track the mutation on the directory's unsafe-ops list.
    pub locked_dir: Option<Ino>,
    pub(crate) callback: Option<RequestCallback>,
    pub(crate) state: Mutex<RequestState>,
    pub(crate) completion: Completion,
    pub(crate) safe_completion: Completion,
}

impl Request {
    /// Start building a request.
    #[must_use]
    pub fn build(op: Op, mode: DirectMode, target: Target) -> RequestBuilder {
        RequestBuilder {
            op,
            mode,
            target,
            args: OpArgs::None,
            caller_uid: 0,
            caller_gid: 0,
            timeout: None,
            target2: None,
            drops: CapDrops::default(),
            locked_dir: None,
            callback: None,
        }
    }

    /// The assigned tid; 0 before registration.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.state.lock().tid
    }

    /// The reply, once one has arrived.
    #[must_use]
    pub fn reply(&self) -> Option<ReplyMessage> {
        self.state.lock().reply.clone()
    }

    /// Outcome visible to the caller: `None` while pending, then the sticky
    /// error or the MDS result.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<(), Error>> {
        let state = self.state.lock();
        if let Some(err) = &state.err {
            return Some(Err(err.clone()));
        }
        state.reply.as_ref().map(|reply| {
            if reply.result == 0 {
                Ok(())
            } else {
                Err(Error::Mds(reply.result))
            }
        })
    }

    /// Has the durable commit arrived?
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.state.lock().got_safe
    }

    /// Block until the safe reply (or teardown) signals durability.
    pub fn wait_safe(&self) {
        self.safe_completion.wait();
    }

    pub(crate) fn drop_sessions(state: &mut RequestState) {
        state.session = None;
        state.fwd_session = None;
    }
}

/// Builder for [`Request`]
pub struct RequestBuilder {
    op: Op,
    mode: DirectMode,
    target: Target,
    args: OpArgs,
    caller_uid: u32,
    caller_gid: u32,
    timeout: Option<Duration>,
    target2: Option<Target>,
    drops: CapDrops,
    locked_dir: Option<Ino>,
    callback: Option<RequestCallback>,
}

impl RequestBuilder {
    #[must_use]
    pub fn args(mut self, args: OpArgs) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn caller(mut self, uid: u32, gid: u32) -> Self {
        self.caller_uid = uid;
        self.caller_gid = gid;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Second target for rename/link.
    #[must_use]
    pub fn second_target(mut self, target: Target) -> Self {
        self.target2 = Some(target);
        self
    }

    #[must_use]
    pub fn drops(mut self, drops: CapDrops) -> Self {
        self.drops = drops;
        self
    }

    #[must_use]
    pub fn locked_dir(mut self, dir: Ino) -> Self {
        self.locked_dir = Some(dir);
        self
    }

    /// Complete through a callback instead of waking a waiter. Callback
    /// requests cannot be driven with `execute`; use `submit`.
    #[must_use]
    pub fn on_complete(mut self, callback: RequestCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn finish(self) -> Arc<Request> {
        Arc::new(Request {
            op: self.op,
            args: self.args,
            caller_uid: self.caller_uid,
            caller_gid: self.caller_gid,
            timeout: self.timeout,
            target: self.target,
            target2: self.target2,
            drops: self.drops,
            locked_dir: self.locked_dir,
            callback: self.callback,
            state: Mutex::new(RequestState {
                tid: 0,
                mode: self.mode,
                mds: None,
                session: None,
                fwd_session: None,
                resend_mds: None,
                num_fwd: 0,
                attempts: 0,
                num_stale: 0,
                got_unsafe: false,
                got_safe: false,
                reply: None,
                err: None,
                started: Instant::now(),
                request_started: None,
                target_ino: None,
                unsafe_dir: None,
            }),
            completion: Completion::new(),
            safe_completion: Completion::new(),
        })
    }
}
