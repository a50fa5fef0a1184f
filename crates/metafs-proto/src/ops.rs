//! Metadata operation codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace operations a client may submit to an MDS
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Lookup,
    Getattr,
    Setattr,
    Open,
    Create,
    Mknod,
    Link,
    Unlink,
    Rename,
    Mkdir,
    Rmdir,
    Symlink,
    Readdir,
    Mksnap,
    Rmsnap,
}

impl Op {
    /// Does this operation mutate the namespace?
    ///
    /// Write operations get unsafe/safe two-phase replies and are the ones
    /// `sync` must wait out.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Op::Setattr
                | Op::Create
                | Op::Mknod
                | Op::Link
                | Op::Unlink
                | Op::Rename
                | Op::Mkdir
                | Op::Rmdir
                | Op::Symlink
                | Op::Mksnap
                | Op::Rmsnap
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Lookup => "lookup",
            Op::Getattr => "getattr",
            Op::Setattr => "setattr",
            Op::Open => "open",
            Op::Create => "create",
            Op::Mknod => "mknod",
            Op::Link => "link",
            Op::Unlink => "unlink",
            Op::Rename => "rename",
            Op::Mkdir => "mkdir",
            Op::Rmdir => "rmdir",
            Op::Symlink => "symlink",
            Op::Readdir => "readdir",
            Op::Mksnap => "mksnap",
            Op::Rmsnap => "rmsnap",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_ops() {
        assert!(Op::Unlink.is_write());
        assert!(Op::Rename.is_write());
        assert!(!Op::Lookup.is_write());
        assert!(!Op::Readdir.is_write());
    }
}
