//! Snap realm table
//!
//! The client tracks, for every snap realm it has heard of, the realm's
//! version and parent. During reconnect it sends everything it knows; a
//! recovering MDS replies with whatever is newer.

use metafs_common::Ino;
use metafs_proto::SnapRealmInfo;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug)]
pub(crate) struct SnapRealm {
    pub seq: u64,
    pub parent: Ino,
}

#[derive(Default)]
pub(crate) struct SnapRealms {
    realms: BTreeMap<Ino, SnapRealm>,
}

impl SnapRealms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a snap trace. Older information never overwrites newer.
    pub fn update(&mut self, infos: &[SnapRealmInfo]) {
        for info in infos {
            match self.realms.get_mut(&info.ino) {
                Some(realm) if realm.seq >= info.seq => {}
                Some(realm) => {
                    realm.seq = info.seq;
                    realm.parent = info.parent;
                }
                None => {
                    self.realms.insert(
                        info.ino,
                        SnapRealm {
                            seq: info.seq,
                            parent: info.parent,
                        },
                    );
                }
            }
        }
    }

    /// Everything we know, in inode order, for the reconnect payload.
    pub fn records(&self) -> impl Iterator<Item = SnapRealmInfo> + '_ {
        self.realms.iter().map(|(ino, realm)| SnapRealmInfo {
            ino: *ino,
            seq: realm.seq,
            parent: realm.parent,
        })
    }
}
