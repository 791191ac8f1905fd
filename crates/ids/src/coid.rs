use std::fmt;

use rand::RngCore;
use serde::{
    Deserialize,
    Serialize,
};

/// Container id. Bit layout:
///
/// ```text
/// [ dbid:32 | tree_node_flag:1 | tableid:31 ]
/// ```
pub type Cid = u64;

/// Object id. Bit layout:
///
/// ```text
/// [ issuerid:32 | counter:16 | serverid:16 ]
/// ```
pub type Oid = u64;

/// The issuer (client or server) that allocated an [`Oid`].
pub type IssuerId = u32;

const DBID_SHIFT: u32 = 32;
const TREE_NODE_FLAG: Cid = 1 << 31;
const TABLEID_MASK: Cid = (1 << 31) - 1;

const ISSUERID_SHIFT: u32 = 32;
const COUNTER_SHIFT: u32 = 16;
const COUNTER_MASK: Oid = (1 << 16) - 1;
const SERVERID_MASK: Oid = (1 << 16) - 1;

/// Composes a cid with the tree-node flag set, for the B-tree rooted at
/// `tableid` within database `dbid`.
pub fn get_cid_table(dbid: u32, tableid: u32) -> Cid {
    assert!(tableid & !(TABLEID_MASK as u32) == 0, "tableid overflows 31 bits");
    ((dbid as Cid) << DBID_SHIFT) | TREE_NODE_FLAG | (tableid as Cid)
}

pub fn get_dbid(cid: Cid) -> u32 {
    (cid >> DBID_SHIFT) as u32
}

pub fn get_table(cid: Cid) -> u32 {
    (cid & TABLEID_MASK) as u32
}

pub fn is_tree_node(cid: Cid) -> bool {
    cid & TREE_NODE_FLAG != 0
}

/// The data (non-tree-node) cid corresponding to a tree cid, clearing the
/// tree-node flag.
pub fn data_cid(cid: Cid) -> Cid {
    cid & !TREE_NODE_FLAG
}

pub fn new_oid(issuerid: IssuerId, counter: u16, serverid: u16) -> Oid {
    ((issuerid as Oid) << ISSUERID_SHIFT) | ((counter as Oid) << COUNTER_SHIFT) | (serverid as Oid)
}

pub fn oid_issuerid(oid: Oid) -> IssuerId {
    (oid >> ISSUERID_SHIFT) as IssuerId
}

pub fn oid_counter(oid: Oid) -> u16 {
    ((oid >> COUNTER_SHIFT) & COUNTER_MASK) as u16
}

pub fn oid_serverid(oid: Oid) -> u16 {
    (oid & SERVERID_MASK) as u16
}

/// Replaces an oid's serverid field with a randomly chosen one, used when
/// allocating a new node during a split so that newly-created siblings
/// spread across the cluster.
pub fn set_random_serverid(oid: Oid) -> Oid {
    let random_serverid = (rand::rng().next_u32() & 0xffff) as u16;
    (oid & !SERVERID_MASK) | (random_serverid as Oid)
}

/// Container + object identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct Coid {
    pub cid: Cid,
    pub oid: Oid,
}

impl Coid {
    pub const INVALID: Coid = Coid {
        cid: u64::MAX,
        oid: u64::MAX,
    };

    pub fn new(cid: Cid, oid: Oid) -> Self {
        Coid { cid, oid }
    }

    pub fn is_invalid(&self) -> bool {
        *self == Coid::INVALID
    }

    /// A coid is cacheable iff it addresses table metadata: `dbid != 0`,
    /// `tableid == 0`, `oid == 0`.
    pub fn is_cacheable(&self) -> bool {
        get_dbid(self.cid) != 0 && get_table(self.cid) == 0 && self.oid == 0
    }

    pub fn is_tree_node(&self) -> bool {
        is_tree_node(self.cid)
    }

    /// The root-node coid for the table this coid's cid addresses.
    pub fn root_of_table(&self) -> Coid {
        Coid {
            cid: self.cid,
            oid: 0,
        }
    }
}

impl fmt::Debug for Coid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Coid(db={},tree={},table={},oid={:x})",
            get_dbid(self.cid),
            is_tree_node(self.cid),
            get_table(self.cid),
            self.oid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_table_roundtrips() {
        let cid = get_cid_table(7, 42);
        assert_eq!(get_dbid(cid), 7);
        assert_eq!(get_table(cid), 42);
        assert!(is_tree_node(cid));
    }

    #[test]
    fn oid_roundtrips() {
        let oid = new_oid(100, 200, 300);
        assert_eq!(oid_issuerid(oid), 100);
        assert_eq!(oid_counter(oid), 200);
        assert_eq!(oid_serverid(oid), 300);
    }

    #[test]
    fn cacheable_only_for_table_metadata() {
        let meta = Coid::new(get_cid_table(7, 0), 0);
        assert!(meta.is_cacheable());

        let root = Coid::new(get_cid_table(7, 5), 0);
        assert!(!root.is_cacheable());

        let data = Coid::new(get_cid_table(7, 0), 9);
        assert!(!data.is_cacheable());

        let dbzero = Coid::new(get_cid_table(0, 0), 0);
        assert!(!dbzero.is_cacheable());
    }

    #[test]
    fn set_random_serverid_preserves_other_fields() {
        let oid = new_oid(5, 6, 7);
        let reassigned = set_random_serverid(oid);
        assert_eq!(oid_issuerid(reassigned), 5);
        assert_eq!(oid_counter(reassigned), 6);
    }
}
