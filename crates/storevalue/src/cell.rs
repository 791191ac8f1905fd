use serde::{
    Deserialize,
    Serialize,
};

/// Whether a super-value's cells are ordered by an integer key (`nKey`,
/// used for B-tree interior nodes indexed by child separator) or by a
/// byte-string key (`pKey`, used for leaves holding actual key-value
/// pairs).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum CellType {
    Int,
    Composite,
}

/// One entry in a super-value's cell list: `(nKey, pKey, value)`. Which of
/// `n_key`/`p_key` is meaningful is determined by the owning super-value's
/// [`CellType`] -- exactly one of the two participates in ordering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub n_key: i64,
    pub p_key: Option<Vec<u8>>,
    pub value: i64,
}

impl Cell {
    pub fn with_nkey(n_key: i64, value: i64) -> Self {
        Cell {
            n_key,
            p_key: None,
            value,
        }
    }

    pub fn with_pkey(p_key: Vec<u8>, value: i64) -> Self {
        Cell {
            n_key: 0,
            p_key: Some(p_key),
            value,
        }
    }

    /// The ordering key, as bytes, according to `celltype`. For
    /// `CellType::Int` the sign bit is flipped before the big-endian
    /// encoding so that byte order coincides with signed integer order.
    pub fn sort_key(&self, celltype: CellType) -> Vec<u8> {
        match celltype {
            CellType::Int => ((self.n_key as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
            CellType::Composite => self.p_key.clone().unwrap_or_default(),
        }
    }
}
