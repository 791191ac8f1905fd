use std::cmp::Ordering;

use serde::{
    Deserialize,
    Serialize,
};

/// Describes how a super-value's composite (`pKey`) cells are compared.
/// The B-tree only ever produces [`KeyInfo::ByteLexicographic`]
/// super-values; the enum exists so a future comparator (e.g. one that
/// treats a numeric prefix specially) can be added without changing the
/// super-value representation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum KeyInfo {
    #[default]
    ByteLexicographic,
}

impl KeyInfo {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyInfo::ByteLexicographic => a.cmp(b),
        }
    }
}
