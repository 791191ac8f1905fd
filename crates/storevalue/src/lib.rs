//! The two forms a stored object can take -- a plain [`Value`] or a
//! [`SuperValue`] -- and the supporting types ([`Cell`], [`Attrs`],
//! [`KeyInfo`]) that make up a super-value's structure.
mod attrs;
mod cell;
mod keyinfo;
mod supervalue;
mod value;

pub use attrs::{
    Attrs,
    NUM_ATTRS,
};
pub use cell::{
    Cell,
    CellType,
};
pub use keyinfo::KeyInfo;
pub use supervalue::SuperValue;
pub use value::Value;

use errors::ErrorMetadata;
use ids::Coid;

/// Either of the two forms an object can take at a given point in time.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StoredValue {
    Value(Value),
    SuperValue(SuperValue),
}

impl StoredValue {
    pub fn as_value(&self) -> Result<&Value, ErrorMetadata> {
        match self {
            StoredValue::Value(v) => Ok(v),
            StoredValue::SuperValue(_) => {
                Err(ErrorMetadata::wrong_type("expected a value, found a supervalue"))
            },
        }
    }

    pub fn as_supervalue(&self) -> Result<&SuperValue, ErrorMetadata> {
        match self {
            StoredValue::SuperValue(sv) => Ok(sv),
            StoredValue::Value(_) => {
                Err(ErrorMetadata::wrong_type("expected a supervalue, found a value"))
            },
        }
    }

    pub fn into_supervalue(self) -> Result<SuperValue, ErrorMetadata> {
        match self {
            StoredValue::SuperValue(sv) => Ok(sv),
            StoredValue::Value(_) => {
                Err(ErrorMetadata::wrong_type("expected a supervalue, found a value"))
            },
        }
    }
}

/// A coid paired with the value last read or written for it, plus the
/// timestamps bracketing when that was true. Mirrors the original
/// `Valbuf`: `readTs >= commitTs`, and the object is guaranteed unwritten
/// in `(commitTs, readTs]`.
#[derive(Clone, Debug)]
pub struct Valbuf {
    pub coid: Coid,
    pub value: StoredValue,
    pub commit_ts: ids::Timestamp,
    pub read_ts: ids::Timestamp,
}
