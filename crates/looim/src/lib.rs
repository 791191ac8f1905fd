//! The per-object log-in-memory (LOOIM): MVCC history, conflict
//! detection, and the pending/committed entry lifecycle for a single
//! coid.
mod interval;
mod looim;
mod ticoid;

pub use interval::{
    Interval,
    Lower,
    Upper,
};
pub use looim::{
    Looim,
    PendingEntry,
    ReadOutcome,
};
pub use ticoid::{
    apply_ticoid,
    Ticoid,
    WriteOp,
};
