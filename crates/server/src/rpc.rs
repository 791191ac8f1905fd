//! The wire-level request/response surface (spec.md §6): one variant per
//! RPC, carrying exactly the fields the table there enumerates. `client`
//! depends on this crate for these types rather than a separate proto
//! crate being generated, since nothing here needs schema evolution
//! tooling (no other consumer, no wire compatibility across versions).
use errors::{
    ErrorCode,
    ErrorMetadata,
    Tier,
};
use ids::{
    Coid,
    Tid,
    Timestamp,
};
use looim::Interval;
use serde::{
    Deserialize,
    Serialize,
};
use storevalue::{
    Attrs,
    Cell,
    CellType,
    KeyInfo,
};

/// Identifies a storage server within the cluster. Matches the width of
/// [`ids::oid_serverid`]'s result, since that field is how a coid is
/// routed to its owning server.
pub type ServerId = u16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Yes,
    No,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Commit,
    Abort,
    /// Application-level abort of a transaction that never prepared; no
    /// log record is required (spec.md §4.F).
    AppAbort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownLevel {
    SplitterOnly,
    Full,
}

/// Piggybacked on every non-administrative response. A zero/illegal
/// `reserve_ts` means "cache disabled for this server" (spec.md §6).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CachePiggyback {
    pub version_no: u64,
    pub ts: Timestamp,
    pub reserve_ts: Timestamp,
}

impl CachePiggyback {
    pub const DISABLED: CachePiggyback = CachePiggyback {
        version_no: 0,
        ts: Timestamp::MIN,
        reserve_ts: Timestamp::MIN,
    };
}

/// Wire-safe rendering of an [`ErrorMetadata`]: the stable `code` string
/// (spec.md §6's error codes), the retry `tier`, and a developer-facing
/// message. Reconstructed into a real `ErrorMetadata` by the client so
/// retry/defer classification logic doesn't have to special-case the RPC
/// boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub tier: String,
    pub msg: String,
}

impl From<&ErrorMetadata> for WireError {
    fn from(e: &ErrorMetadata) -> Self {
        WireError {
            code: e.code.as_str().to_owned(),
            tier: tier_str(e.tier).to_owned(),
            msg: e.msg.to_string(),
        }
    }
}

impl From<WireError> for ErrorMetadata {
    fn from(w: WireError) -> Self {
        let code = match w.code.as_str() {
            "WRONG_TYPE" => ErrorCode::WrongType,
            "DEFER_RPC" => ErrorCode::DeferRpc,
            "CELL_OUTRANGE" => ErrorCode::CellOutrange,
            "NO_MEM" => ErrorCode::NoMem,
            "SERVER_DOWN" => ErrorCode::ServerDown,
            _ => ErrorCode::NotFound,
        };
        ErrorMetadata::new(code, w.msg).with_tier(match w.tier.as_str() {
            "transient" => Tier::Transient,
            "defer" => Tier::Defer,
            "validation" => Tier::Validation,
            "conflict" => Tier::Conflict,
            _ => Tier::Fatal,
        })
    }
}

fn tier_str(tier: Tier) -> &'static str {
    match tier {
        Tier::Transient => "transient",
        Tier::Defer => "defer",
        Tier::Validation => "validation",
        Tier::Conflict => "conflict",
        Tier::Fatal => "fatal",
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Err(WireError),
}

impl Status {
    pub fn from_result<T>(r: &Result<T, ErrorMetadata>) -> Status {
        match r {
            Ok(_) => Status::Ok,
            Err(e) => Status::Err(e.into()),
        }
    }

    pub fn into_result(self) -> Result<(), ErrorMetadata> {
        match self {
            Status::Ok => Ok(()),
            Status::Err(w) => Err(w.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Null,
    Write {
        tid: Tid,
        coid: Coid,
        ts: Timestamp,
        buf: Vec<u8>,
    },
    Read {
        tid: Tid,
        coid: Coid,
        ts: Timestamp,
    },
    FullWrite {
        tid: Tid,
        coid: Coid,
        celltype: CellType,
        attrs: Attrs,
        cells: Vec<Cell>,
        pki: Option<KeyInfo>,
    },
    FullRead {
        tid: Tid,
        coid: Coid,
        ts: Timestamp,
        /// A load-split hint: the first cell this read actually
        /// accessed, reported so the server can trigger a cell-driven
        /// split at a hot key (spec.md §4.I `ReportAccess`).
        cell_hint: Option<Cell>,
    },
    ListAdd {
        tid: Tid,
        coid: Coid,
        cell: Cell,
        pki: Option<KeyInfo>,
        check_scope: bool,
        bypass_throttle: bool,
    },
    ListDelRange {
        tid: Tid,
        coid: Coid,
        range: Interval,
        pki: Option<KeyInfo>,
    },
    AttrSet {
        tid: Tid,
        coid: Coid,
        attrid: usize,
        attrvalue: i64,
    },
    Prepare {
        tid: Tid,
        start_ts: Timestamp,
        /// Write-on-prepare optimization: a value piggybacked onto this
        /// RPC, materialized only if no write to `coid` was already
        /// recorded for this tid (spec.md §4.F).
        piggy_write: Option<(Coid, Vec<u8>)>,
        one_shot: bool,
    },
    Commit {
        tid: Tid,
        committs: Timestamp,
        outcome: Outcome,
    },
    Shutdown {
        level: ShutdownLevel,
    },
    StartSplitter,
    FlushFile {
        /// Named in spec.md §6 for symmetry with `LoadFile`; this
        /// implementation has a single disk-log file per server, so the
        /// name is accepted and ignored rather than selecting among
        /// multiple logs.
        filename: String,
    },
    LoadFile {
        filename: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Null,
    Write {
        status: Status,
        cache: CachePiggyback,
    },
    Read {
        status: Status,
        read_ts: Timestamp,
        buf: Option<Vec<u8>>,
        cache: CachePiggyback,
    },
    FullWrite {
        status: Status,
        cache: CachePiggyback,
    },
    FullRead {
        status: Status,
        read_ts: Timestamp,
        attrs: Option<Attrs>,
        celltype: Option<CellType>,
        cells: Vec<Cell>,
        pki: Option<KeyInfo>,
        cache: CachePiggyback,
    },
    ListAdd {
        status: Status,
        ncells: usize,
        size: usize,
        cache: CachePiggyback,
    },
    ListDelRange {
        status: Status,
        cache: CachePiggyback,
    },
    AttrSet {
        status: Status,
    },
    Prepare {
        vote: Vote,
        mincommitts: Timestamp,
        cache: CachePiggyback,
    },
    Commit {
        status: Status,
        waitingts: Timestamp,
    },
    Shutdown {
        status: Status,
    },
    StartSplitter {
        status: Status,
    },
    FlushFile {
        status: Status,
    },
    LoadFile {
        status: Status,
    },
}
