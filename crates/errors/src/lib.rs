//! Stable error codes and a taxonomy for classifying failures, attached to
//! an `anyhow::Error` chain via `.context(e /* ErrorMetadata */)`.
use std::borrow::Cow;

mod metrics;

/// The six stable, numerically-identified error codes the RPC surface
/// exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Caller expected a value and found a supervalue, or vice versa.
    WrongType,
    /// Not an error: the RPC was parked and will be retried once a
    /// pending log-in-memory entry resolves.
    DeferRpc,
    /// A cell reference (by key or by position) fell outside a node's
    /// scope.
    CellOutrange,
    /// Allocation failure. Fatal-tier.
    NoMem,
    /// No PTI/looim/coid found where one was required.
    NotFound,
    /// The addressed server is unreachable or has shut down.
    ServerDown,
}

impl ErrorCode {
    /// Short ASCII identifier, stable across releases, suitable for wire
    /// encoding and test string-matching.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::WrongType => "WRONG_TYPE",
            ErrorCode::DeferRpc => "DEFER_RPC",
            ErrorCode::CellOutrange => "CELL_OUTRANGE",
            ErrorCode::NoMem => "NO_MEM",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ServerDown => "SERVER_DOWN",
        }
    }

    /// The recovery-strategy tier this code belongs to by default.
    /// Individual call sites may still attach a more specific
    /// [`ErrorMetadata`] that overrides the tier (e.g. a `NotFound` on a
    /// PTI during `Commit` is `Tier::Transient`, not `Tier::Validation`,
    /// because the write-on-prepare optimization can legitimately elide
    /// the PTI).
    pub fn default_tier(self) -> Tier {
        match self {
            ErrorCode::WrongType | ErrorCode::CellOutrange => Tier::Validation,
            ErrorCode::DeferRpc => Tier::Defer,
            ErrorCode::NoMem => Tier::Fatal,
            ErrorCode::NotFound => Tier::Validation,
            ErrorCode::ServerDown => Tier::Transient,
        }
    }
}

/// Recovery strategy classification for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// The client library retries transparently with exponential backoff.
    Transient,
    /// Not an error; the RPC is parked and resumed.
    Defer,
    /// Surfaced to the caller; no state change.
    Validation,
    /// Prepare voted no; all pending state at every participant rolls
    /// back.
    Conflict,
    /// Abort the process to avoid silent corruption.
    Fatal,
}

/// Attached to an `anyhow::Error` chain to classify a failure for
/// metrics, retries, and RPC status encoding.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub tier: Tier,
    /// Human-readable, developer-facing detail.
    pub msg: Cow<'static, str>,
}

impl ErrorMetadata {
    pub fn new(code: ErrorCode, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            tier: code.default_tier(),
            msg: msg.into(),
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn wrong_type(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::WrongType, msg)
    }

    pub fn cell_outrange(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::CellOutrange, msg)
    }

    pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn server_down(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ServerDown, msg)
    }

    pub fn no_mem(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::NoMem, msg)
    }

    /// Extract the `ErrorMetadata` from an anyhow error chain, if any
    /// link attached one.
    pub fn from_anyhow(e: &anyhow::Error) -> Option<&ErrorMetadata> {
        e.chain().find_map(|link| link.downcast_ref::<Self>())
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn is_tier(&self, tier: Tier) -> bool;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        ErrorMetadata::from_anyhow(self)
    }

    fn is_tier(&self, tier: Tier) -> bool {
        self.error_metadata().is_some_and(|m| m.tier == tier)
    }
}

/// Log and abort the process. Call only for `Tier::Fatal` errors
/// (out-of-memory, corrupted log header, an unknown tid surfacing where
/// the protocol guarantees it cannot) -- continuing risks silently
/// corrupting committed state.
pub fn report_fatal(err: &anyhow::Error) -> ! {
    tracing::error!("fatal error, aborting process: {err:?}");
    metrics::log_fatal_error();
    std::process::abort()
}
