//! The client-side consistent cache (§4.G): per-remote-server bookkeeping
//! of a version number, a `[ts, advanceTs]` reserve window, and a map of
//! cached `Valbuf`s. A server's `advanceTs` is a promise that no update to
//! cacheable data will land at or below it, so a lookup for a timestamp in
//! `(ts, advanceTs]` can be answered from the cache without a round trip.
use std::{
    collections::HashMap,
    sync::Arc,
};

use ids::{
    Coid,
    Timestamp,
};
use parking_lot::RwLock;
use storevalue::Valbuf;

/// Identifies a remote storage server. Matches the width of
/// [`ids::oid_serverid`]'s result, since that's how a coid is routed to
/// the server that owns it.
pub type ServerId = u16;

/// How far `advanceTs` leads real time on a freshly reserved server, per
/// `original_source/include/ccache.h`'s `CACHE_RESERVE_TIME` literal
/// (1543ms). Exposed so `server` can read the same knob via
/// `cmd_util::env_config`.
pub const CACHE_RESERVE_TIME_MS_DEFAULT: u64 = 1543;

struct PerServerState {
    version_no: u64,
    ts: Timestamp,
    advance_ts: Timestamp,
    cachemap: HashMap<Coid, Arc<Valbuf>>,
}

impl PerServerState {
    fn new() -> Self {
        PerServerState {
            version_no: 0,
            ts: Timestamp::MIN,
            advance_ts: Timestamp::MIN,
            cachemap: HashMap::new(),
        }
    }
}

/// A client's cache across every server it has talked to. Cheap to clone
/// (internally reference-counted); safe to share across a process's
/// concurrent transactions.
#[derive(Clone, Default)]
pub struct ClientCache {
    servers: Arc<RwLock<HashMap<ServerId, Arc<RwLock<PerServerState>>>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn server(&self, serverid: ServerId) -> Arc<RwLock<PerServerState>> {
        if let Some(s) = self.servers.read().get(&serverid) {
            return s.clone();
        }
        self.servers
            .write()
            .entry(serverid)
            .or_insert_with(|| Arc::new(RwLock::new(PerServerState::new())))
            .clone()
    }

    /// Folds a piggybacked `(versionNo, ts, advanceTs)` report from
    /// `serverid` into the client's cache state for it.
    ///
    /// - `vno == versionNo`: the server's cached data hasn't changed;
    ///   just raise `advanceTs` if the new report is fresher.
    /// - `vno > versionNo`: the server's data changed since we last
    ///   heard from it; this is effectively an invalidation message, so
    ///   drop every cached entry for it and adopt the new window.
    /// - `vno < versionNo`: a stale, out-of-order reply; ignored (L5).
    pub fn report(&self, serverid: ServerId, vno: u64, ts: Timestamp, advance_ts: Timestamp) {
        let server = self.server(serverid);
        let mut state = server.write();
        match vno.cmp(&state.version_no) {
            std::cmp::Ordering::Equal => {
                if advance_ts > state.advance_ts {
                    state.advance_ts = advance_ts;
                }
            },
            std::cmp::Ordering::Greater => {
                tracing::debug!(serverid, vno, old_vno = state.version_no, "client cache invalidated");
                state.cachemap.clear();
                state.version_no = vno;
                state.ts = ts;
                state.advance_ts = advance_ts;
            },
            std::cmp::Ordering::Less => {
                tracing::debug!(serverid, vno, current = state.version_no, "ignoring stale cache report");
            },
        }
    }

    /// Returns the cached value for `coid` if `read_ts` falls in the
    /// server's reserve window `(ts, advanceTs]`; otherwise `None`
    /// (caller must fetch from the server directly).
    pub fn lookup(&self, serverid: ServerId, coid: Coid, read_ts: Timestamp) -> Option<Arc<Valbuf>> {
        let server = self.server(serverid);
        let state = server.read();
        if state.ts < read_ts && read_ts <= state.advance_ts {
            state.cachemap.get(&coid).cloned()
        } else {
            None
        }
    }

    /// Inserts `buf` into the cache for `serverid` if not already
    /// present. A present entry is expected to be byte-identical (the
    /// server never reuses a coid for different cacheable content within
    /// one version); this is checked in debug builds only.
    pub fn set(&self, serverid: ServerId, coid: Coid, buf: Arc<Valbuf>) {
        let server = self.server(serverid);
        let mut state = server.write();
        match state.cachemap.get(&coid) {
            Some(existing) => {
                debug_assert!(
                    matches!((&existing.value, &buf.value), (a, b) if format!("{a:?}") == format!("{b:?}")),
                    "cache set for {coid:?} disagrees with existing cached value"
                );
            },
            None => {
                state.cachemap.insert(coid, buf);
            },
        }
    }

    pub fn version_no(&self, serverid: ServerId) -> u64 {
        self.server(serverid).read().version_no
    }
}
