//! The conflict-retry loop spec.md §7 describes as invisible to callers:
//! "Conflict: prepare voted no. The whole transaction retries from scratch
//! with a new tid; this is not surfaced to the application unless retries
//! are exhausted." [`run_txn`] is the one place that loop lives, so every
//! [`crate::client::Table`] method gets it for free.
use btree::{
    commit_single_shot,
    CommitResult,
    Outcome,
    TreeStore,
};
use errors::{
    ErrorMetadata,
    Tier,
};
use ids::{
    Tid,
    Timestamp,
};

/// A prepare-conflict loop longer than this indicates the application is
/// hammering the same hot key under sustained contention; surfacing an
/// error at that point beats retrying silently forever.
pub const MAX_CONFLICT_RETRIES: u32 = 10;

/// Runs `body` against a fresh `(tid, start_ts)` pair, committing it with
/// `btree::commit_single_shot` on success. A prepare conflict -- either
/// `body` itself surfacing `Tier::Conflict` (a server-side read-write
/// conflict detected outside of prepare, if one ever exists) or
/// `commit_single_shot` returning `CommitResult::Conflict` -- discards
/// every write `tid` made (via an explicit `AppAbort`) and retries with a
/// new tid. Any other error also aborts `tid`'s pending writes before
/// propagating.
pub async fn run_txn<T, F, Fut>(store: &dyn TreeStore, mut body: F) -> Result<T, ErrorMetadata>
where
    F: FnMut(Tid, Timestamp) -> Fut,
    Fut: std::future::Future<Output = Result<T, ErrorMetadata>>,
{
    for attempt in 0..MAX_CONFLICT_RETRIES {
        let tid = store.new_tid();
        let start_ts = Timestamp::set_new();
        match body(tid, start_ts).await {
            Ok(value) => match commit_single_shot(store, tid, start_ts).await? {
                CommitResult::Committed(_) => return Ok(value),
                CommitResult::Conflict => {
                    tracing::debug!(attempt, ?tid, "transaction conflicted at prepare, retrying");
                    continue;
                },
            },
            Err(e) if e.tier == Tier::Conflict => {
                abort(store, tid).await;
                tracing::debug!(attempt, ?tid, "transaction body hit a conflict, retrying");
                continue;
            },
            Err(e) => {
                abort(store, tid).await;
                return Err(e);
            },
        }
    }
    Err(ErrorMetadata::not_found("transaction exceeded the maximum number of conflict retries").with_tier(Tier::Conflict))
}

async fn abort(store: &dyn TreeStore, tid: Tid) {
    if let Err(err) = store.commit(tid, Timestamp::set_new(), Outcome::AppAbort).await {
        tracing::debug!(?tid, ?err, "best-effort abort failed, pending state will be cleaned up by the server");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
    };

    use async_trait::async_trait;
    use btree::{
        CommitOutcome,
        PrepareOutcome,
        Vote,
    };
    use ids::{
        Coid,
        Oid,
    };
    use looim::Interval;
    use storevalue::{
        Cell,
        SuperValue,
        Value,
    };

    use super::*;

    /// A store that votes no on the first `prepare` for a given tid, then
    /// yes afterwards -- just enough to exercise `run_txn`'s retry path.
    struct FlakyStore {
        attempts: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl TreeStore for FlakyStore {
        fn new_tid(&self) -> Tid {
            Tid::new()
        }

        async fn new_oid(&self) -> Oid {
            0
        }

        async fn read_value(&self, _tid: Tid, _coid: Coid, _ts: Timestamp) -> Result<Option<Value>, ErrorMetadata> {
            Ok(None)
        }

        async fn read_supervalue(&self, _tid: Tid, _coid: Coid, _ts: Timestamp) -> Result<Option<SuperValue>, ErrorMetadata> {
            Ok(None)
        }

        async fn write_value(&self, _tid: Tid, _coid: Coid, _value: Value) -> Result<(), ErrorMetadata> {
            Ok(())
        }

        async fn write_supervalue(&self, _tid: Tid, _coid: Coid, _sv: SuperValue) -> Result<(), ErrorMetadata> {
            Ok(())
        }

        async fn listadd(&self, _tid: Tid, _coid: Coid, _cell: Cell) -> Result<(), ErrorMetadata> {
            Ok(())
        }

        async fn listdelrange(&self, _tid: Tid, _coid: Coid, _interval: Interval) -> Result<(), ErrorMetadata> {
            Ok(())
        }

        async fn setattr(&self, _tid: Tid, _coid: Coid, _idx: usize, _value: i64) -> Result<(), ErrorMetadata> {
            Ok(())
        }

        async fn prepare(&self, _tid: Tid, start_ts: Timestamp, _one_shot: bool) -> Result<PrepareOutcome, ErrorMetadata> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Ok(PrepareOutcome {
                    vote: Vote::No,
                    mincommitts: Timestamp::MIN,
                })
            } else {
                Ok(PrepareOutcome {
                    vote: Vote::Yes,
                    mincommitts: start_ts,
                })
            }
        }

        async fn commit(&self, _tid: Tid, committs: Timestamp, _outcome: Outcome) -> Result<CommitOutcome, ErrorMetadata> {
            Ok(CommitOutcome { waitingts: committs })
        }
    }

    #[tokio::test]
    async fn retries_until_prepare_votes_yes() {
        let store = FlakyStore {
            attempts: AtomicU32::new(0),
            fail_first_n: 2,
        };
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();
        let result = run_txn(&store, move |_tid, _start_ts| {
            runs2.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ErrorMetadata>(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_body_error_is_not_retried() {
        let store = FlakyStore {
            attempts: AtomicU32::new(0),
            fail_first_n: 0,
        };
        let runs = Arc::new(AtomicU32::new(0));
        let runs2 = runs.clone();
        let result = run_txn(&store, move |_tid, _start_ts| {
            runs2.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ErrorMetadata::wrong_type("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
