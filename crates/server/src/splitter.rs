//! The background task that turns [`SplitHint`](crate::state::SplitHint)s
//! into actual tree splits (spec.md §4.H/§4.I): one single-shot
//! transaction per hint, driven through [`btree::split_cascade`] and
//! [`btree::commit_single_shot`] against [`ServerTreeStore`].
use std::sync::Arc;

use ids::Timestamp;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    state::{
        ServerState,
        SplitHint,
    },
    store::ServerTreeStore,
};

/// Drains `hints` until the channel closes (at server shutdown), applying
/// each with a fresh tid/timestamp. A hint that turns out unnecessary
/// (the node no longer needs splitting, or a racing splitter already
/// split it) is a silent no-op, not an error.
pub async fn run(state: Arc<ServerState>, mut hints: UnboundedReceiver<SplitHint>) {
    let store = ServerTreeStore(state.clone());
    while let Some(hint) = hints.recv().await {
        if !state.splitter_enabled() {
            continue;
        }
        if let Err(err) = apply_hint(&store, &state, hint).await {
            tracing::warn!(?err, "split attempt failed");
        }
    }
    tracing::info!("splitter task exiting: hint channel closed");
}

async fn apply_hint(store: &ServerTreeStore, state: &Arc<ServerState>, hint: SplitHint) -> Result<(), errors::ErrorMetadata> {
    let tid = ids::Tid::new();
    let ts = Timestamp::set_new();
    let table_cid = hint.coid.cid;

    let outcome = btree::split_cascade(store, tid, table_cid, hint.coid.oid, ts, &state.thresholds).await?;
    if matches!(outcome, btree::SplitOutcome::NotNeeded) {
        return Ok(());
    }

    match btree::commit_single_shot(store, tid, ts).await? {
        btree::CommitResult::Committed(final_ts) => {
            crate::metrics::SPLIT_TOTAL.inc();
            tracing::info!(coid = ?hint.coid, ?outcome, ?final_ts, "split committed");
        },
        btree::CommitResult::Conflict => {
            tracing::debug!(coid = ?hint.coid, "split prepare conflicted, will retry on next access");
        },
    }
    Ok(())
}
