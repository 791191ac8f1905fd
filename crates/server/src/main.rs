use std::sync::Arc;

use clap::Parser;
use server::{
    config::{
        Args,
        Config,
    },
    recovery,
    splitter,
    state::ServerState,
    transport,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _tracing_guard = cmd_util::env::config_service();
    let args = Args::parse();
    let config = Config::load(&args)?;

    let disklog = disklog::DiskLog::open(&config.log_path).await?;
    let recovered = recovery::recover(&config.log_path).await?;

    let (split_tx, split_rx) = tokio::sync::mpsc::unbounded_channel();
    let state = ServerState::new(config.server_id, disklog, config.thresholds(), config.cache_reserve_ms, split_tx);

    for (coid, ts, ticoid) in recovered {
        let pending = state.looim(coid).add_pending(ts, ids::Tid::new(), ticoid);
        state.looim(coid).resolve_pending(&pending, ts, true);
    }
    tracing::info!(server_id = config.server_id, log = ?config.log_path, "recovered log history");

    tokio::spawn(splitter::run(state.clone(), split_rx));
    tokio::spawn(reserve_advance_loop(state.clone()));

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "storage server listening");

    tokio::select! {
        result = transport::serve_tcp(state.clone(), listener) => result?,
        _ = state.wait_for_shutdown() => {
            tracing::info!("shutdown requested, exiting");
        }
    }

    Ok(())
}

/// Periodically lifts the cache reserve horizon (spec.md §4.G), so a
/// server that's been idle still eventually advances `advance_ts` for
/// clients polling it.
async fn reserve_advance_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(200));
    loop {
        interval.tick().await;
        state.cache.try_advance_reserve(ids::Timestamp::set_new());
    }
}
