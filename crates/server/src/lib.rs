//! The storage server: per-coid MVCC logs, the pending-transaction
//! table, the 2PC `Prepare`/`Commit` RPC pair, and the background
//! splitter that keeps the distributed B-tree's nodes within their size
//! budget.
pub mod config;
pub mod dispatch;
mod metrics;
pub mod recovery;
pub mod rpc;
pub mod splitter;
pub mod state;
pub mod store;
pub mod transport;

#[cfg(test)]
mod server_test;

pub use state::ServerState;
