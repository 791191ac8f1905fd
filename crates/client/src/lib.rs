//! The client library (spec.md §4.G/§4.H/§4.I, §7): a [`cluster::Cluster`]
//! of RPC connections, the consistent client cache folded into every read,
//! transparent retry of transient RPC failures and prepare conflicts, and
//! a [`client::Table`] surface over `btree::ops` so an application never
//! drives a tid or a coid directly.
pub mod client;
pub mod cluster;
pub mod config;
pub mod retry;
pub mod store;
pub mod txn;


pub use client::{
    Client,
    Table,
};
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use store::RpcTreeStore;
