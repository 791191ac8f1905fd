//! Server configuration: a `yesquel.toml`-style `key=value` file (spec.md
//! §6, ambient config) merged with `clap` CLI flags and `YESQUEL_*`
//! environment overrides, following `cmd_util`'s conventions.
use std::{
    net::SocketAddr,
    path::PathBuf,
};

use clap::Parser;
use cmd_util::{
    env::env_config,
    keyvalue::parse_key_value,
};

use crate::state::CACHE_RESERVE_MS_DEFAULT;

/// A single `key=value` line from the cluster config file. Unknown keys
/// are ignored rather than rejected, so a config file shared across a
/// cluster with heterogeneous server versions still parses.
struct ConfigLine {
    key: String,
    value: String,
}

impl TryFrom<(String, String)> for ConfigLine {
    type Error = anyhow::Error;

    fn try_from((key, value): (String, String)) -> Result<Self, Self::Error> {
        Ok(ConfigLine { key, value })
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Storage server: MVCC object store + distributed B-tree node")]
pub struct Args {
    /// This server's id within the cluster; also the low 16 bits of
    /// every oid it allocates a serverid for.
    #[arg(long, env = "YESQUEL_SERVER_ID")]
    pub server_id: u16,

    /// Address to accept client connections on.
    #[arg(long, env = "YESQUEL_LISTEN_ADDR", default_value = "127.0.0.1:7070")]
    pub listen_addr: SocketAddr,

    /// Path to the durable transaction log.
    #[arg(long, env = "YESQUEL_LOG_PATH", default_value = "yesquel.log")]
    pub log_path: PathBuf,

    /// Cluster config file; `key=value` lines, `#`-prefixed comments
    /// ignored. Overridden by the `YESQUEL_CONFIG` environment variable
    /// if set, which in turn is overridden by any flag given explicitly.
    #[arg(long, env = "YESQUEL_CONFIG", default_value = "yesquel.toml")]
    pub config_path: PathBuf,
}

/// Fully resolved server configuration: CLI/env overrides applied on top
/// of the config file's defaults.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_id: u16,
    pub listen_addr: SocketAddr,
    pub log_path: PathBuf,
    pub cache_reserve_ms: u64,
    pub split_size: usize,
    pub split_size_bytes: usize,
    pub split_minsize: usize,
    pub max_levels: usize,
}

impl Config {
    pub fn load(args: &Args) -> anyhow::Result<Config> {
        let mut cache_reserve_ms = CACHE_RESERVE_MS_DEFAULT;
        let thresholds = btree::SplitThresholds::default();
        let mut split_size = thresholds.split_size;
        let mut split_size_bytes = thresholds.split_size_bytes;
        let mut split_minsize = thresholds.split_minsize;
        let mut max_levels = thresholds.max_levels;

        if let Ok(contents) = std::fs::read_to_string(&args.config_path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let parsed: ConfigLine = match parse_key_value(line) {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::warn!(%line, ?err, "ignoring malformed config line");
                        continue;
                    },
                };
                match parsed.key.as_str() {
                    "cache_reserve_ms" => assign_parsed(&mut cache_reserve_ms, &parsed.value),
                    "split_size" => assign_parsed(&mut split_size, &parsed.value),
                    "split_size_bytes" => assign_parsed(&mut split_size_bytes, &parsed.value),
                    "split_minsize" => assign_parsed(&mut split_minsize, &parsed.value),
                    "max_levels" => assign_parsed(&mut max_levels, &parsed.value),
                    other => tracing::debug!(key = other, "unrecognized config key, ignoring"),
                }
            }
        } else {
            tracing::info!(path = ?args.config_path, "no cluster config file found, using defaults");
        }

        Ok(Config {
            server_id: args.server_id,
            listen_addr: args.listen_addr,
            log_path: args.log_path.clone(),
            cache_reserve_ms: env_config("YESQUEL_CACHE_RESERVE_MS", cache_reserve_ms),
            split_size: env_config("YESQUEL_SPLIT_SIZE", split_size),
            split_size_bytes: env_config("YESQUEL_SPLIT_SIZE_BYTES", split_size_bytes),
            split_minsize: env_config("YESQUEL_SPLIT_MINSIZE", split_minsize),
            max_levels: env_config("YESQUEL_MAX_LEVELS", max_levels),
        })
    }

    pub fn thresholds(&self) -> btree::SplitThresholds {
        btree::SplitThresholds {
            split_size: self.split_size,
            split_size_bytes: self.split_size_bytes,
            split_minsize: self.split_minsize,
            max_levels: self.max_levels,
        }
    }
}

fn assign_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    } else {
        tracing::warn!(value, "failed to parse config value, keeping default");
    }
}
