//! Cluster addressing: a `serverid=host:port` config file in the same
//! `key=value` shape `server::config` reads (spec.md §6 "a single
//! environment variable selects the cluster configuration file path").
//! The client only needs the address map; the per-server tuning knobs
//! (`split_size`, `cache_reserve_ms`, ...) are the storage server's own
//! concern.
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
};

use cmd_util::{
    env::env_config,
    keyvalue::parse_key_value,
};
use server::rpc::ServerId;

struct AddrLine {
    serverid: ServerId,
    addr: SocketAddr,
}

impl TryFrom<(ServerId, SocketAddr)> for AddrLine {
    type Error = anyhow::Error;

    fn try_from((serverid, addr): (ServerId, SocketAddr)) -> Result<Self, Self::Error> {
        Ok(AddrLine { serverid, addr })
    }
}

/// `serverid -> address` for every server in the cluster. `#`-prefixed
/// lines and blanks are ignored; unparseable lines are logged and skipped
/// rather than failing the whole file, matching `server::config`'s
/// tolerance for a config file shared across heterogeneous versions.
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    pub addrs: HashMap<ServerId, SocketAddr>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> anyhow::Result<ClusterConfig> {
        let mut addrs = HashMap::new();
        let contents = std::fs::read_to_string(path)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_key_value::<ServerId, SocketAddr, AddrLine>(line) {
                Ok(parsed) => {
                    addrs.insert(parsed.serverid, parsed.addr);
                },
                Err(err) => tracing::warn!(%line, ?err, "ignoring malformed cluster config line"),
            }
        }
        Ok(ClusterConfig { addrs })
    }

    /// Path resolution mirrors `server::config::Args::config_path`: the
    /// `YESQUEL_CLIENT_CONFIG` environment variable, defaulting to
    /// `yesquel-client.toml`.
    pub fn load_from_env() -> anyhow::Result<ClusterConfig> {
        let path: String = env_config("YESQUEL_CLIENT_CONFIG", "yesquel-client.toml".to_owned());
        Self::load(Path::new(&path))
    }

    pub fn insert(&mut self, serverid: ServerId, addr: SocketAddr) {
        self.addrs.insert(serverid, addr);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_serverid_address_lines_and_skips_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# cluster map").unwrap();
        writeln!(file, "1=127.0.0.1:7070").unwrap();
        writeln!(file, "2=127.0.0.1:7071").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "garbage line").unwrap();
        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.addrs.len(), 2);
        assert_eq!(config.addrs[&1], "127.0.0.1:7070".parse().unwrap());
        assert_eq!(config.addrs[&2], "127.0.0.1:7071".parse().unwrap());
    }
}
