use anyhow::{Context, Result, bail};
use felix_cluster::ClusterConfig;
use felix_common::BrokerAddress;
use felix_metadata::BrokerRecord;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8081";
const DEFAULT_LOCAL_ADDRESS: &str = "localhost:7676";
const DEFAULT_RELOAD_INTERVAL_MS: u64 = 30_000;

// Where membership comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipMode {
    #[default]
    Static,
    Directory,
}

impl FromStr for MembershipMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "directory" | "auto" | "auto-discovery" => Ok(Self::Directory),
            other => bail!("unknown membership mode: {other}"),
        }
    }
}

// Cluster service configuration sourced from environment variables and YAML.
#[derive(Debug, Clone)]
pub struct ClusterServiceConfig {
    // Metrics and health HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Cluster address of the broker this process represents.
    pub local_address: BrokerAddress,
    // How often configuration is re-read and applied.
    pub reload_interval_ms: u64,
    pub membership: MembershipMode,
    // Seed entries for the broker directory in directory mode.
    pub directory: Vec<BrokerRecord>,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClusterServiceConfigOverride {
    metrics_bind: Option<String>,
    local_address: Option<String>,
    reload_interval_ms: Option<u64>,
    membership: Option<MembershipMode>,
    directory: Option<Vec<DirectoryEntry>>,
    cluster_id: Option<String>,
    broker_id: Option<String>,
    instance_name: Option<String>,
    transport: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    ping_interval_secs: Option<i64>,
    peers: Option<String>,
    master_broker: Option<String>,
    max_takeover_sessions: Option<usize>,
    takeover_retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    name: String,
    address: String,
    #[serde(default)]
    version: u32,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

impl ClusterServiceConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = env_string("FELIX_CLUSTER_METRICS_BIND")
            .unwrap_or_else(|| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse FELIX_CLUSTER_METRICS_BIND")?;
        let local_address = env_string("FELIX_CLUSTER_LOCAL_ADDRESS")
            .unwrap_or_else(|| DEFAULT_LOCAL_ADDRESS.to_string())
            .parse()
            .with_context(|| "parse FELIX_CLUSTER_LOCAL_ADDRESS")?;
        let reload_interval_ms = env_parsed::<u64>("FELIX_CLUSTER_RELOAD_INTERVAL_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RELOAD_INTERVAL_MS);
        let membership = match env_string("FELIX_CLUSTER_MEMBERSHIP") {
            Some(value) => value
                .parse()
                .with_context(|| "parse FELIX_CLUSTER_MEMBERSHIP")?,
            None => MembershipMode::default(),
        };

        let defaults = ClusterConfig::default();
        let cluster = ClusterConfig {
            cluster_id: env_string("FELIX_CLUSTER_ID"),
            broker_id: env_string("FELIX_CLUSTER_BROKER_ID"),
            instance_name: env_string("FELIX_CLUSTER_INSTANCE_NAME"),
            transport: env_string("FELIX_CLUSTER_TRANSPORT").unwrap_or(defaults.transport),
            host: env_string("FELIX_CLUSTER_HOST"),
            port: env_parsed("FELIX_CLUSTER_PORT").unwrap_or(defaults.port),
            ping_interval_secs: env_parsed("FELIX_CLUSTER_PING_INTERVAL_SECS")
                .unwrap_or(defaults.ping_interval_secs),
            // Peers given on the command line or environment.
            manual_peers: env_string("FELIX_CLUSTER_PEERS").unwrap_or_default(),
            peers: String::new(),
            master_broker: env_string("FELIX_CLUSTER_MASTER_BROKER"),
            max_takeover_sessions: env_parsed::<usize>("FELIX_CLUSTER_MAX_TAKEOVER_SESSIONS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_takeover_sessions),
            takeover_retention_secs: env_parsed("FELIX_CLUSTER_TAKEOVER_RETENTION_SECS")
                .unwrap_or(defaults.takeover_retention_secs),
        };

        Ok(Self {
            metrics_bind,
            local_address,
            reload_interval_ms,
            membership,
            directory: Vec::new(),
            cluster,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FELIX_CLUSTER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FELIX_CLUSTER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ClusterServiceConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse cluster config yaml")?;
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.local_address {
            self.local_address = value.parse().with_context(|| "parse local_address")?;
        }
        if let Some(value) = override_cfg.reload_interval_ms
            && value > 0
        {
            self.reload_interval_ms = value;
        }
        if let Some(value) = override_cfg.membership {
            self.membership = value;
        }
        if let Some(entries) = override_cfg.directory {
            self.directory = entries
                .into_iter()
                .map(|entry| -> Result<BrokerRecord> {
                    let address = entry
                        .address
                        .parse()
                        .with_context(|| format!("parse directory address for {}", entry.name))?;
                    let mut record = BrokerRecord::new(entry.name, address);
                    record.version = entry.version;
                    Ok(record)
                })
                .collect::<Result<_>>()?;
        }

        let cluster = &mut self.cluster;
        if let Some(value) = override_cfg.cluster_id {
            cluster.cluster_id = Some(value);
        }
        if let Some(value) = override_cfg.broker_id {
            cluster.broker_id = Some(value);
        }
        if let Some(value) = override_cfg.instance_name {
            cluster.instance_name = Some(value);
        }
        if let Some(value) = override_cfg.transport {
            cluster.transport = value;
        }
        if let Some(value) = override_cfg.host {
            cluster.host = Some(value);
        }
        if let Some(value) = override_cfg.port {
            cluster.port = value;
        }
        if let Some(value) = override_cfg.ping_interval_secs {
            cluster.ping_interval_secs = value;
        }
        // The file list is kept apart from the environment list.
        if let Some(value) = override_cfg.peers {
            cluster.peers = value;
        }
        if let Some(value) = override_cfg.master_broker {
            cluster.master_broker = Some(value);
        }
        if let Some(value) = override_cfg.max_takeover_sessions
            && value > 0
        {
            cluster.max_takeover_sessions = value;
        }
        if let Some(value) = override_cfg.takeover_retention_secs {
            cluster.takeover_retention_secs = value;
        }
        Ok(())
    }

    pub fn reload_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reload_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const KEYS: [&str; 11] = [
        "FELIX_CLUSTER_METRICS_BIND",
        "FELIX_CLUSTER_LOCAL_ADDRESS",
        "FELIX_CLUSTER_RELOAD_INTERVAL_MS",
        "FELIX_CLUSTER_MEMBERSHIP",
        "FELIX_CLUSTER_ID",
        "FELIX_CLUSTER_BROKER_ID",
        "FELIX_CLUSTER_PEERS",
        "FELIX_CLUSTER_PORT",
        "FELIX_CLUSTER_PING_INTERVAL_SECS",
        "FELIX_CLUSTER_MASTER_BROKER",
        "FELIX_CLUSTER_CONFIG",
    ];

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn clear_env() -> Vec<EnvGuard> {
        KEYS.into_iter().map(EnvGuard::unset).collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _guards = clear_env();
        let config = ClusterServiceConfig::from_env().expect("config");
        assert_eq!(config.metrics_bind, DEFAULT_METRICS_BIND.parse::<SocketAddr>().unwrap());
        assert_eq!(config.local_address.to_string(), "mq://localhost:7676/");
        assert_eq!(config.reload_interval_ms, DEFAULT_RELOAD_INTERVAL_MS);
        assert_eq!(config.membership, MembershipMode::Static);
        assert_eq!(config.cluster, ClusterConfig::default());
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("FELIX_CLUSTER_PEERS", "b:1001,c:1002");
        let _g2 = EnvGuard::set("FELIX_CLUSTER_ID", "east");
        let _g3 = EnvGuard::set("FELIX_CLUSTER_PING_INTERVAL_SECS", "15");
        let _g4 = EnvGuard::set("FELIX_CLUSTER_MEMBERSHIP", "directory");
        let _g5 = EnvGuard::set("FELIX_CLUSTER_RELOAD_INTERVAL_MS", "0");
        let config = ClusterServiceConfig::from_env().expect("config");
        assert_eq!(config.cluster.manual_peers, "b:1001,c:1002");
        assert!(config.cluster.peers.is_empty());
        assert_eq!(config.cluster.cluster_id.as_deref(), Some("east"));
        assert_eq!(config.cluster.ping_interval_secs, 15);
        assert_eq!(config.membership, MembershipMode::Directory);
        assert_eq!(config.reload_interval_ms, DEFAULT_RELOAD_INTERVAL_MS);
    }

    #[test]
    #[serial]
    fn bad_local_address_is_an_error() {
        let _guards = clear_env();
        let _g = EnvGuard::set("FELIX_CLUSTER_LOCAL_ADDRESS", "not a host");
        assert!(ClusterServiceConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("FELIX_CLUSTER_PEERS", "b:1001");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "local_address: \"a:1000\"\n\
             reload_interval_ms: 500\n\
             peers: \"c:1002\"\n\
             master_broker: \"c:1002\"\n\
             membership: directory\n\
             directory:\n\
             \x20 - name: alpha\n\
             \x20   address: \"a:1000\"\n\
             \x20 - name: beta\n\
             \x20   address: \"b:1001\"\n\
             \x20   version: 2\n"
        )
        .expect("write yaml");
        let _g2 = EnvGuard::set(
            "FELIX_CLUSTER_CONFIG",
            file.path().to_str().expect("utf8 path"),
        );

        let config = ClusterServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.local_address.to_string(), "mq://a:1000/");
        assert_eq!(config.reload_interval_ms, 500);
        assert_eq!(config.cluster.manual_peers, "b:1001");
        assert_eq!(config.cluster.peers, "c:1002");
        assert_eq!(config.cluster.combined_peer_list(), "b:1001,c:1002");
        assert_eq!(config.cluster.master_broker.as_deref(), Some("c:1002"));
        assert_eq!(config.membership, MembershipMode::Directory);
        assert_eq!(config.directory.len(), 2);
        assert_eq!(config.directory[1].version, 2);
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let _guards = clear_env();
        let _g = EnvGuard::set("FELIX_CLUSTER_CONFIG", "/nonexistent/clusterd.yaml");
        let err = ClusterServiceConfig::from_env_or_yaml().expect_err("missing file");
        assert!(err.to_string().contains("FELIX_CLUSTER_CONFIG"));
    }

    #[test]
    fn membership_mode_parses_aliases() {
        assert_eq!(
            "Auto-Discovery".parse::<MembershipMode>().unwrap(),
            MembershipMode::Directory
        );
        assert_eq!(
            "static".parse::<MembershipMode>().unwrap(),
            MembershipMode::Static
        );
        assert!("zookeeper".parse::<MembershipMode>().is_err());
    }
}
