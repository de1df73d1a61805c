// Typed cluster configuration and the fields that can change at runtime.
use crate::error::{ClusterError, Result};
use crate::takeover::{DEFAULT_MAX_TAKEOVER_SESSIONS, MIN_TAKEOVER_RETENTION};
use felix_common::BrokerAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TRANSPORT: &str = "tcp";
pub const DEFAULT_PING_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_id: Option<String>,
    /// Name for the local broker; generated when absent.
    pub broker_id: Option<String>,
    pub instance_name: Option<String>,
    pub transport: String,
    pub host: Option<String>,
    /// Cluster service port; 0 picks one at bind time.
    pub port: u16,
    pub ping_interval_secs: i64,
    /// Peer list supplied on the command line.
    pub manual_peers: String,
    /// Peer list from the configuration file.
    pub peers: String,
    pub master_broker: Option<String>,
    pub max_takeover_sessions: usize,
    pub takeover_retention_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: None,
            broker_id: None,
            instance_name: None,
            transport: DEFAULT_TRANSPORT.to_string(),
            host: None,
            port: 0,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            manual_peers: String::new(),
            peers: String::new(),
            master_broker: None,
            max_takeover_sessions: DEFAULT_MAX_TAKEOVER_SESSIONS,
            takeover_retention_secs: MIN_TAKEOVER_RETENTION.as_secs(),
        }
    }
}

impl ClusterConfig {
    /// Command-line peers first, then the file list, joined for parsing.
    pub fn combined_peer_list(&self) -> String {
        join_peer_lists(&self.manual_peers, &self.peers)
    }

    /// Ping interval with non-positive values replaced by the default.
    pub fn ping_interval(&self) -> Duration {
        let secs = if self.ping_interval_secs > 0 {
            self.ping_interval_secs
        } else {
            DEFAULT_PING_INTERVAL_SECS
        };
        Duration::from_secs(secs.unsigned_abs())
    }

    pub fn takeover_retention(&self) -> Duration {
        Duration::from_secs(self.takeover_retention_secs).max(MIN_TAKEOVER_RETENTION)
    }

    /// Current value of a live-updatable field, rendered as an update string.
    pub fn field_value(&self, field: ConfigField) -> String {
        match field {
            ConfigField::Transport => self.transport.clone(),
            ConfigField::Host => self.host.clone().unwrap_or_default(),
            ConfigField::Port => self.port.to_string(),
            ConfigField::PingInterval => self.ping_interval_secs.to_string(),
            ConfigField::PeerList => self.peers.clone(),
            ConfigField::MasterBroker => self.master_broker.clone().unwrap_or_default(),
        }
    }
}

pub(crate) fn join_peer_lists(manual: &str, file: &str) -> String {
    match (manual.trim(), file.trim()) {
        ("", file) => file.to_string(),
        (manual, "") => manual.to_string(),
        (manual, file) => format!("{manual},{file}"),
    }
}

/// Settings that can be changed on a running registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigField {
    Transport,
    Host,
    Port,
    PingInterval,
    PeerList,
    MasterBroker,
}

impl ConfigField {
    pub const ALL: [ConfigField; 6] = [
        ConfigField::Transport,
        ConfigField::Host,
        ConfigField::Port,
        ConfigField::PingInterval,
        ConfigField::PeerList,
        ConfigField::MasterBroker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Host => "host",
            Self::Port => "port",
            Self::PingInterval => "ping_interval",
            Self::PeerList => "peer_list",
            Self::MasterBroker => "master_broker",
        }
    }

    /// Listeners hear about these through `cluster_property_changed`; the
    /// others surface as membership changes instead.
    pub fn is_listener_visible(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Host | Self::Port | Self::PingInterval
        )
    }

    /// Check the format of an update value.
    pub fn validate(self, value: &str) -> Result<()> {
        let value = value.trim();
        match self {
            Self::Transport => {
                if !value.is_empty()
                    && !value
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                {
                    return Err(ClusterError::rejected(self, value, "invalid transport name"));
                }
            }
            Self::Host => {
                if !value.is_empty() {
                    BrokerAddress::new(value, 0).map_err(|err| {
                        ClusterError::rejected(self, value, err.to_string())
                    })?;
                }
            }
            Self::Port => {
                value
                    .parse::<u16>()
                    .map_err(|_| ClusterError::rejected(self, value, "port must be 0-65535"))?;
            }
            Self::PingInterval => match value.parse::<i64>() {
                Ok(secs) if secs > 0 => {}
                _ => {
                    return Err(ClusterError::rejected(
                        self,
                        value,
                        "ping interval must be a positive integer",
                    ));
                }
            },
            Self::PeerList => {
                for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    entry.parse::<BrokerAddress>().map_err(|err| {
                        ClusterError::rejected(self, value, err.to_string())
                    })?;
                }
            }
            Self::MasterBroker => {
                if !value.is_empty() {
                    value.parse::<BrokerAddress>().map_err(|err| {
                        ClusterError::rejected(self, value, err.to_string())
                    })?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigField {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == input)
            .ok_or_else(|| format!("unknown cluster config field: {input}"))
    }
}
