// Where the registry's membership comes from.
//
// The registry never decides by itself who belongs to the cluster: it asks a
// `MembershipSource`. The static source answers from configuration; the
// directory source answers from a shared broker directory and can be
// refreshed at any time.
use crate::config::ClusterConfig;
use crate::error::Result;
use felix_common::BrokerAddress;
use felix_common::ids::SessionId;
use felix_metadata::{BrokerDirectory, BrokerRecord};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A member as reported by a membership source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Known name, if the source assigns one.
    pub name: Option<String>,
    pub address: BrokerAddress,
    pub session: Option<SessionId>,
    pub version: u32,
}

impl PeerRecord {
    pub fn from_address(address: BrokerAddress) -> Self {
        Self {
            name: None,
            address,
            session: None,
            version: 0,
        }
    }
}

impl From<BrokerRecord> for PeerRecord {
    fn from(record: BrokerRecord) -> Self {
        Self {
            name: Some(record.name),
            address: record.address,
            session: record.session,
            version: record.version,
        }
    }
}

pub trait MembershipSource: Send + Sync {
    /// Members known at startup, in the order they were configured.
    fn init(&self, config: &ClusterConfig) -> Result<Vec<PeerRecord>>;

    /// Fresh listing, or `None` when the source cannot change on its own.
    fn refresh(&self) -> Result<Option<Vec<PeerRecord>>>;

    fn get(&self, name: &str) -> Result<Option<PeerRecord>>;

    /// Whether a master broker may be configured.
    fn allows_master_broker(&self) -> bool;

    /// Whether unknown addresses may join as dynamic members.
    fn allows_dynamic_members(&self) -> bool;

    fn kind(&self) -> &'static str;
}

/// Membership from the configured peer lists.
#[derive(Debug, Default)]
pub struct StaticMembership;

impl MembershipSource for StaticMembership {
    fn init(&self, config: &ClusterConfig) -> Result<Vec<PeerRecord>> {
        Ok(parse_broker_list(&config.combined_peer_list())
            .into_iter()
            .map(PeerRecord::from_address)
            .collect())
    }

    fn refresh(&self) -> Result<Option<Vec<PeerRecord>>> {
        Ok(None)
    }

    fn get(&self, _name: &str) -> Result<Option<PeerRecord>> {
        Ok(None)
    }

    fn allows_master_broker(&self) -> bool {
        true
    }

    fn allows_dynamic_members(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

/// Membership read from a shared broker directory.
pub struct DirectoryMembership {
    directory: Arc<dyn BrokerDirectory>,
}

impl DirectoryMembership {
    pub fn new(directory: Arc<dyn BrokerDirectory>) -> Self {
        Self { directory }
    }

    fn list(&self) -> Result<Vec<PeerRecord>> {
        Ok(self
            .directory
            .list()?
            .into_iter()
            .map(PeerRecord::from)
            .collect())
    }
}

impl MembershipSource for DirectoryMembership {
    fn init(&self, _config: &ClusterConfig) -> Result<Vec<PeerRecord>> {
        self.list()
    }

    fn refresh(&self) -> Result<Option<Vec<PeerRecord>>> {
        self.list().map(Some)
    }

    fn get(&self, name: &str) -> Result<Option<PeerRecord>> {
        Ok(self.directory.get(name)?.map(PeerRecord::from))
    }

    fn allows_master_broker(&self) -> bool {
        false
    }

    fn allows_dynamic_members(&self) -> bool {
        false
    }

    fn kind(&self) -> &'static str {
        "auto-discovery"
    }
}

/// The registry flavours that can be constructed.
#[derive(Clone)]
pub enum RegistryVariant {
    /// Members come from the configured peer lists.
    StaticConfig,
    /// Members come from a shared directory and are refreshed on demand.
    AutoDiscovery(Arc<dyn BrokerDirectory>),
}

impl RegistryVariant {
    pub(crate) fn into_source(self) -> Box<dyn MembershipSource> {
        match self {
            Self::StaticConfig => Box::new(StaticMembership),
            Self::AutoDiscovery(directory) => Box::new(DirectoryMembership::new(directory)),
        }
    }
}

impl fmt::Debug for RegistryVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticConfig => f.write_str("StaticConfig"),
            Self::AutoDiscovery(_) => f.write_str("AutoDiscovery"),
        }
    }
}

/// Parse a comma separated broker list.
///
/// Entries are deduplicated by canonical address, keeping the first
/// occurrence and the original order. Malformed entries are logged and
/// skipped; they never abort the rest of the list.
///
/// ```
/// use felix_cluster::parse_broker_list;
///
/// let peers = parse_broker_list("b:1001, c:1002,b:1001,,bad host");
/// let rendered: Vec<String> = peers.iter().map(|a| a.to_string()).collect();
/// assert_eq!(rendered, vec!["mq://b:1001/", "mq://c:1002/"]);
/// ```
pub fn parse_broker_list(values: &str) -> Vec<BrokerAddress> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();
    for entry in values.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.parse::<BrokerAddress>() {
            Ok(address) => {
                if seen.insert(address.canonical()) {
                    addresses.push(address);
                }
            }
            Err(err) => {
                tracing::error!(entry, error = %err, "skipping malformed broker address");
            }
        }
    }
    addresses
}
