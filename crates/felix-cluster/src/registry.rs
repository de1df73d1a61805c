// Authoritative membership map for one broker's view of the cluster.
//
// Lock order: map -> entity. The map lock is never held while a change is
// raised, so listener callbacks are free to call back into the registry.
use crate::broker::{ClusteredBroker, NewBroker};
use crate::config::{ClusterConfig, ConfigField, DEFAULT_TRANSPORT};
use crate::error::{ClusterError, Result};
use crate::event::{ClusterChange, ClusterListener, UserData};
use crate::membership::{MembershipSource, PeerRecord, RegistryVariant, parse_broker_list};
use crate::notify::NotificationPipeline;
use crate::status::BrokerStatus;
use crate::takeover::TakeoverRetention;
use ahash::RandomState;
use felix_common::BrokerAddress;
use felix_common::ids::{SessionId, StoreSessionId};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

type BrokerMap = HashMap<String, Arc<ClusteredBroker>, RandomState>;

/// How callers name a broker when activating or deactivating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerRef {
    Name(String),
    Address(BrokerAddress),
}

impl From<&str> for BrokerRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<BrokerAddress> for BrokerRef {
    fn from(address: BrokerAddress) -> Self {
        Self::Address(address)
    }
}

impl fmt::Display for BrokerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Address(address) => write!(f, "{address}"),
        }
    }
}

// A broker about to be inserted, before a name has been settled.
struct Candidate {
    name: Option<String>,
    address: BrokerAddress,
    config_defined: bool,
    session: Option<SessionId>,
    version: u32,
    local: bool,
}

impl Candidate {
    fn configured(address: BrokerAddress) -> Self {
        Self {
            name: None,
            address,
            config_defined: true,
            session: None,
            version: 0,
            local: false,
        }
    }

    fn from_record(record: PeerRecord) -> Self {
        Self {
            name: record.name,
            address: record.address,
            config_defined: true,
            session: record.session,
            version: record.version,
            local: false,
        }
    }
}

/// The cluster registry.
///
/// Every query and mutation fails with [`ClusterError::NotInitialized`] until
/// [`ClusterRegistry::initialize`] has run. Listener registration is allowed
/// beforehand so listeners see the brokers added during initialization.
///
/// ```
/// use felix_cluster::{ClusterConfig, ClusterRegistry, RegistryVariant};
///
/// let config = ClusterConfig {
///     peers: "b:1001,c:1002,b:1001".to_string(),
///     ..ClusterConfig::default()
/// };
/// let registry = ClusterRegistry::new(config, RegistryVariant::StaticConfig);
/// let local = registry.initialize("a:1000".parse().expect("address")).expect("init");
/// assert_eq!(registry.known_broker_count().expect("count"), 3);
/// assert!(registry.get_local_broker().expect("local").is_local());
/// assert_eq!(registry.get_broker(&local).expect("get").map(|b| b.is_local()), Some(true));
/// ```
pub struct ClusterRegistry {
    source: Box<dyn MembershipSource>,
    auto_discovery: bool,
    pipeline: Arc<NotificationPipeline>,
    brokers: Mutex<BrokerMap>,
    // Set once by initialize; doubles as the initialized flag.
    local: OnceLock<Arc<ClusteredBroker>>,
    init_lock: Mutex<()>,
    master: RwLock<Option<String>>,
    settings: RwLock<ClusterConfig>,
    // Configured member addresses in listed order.
    member_order: Mutex<Vec<BrokerAddress>>,
    takeover: TakeoverRetention,
    name_seq: AtomicU64,
}

impl ClusterRegistry {
    pub fn new(config: ClusterConfig, variant: RegistryVariant) -> Self {
        let auto_discovery = matches!(variant, RegistryVariant::AutoDiscovery(_));
        let takeover =
            TakeoverRetention::new(config.max_takeover_sessions, config.takeover_retention());
        Self {
            source: variant.into_source(),
            auto_discovery,
            pipeline: Arc::new(NotificationPipeline::new()),
            brokers: Mutex::new(HashMap::with_hasher(RandomState::new())),
            local: OnceLock::new(),
            init_lock: Mutex::new(()),
            master: RwLock::new(None),
            settings: RwLock::new(config),
            member_order: Mutex::new(Vec::new()),
            takeover,
            name_seq: AtomicU64::new(1),
        }
    }

    fn local(&self) -> Result<&Arc<ClusteredBroker>> {
        self.local.get().ok_or(ClusterError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.local.get().is_some()
    }

    pub fn is_auto_discovery(&self) -> bool {
        self.auto_discovery
    }

    /// Register the local broker and the configured membership.
    ///
    /// Returns the local broker's name. Calling it again only moves the local
    /// broker to `local_address` (raising an address change); membership is
    /// not rediscovered.
    ///
    /// Changes raised here reach listeners only after `init_lock` is
    /// released, so a listener may call back into this method.
    pub fn initialize(&self, local_address: BrokerAddress) -> Result<String> {
        let held = self.pipeline.hold();
        let result = {
            let _init = self.init_lock.lock();
            self.initialize_locked(local_address)
        };
        drop(held);
        result
    }

    fn initialize_locked(&self, local_address: BrokerAddress) -> Result<String> {
        if let Some(local) = self.local.get() {
            let listed = self.member_order.lock().contains(&local_address);
            local.set_config_defined(listed);
            local.set_address(local_address);
            return Ok(local.name().to_string());
        }

        let config = self.settings.read().clone();
        let records = self.source.init(&config)?;
        let local_record = records.iter().find(|r| r.address == local_address);
        let local_name = config
            .broker_id
            .clone()
            .or_else(|| local_record.and_then(|r| r.name.clone()));
        let (local, _) = self.insert_if_absent(Candidate {
            name: local_name,
            address: local_address.clone(),
            config_defined: local_record.is_some(),
            session: Some(SessionId::new()),
            version: 0,
            local: true,
        });
        local.set_instance_name(config.instance_name.clone());
        // Published before any event so listeners can already query.
        let _ = self.local.set(Arc::clone(&local));
        self.raise_added(&local);
        local.set_status(BrokerStatus::ACTIVATE_BROKER, None);

        *self.member_order.lock() = records.iter().map(|r| r.address.clone()).collect();
        for record in records {
            if record.address != local_address {
                self.find_or_insert(Candidate::from_record(record));
            }
        }

        if let Some(master) = config
            .master_broker
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
        {
            if !self.source.allows_master_broker() {
                tracing::warn!(master, "master broker is ignored with auto-discovery membership");
            } else {
                match master.parse::<BrokerAddress>() {
                    Ok(address) => self.designate_master(Some(address)),
                    Err(err) => {
                        tracing::error!(master, error = %err, "bad master broker address; no master set")
                    }
                }
            }
        }

        tracing::info!(
            broker = %local.name(),
            address = %local_address,
            membership = self.source.kind(),
            members = self.brokers.lock().len(),
            "cluster registry initialized"
        );
        Ok(local.name().to_string())
    }

    /// Initialize on first use, then move the local broker.
    pub fn set_local_address(&self, address: BrokerAddress) -> Result<String> {
        self.initialize(address)
    }

    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.pipeline.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClusterListener>) -> bool {
        self.pipeline.remove_listener(listener)
    }

    /// Queue a change for ordered delivery to listeners.
    pub fn broker_changed(&self, change: ClusterChange) {
        self.pipeline.broker_changed(change);
    }

    /// Mark a broker active, creating it if the membership source allows.
    pub fn activate_broker(
        &self,
        target: impl Into<BrokerRef>,
        session: Option<SessionId>,
        instance_name: Option<String>,
        user_data: Option<UserData>,
    ) -> Result<String> {
        self.local()?;
        let broker = self.resolve_or_create(&target.into())?;
        broker.activate(session, instance_name, user_data);
        tracing::debug!(broker = %broker, "broker activated");
        Ok(broker.name().to_string())
    }

    /// Mark a broker's link down, forgetting it if it was discovered
    /// dynamically.
    pub fn deactivate_broker(
        &self,
        target: impl Into<BrokerRef>,
        user_data: Option<UserData>,
    ) -> Result<()> {
        self.local()?;
        let target = target.into();
        let broker = self
            .resolve(&target)
            .ok_or_else(|| ClusterError::UnknownBroker(target.to_string()))?;
        if broker.is_local() {
            return Err(ClusterError::LocalBroker(broker.name().to_string()));
        }
        let removed = !broker.is_config_defined()
            && self.source.allows_dynamic_members()
            && self.remove_entry(broker.name()).is_some();
        broker.deactivate(user_data);
        if removed {
            self.raise_removed(&broker);
        }
        tracing::debug!(broker = %broker, removed, "broker deactivated");
        Ok(())
    }

    /// Mark a broker down and drop it from the registry.
    pub fn destroy_broker(&self, name: &str) -> Result<()> {
        let local = self.local()?;
        if local.name() == name {
            return Err(ClusterError::LocalBroker(name.to_string()));
        }
        let broker = self
            .remove_entry(name)
            .ok_or_else(|| ClusterError::UnknownBroker(name.to_string()))?;
        broker.mark_destroyed();
        self.raise_removed(&broker);
        Ok(())
    }

    pub fn get_broker(&self, name: &str) -> Result<Option<Arc<ClusteredBroker>>> {
        self.local()?;
        if let Some(broker) = self.lookup(name) {
            return Ok(Some(broker));
        }
        if self.refresh_members()? {
            return Ok(self.lookup(name));
        }
        Ok(None)
    }

    pub fn get_local_broker(&self) -> Result<Arc<ClusteredBroker>> {
        self.local().cloned()
    }

    pub fn get_master_broker(&self) -> Result<Option<Arc<ClusteredBroker>>> {
        self.local()?;
        let name = self.master.read().clone();
        Ok(name.and_then(|name| self.lookup(&name)))
    }

    /// Point-in-time copy of every known broker, ordered by name.
    pub fn get_known_brokers(&self, refresh: bool) -> Result<Vec<Arc<ClusteredBroker>>> {
        self.local()?;
        if refresh {
            self.refresh_members()?;
        }
        Ok(self.snapshot())
    }

    /// Config-defined brokers. Dynamic brokers whose link is down are pruned
    /// as a side effect of the scan.
    pub fn get_config_brokers(&self) -> Result<Vec<Arc<ClusteredBroker>>> {
        self.local()?;
        self.refresh_members()?;
        Ok(self.scan_and_prune(|broker| broker.is_config_defined()))
    }

    /// Brokers whose link is up. Dynamic brokers whose link is down are
    /// pruned as a side effect of the scan.
    pub fn get_active_brokers(&self) -> Result<Vec<Arc<ClusteredBroker>>> {
        self.local()?;
        Ok(self.scan_and_prune(|broker| broker.status().is_link_up()))
    }

    pub fn known_broker_count(&self) -> Result<usize> {
        self.local()?;
        Ok(self.brokers.lock().len())
    }

    pub fn config_broker_count(&self) -> Result<usize> {
        self.local()?;
        Ok(self
            .brokers
            .lock()
            .values()
            .filter(|broker| broker.is_config_defined())
            .count())
    }

    pub fn active_broker_count(&self) -> Result<usize> {
        self.local()?;
        Ok(self
            .brokers
            .lock()
            .values()
            .filter(|broker| broker.status().is_link_up())
            .count())
    }

    pub fn lookup_broker_id(&self, address: &BrokerAddress) -> Result<Option<String>> {
        self.local()?;
        self.refresh_members()?;
        Ok(self
            .find_by_address(address)
            .map(|broker| broker.name().to_string()))
    }

    pub fn lookup_broker_session_id(&self, session: SessionId) -> Result<Option<String>> {
        self.local()?;
        // Sessions change out-of-band, so this is a scan rather than an index.
        Ok(self
            .snapshot()
            .into_iter()
            .find(|broker| broker.session() == Some(session))
            .map(|broker| broker.name().to_string()))
    }

    pub fn parse_broker_list(&self, values: &str) -> Vec<BrokerAddress> {
        parse_broker_list(values)
    }

    pub fn transport(&self) -> Result<String> {
        self.local()?;
        Ok(self.settings.read().transport.clone())
    }

    pub fn cluster_host(&self) -> Result<Option<String>> {
        self.local()?;
        Ok(self.settings.read().host.clone())
    }

    pub fn cluster_port(&self) -> Result<u16> {
        self.local()?;
        Ok(self.settings.read().port)
    }

    pub fn ping_interval(&self) -> Result<Duration> {
        self.local()?;
        Ok(self.settings.read().ping_interval())
    }

    pub fn cluster_id(&self) -> Result<Option<String>> {
        self.local()?;
        Ok(self.settings.read().cluster_id.clone())
    }

    pub fn local_address(&self) -> Result<BrokerAddress> {
        Ok(self.local()?.address())
    }

    pub fn local_session(&self) -> Result<Option<SessionId>> {
        Ok(self.local()?.session())
    }

    /// The peer after the local broker in configured order, wrapping around.
    pub fn next_broker(&self) -> Result<Option<BrokerAddress>> {
        let local_address = self.local()?.address();
        Ok(next_after(&self.member_order.lock(), &local_address))
    }

    /// Current settings, including live updates applied so far.
    pub fn settings(&self) -> ClusterConfig {
        self.settings.read().clone()
    }

    pub fn takeover(&self) -> &TakeoverRetention {
        &self.takeover
    }

    pub fn partition_added(&self, id: StoreSessionId) {
        self.takeover.record(id);
    }

    pub fn partition_removed(&self, id: StoreSessionId) {
        self.takeover.mark_surrendered(id);
    }

    pub fn supported_session_ids(&self) -> Result<BTreeSet<String>> {
        let local = self.local()?;
        Ok(self.takeover.supported_session_ids(local.session()))
    }

    /// Check an update without applying it.
    pub fn validate_config_update(&self, field: ConfigField, value: &str) -> Result<()> {
        field.validate(value)?;
        let value = value.trim();
        if self.auto_discovery
            && matches!(field, ConfigField::PeerList | ConfigField::MasterBroker)
            && !value.is_empty()
        {
            return Err(ClusterError::rejected(
                field,
                value,
                "membership comes from the broker directory",
            ));
        }
        Ok(())
    }

    /// Validate and apply a live configuration change.
    ///
    /// A rejected value leaves every setting as it was.
    pub fn apply_config_update(&self, field: ConfigField, value: &str) -> Result<()> {
        let local = Arc::clone(self.local()?);
        self.validate_config_update(field, value)?;
        let value = value.trim();
        match field {
            ConfigField::Transport => {
                let transport = if value.is_empty() {
                    DEFAULT_TRANSPORT
                } else {
                    value
                };
                self.settings.write().transport = transport.to_string();
            }
            ConfigField::Host => {
                self.settings.write().host = (!value.is_empty()).then(|| value.to_string());
            }
            ConfigField::Port => {
                let port = value
                    .parse()
                    .map_err(|_| ClusterError::rejected(field, value, "port must be 0-65535"))?;
                self.settings.write().port = port;
            }
            ConfigField::PingInterval => {
                let secs = value.parse().map_err(|_| {
                    ClusterError::rejected(field, value, "ping interval must be a positive integer")
                })?;
                self.settings.write().ping_interval_secs = secs;
            }
            ConfigField::PeerList => {
                self.settings.write().peers = value.to_string();
                // The directory owns membership; only the setting is recorded.
                if !self.auto_discovery {
                    self.peer_list_changed(&local);
                }
            }
            ConfigField::MasterBroker => {
                let address = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<BrokerAddress>()?)
                };
                self.settings.write().master_broker = (!value.is_empty()).then(|| value.to_string());
                self.designate_master(address);
            }
        }
        tracing::info!(field = %field, value, "cluster configuration updated");
        if field.is_listener_visible() {
            self.pipeline.broker_changed(ClusterChange::PropertyChanged {
                field,
                value: value.to_string(),
            });
        }
        Ok(())
    }

    /// Apply every live field that differs from the current settings.
    ///
    /// All changed values are validated first; if any is rejected nothing is
    /// applied. Returns the fields that changed.
    pub fn reload_config(&self, config: &ClusterConfig) -> Result<Vec<ConfigField>> {
        self.local()?;
        let current = self.settings.read().clone();
        let manual_changed = current.manual_peers != config.manual_peers && !self.auto_discovery;
        let mut changed: Vec<ConfigField> = ConfigField::ALL
            .into_iter()
            .filter(|field| current.field_value(*field) != config.field_value(*field))
            .filter(|field| {
                !(self.auto_discovery
                    && matches!(field, ConfigField::PeerList | ConfigField::MasterBroker))
            })
            .collect();
        if manual_changed && !changed.contains(&ConfigField::PeerList) {
            changed.push(ConfigField::PeerList);
        }

        if manual_changed {
            ConfigField::PeerList.validate(&config.manual_peers)?;
        }
        for field in &changed {
            self.validate_config_update(*field, &config.field_value(*field))?;
        }
        if current.cluster_id != config.cluster_id
            || current.max_takeover_sessions != config.max_takeover_sessions
            || current.takeover_retention_secs != config.takeover_retention_secs
        {
            tracing::warn!("cluster id and takeover limits only change on restart");
        }

        if manual_changed {
            self.settings.write().manual_peers = config.manual_peers.clone();
        }
        for field in &changed {
            self.apply_config_update(*field, &config.field_value(*field))?;
        }
        if !changed.is_empty() {
            tracing::info!(fields = ?changed, "cluster configuration reloaded");
        }
        Ok(changed)
    }

    /// Re-read the combined peer list and reconcile membership with it.
    fn peer_list_changed(&self, local: &Arc<ClusteredBroker>) {
        let combined = self.settings.read().combined_peer_list();
        let addresses = parse_broker_list(&combined);
        let local_address = local.address();
        self.member_order.lock().clone_from(&addresses);

        let mut listed = HashSet::new();
        for address in &addresses {
            if *address == local_address {
                continue;
            }
            let (broker, created) = self.find_or_insert(Candidate::configured(address.clone()));
            if !created {
                broker.set_config_defined(true);
            }
            listed.insert(broker.name().to_string());
        }
        local.set_config_defined(addresses.contains(&local_address));

        let master = self.master.read().clone();
        let mut removed = Vec::new();
        let mut demoted = 0usize;
        {
            let mut brokers = self.brokers.lock();
            brokers.retain(|name, broker| {
                let keep_as_is = broker.is_local()
                    || listed.contains(name)
                    || master.as_deref() == Some(name.as_str())
                    || !broker.is_config_defined();
                if keep_as_is {
                    return true;
                }
                broker.set_config_defined(false);
                demoted += 1;
                if broker.status().is_link_down() {
                    removed.push(Arc::clone(broker));
                    false
                } else {
                    true
                }
            });
            metrics::gauge!("felix_cluster_known_brokers").set(brokers.len() as f64);
        }
        for broker in &removed {
            self.raise_removed(broker);
        }
        tracing::info!(
            peers = addresses.len(),
            demoted,
            removed = removed.len(),
            "peer list changed"
        );
    }

    /// Pull a fresh listing from the membership source, if it has one.
    fn refresh_members(&self) -> Result<bool> {
        let Some(records) = self.source.refresh()? else {
            return Ok(false);
        };
        let local = self.local()?;
        let local_address = local.address();

        let mut listed = HashSet::new();
        for record in records {
            let is_local = record.address == local_address
                || record.name.as_deref() == Some(local.name());
            if is_local {
                continue;
            }
            let existing = record
                .name
                .as_deref()
                .and_then(|name| self.lookup(name))
                .or_else(|| self.find_by_address(&record.address));
            let broker = match existing {
                Some(broker) => {
                    broker.set_config_defined(true);
                    broker.set_address(record.address);
                    broker.set_version(record.version);
                    if record.session.is_some() && broker.session() != record.session {
                        broker.set_session(record.session);
                    }
                    broker
                }
                None => self.find_or_insert(Candidate::from_record(record)).0,
            };
            listed.insert(broker.name().to_string());
        }

        for broker in self.snapshot() {
            if broker.is_local() || listed.contains(broker.name()) || !broker.is_config_defined() {
                continue;
            }
            tracing::info!(broker = %broker.name(), "broker no longer listed in directory");
            broker.set_config_defined(false);
            if !broker.status().is_link_down() {
                broker.set_broker_link_up(false, None);
            }
        }
        Ok(true)
    }

    fn scan_and_prune(
        &self,
        keep: impl Fn(&ClusteredBroker) -> bool,
    ) -> Vec<Arc<ClusteredBroker>> {
        let mut pruned = Vec::new();
        let mut selected = Vec::new();
        {
            let mut brokers = self.brokers.lock();
            brokers.retain(|_, broker| {
                let dead = !broker.is_local()
                    && !broker.is_config_defined()
                    && broker.status().is_link_down();
                if dead {
                    pruned.push(Arc::clone(broker));
                    return false;
                }
                if keep(&**broker) {
                    selected.push(Arc::clone(broker));
                }
                true
            });
            metrics::gauge!("felix_cluster_known_brokers").set(brokers.len() as f64);
        }
        for broker in &pruned {
            tracing::debug!(broker = %broker.name(), "pruned unreachable dynamic broker");
            self.raise_removed(broker);
        }
        selected.sort_by(|a, b| a.name().cmp(b.name()));
        selected
    }

    fn resolve(&self, target: &BrokerRef) -> Option<Arc<ClusteredBroker>> {
        match target {
            BrokerRef::Name(name) => self.lookup(name),
            BrokerRef::Address(address) => self.find_by_address(address),
        }
    }

    fn resolve_or_create(&self, target: &BrokerRef) -> Result<Arc<ClusteredBroker>> {
        if let Some(broker) = self.resolve(target) {
            return Ok(broker);
        }
        match target {
            BrokerRef::Name(name) => match self.source.get(name)? {
                Some(record) => Ok(self.find_or_insert(Candidate::from_record(record)).0),
                None => Err(ClusterError::UnknownBroker(name.clone())),
            },
            BrokerRef::Address(address) if self.source.allows_dynamic_members() => {
                let (broker, _) = self.find_or_insert(Candidate {
                    config_defined: false,
                    ..Candidate::configured(address.clone())
                });
                Ok(broker)
            }
            BrokerRef::Address(address) => {
                self.refresh_members()?;
                self.find_by_address(address)
                    .ok_or_else(|| ClusterError::UnknownBroker(address.to_string()))
            }
        }
    }

    fn designate_master(&self, address: Option<BrokerAddress>) {
        let new = address.map(|address| self.find_or_insert(Candidate::configured(address)).0);
        let old_name = std::mem::replace(
            &mut *self.master.write(),
            new.as_ref().map(|broker| broker.name().to_string()),
        );
        let old = old_name.and_then(|name| self.lookup(&name));
        tracing::info!(
            old = old.as_ref().map(|b| b.name()).unwrap_or("-"),
            new = new.as_ref().map(|b| b.name()).unwrap_or("-"),
            "master broker changed"
        );
        self.pipeline
            .broker_changed(ClusterChange::MasterBrokerChanged { old, new });
    }

    fn raise_removed(&self, broker: &Arc<ClusteredBroker>) {
        self.pipeline.broker_changed(ClusterChange::Removed {
            broker: Arc::clone(broker),
            session: broker.session(),
        });
        let was_master = {
            let mut master = self.master.write();
            if master.as_deref() == Some(broker.name()) {
                *master = None;
                true
            } else {
                false
            }
        };
        if was_master {
            self.pipeline
                .broker_changed(ClusterChange::MasterBrokerChanged {
                    old: Some(Arc::clone(broker)),
                    new: None,
                });
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<ClusteredBroker>> {
        self.brokers.lock().get(name).cloned()
    }

    fn find_by_address(&self, address: &BrokerAddress) -> Option<Arc<ClusteredBroker>> {
        self.brokers
            .lock()
            .values()
            .find(|broker| broker.address() == *address)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<ClusteredBroker>> {
        let mut brokers: Vec<_> = self.brokers.lock().values().cloned().collect();
        brokers.sort_by(|a, b| a.name().cmp(b.name()));
        brokers
    }

    fn remove_entry(&self, name: &str) -> Option<Arc<ClusteredBroker>> {
        let mut brokers = self.brokers.lock();
        let removed = brokers.remove(name);
        metrics::gauge!("felix_cluster_known_brokers").set(brokers.len() as f64);
        removed
    }

    /// Return the broker at `candidate.address`, inserting it if absent and
    /// raising the add once the map lock is released.
    fn find_or_insert(&self, candidate: Candidate) -> (Arc<ClusteredBroker>, bool) {
        let (broker, created) = self.insert_if_absent(candidate);
        if created {
            self.raise_added(&broker);
        }
        (broker, created)
    }

    // Lookup and insert happen under one map lock.
    fn insert_if_absent(&self, candidate: Candidate) -> (Arc<ClusteredBroker>, bool) {
        let mut brokers = self.brokers.lock();
        if let Some(existing) = brokers
            .values()
            .find(|broker| broker.address() == candidate.address)
        {
            return (Arc::clone(existing), false);
        }
        let (name, name_generated) = match candidate.name {
            Some(name) if !brokers.contains_key(&name) => (name, false),
            other => {
                if let Some(taken) = other {
                    tracing::warn!(name = %taken, "broker name already in use; generating one");
                }
                (self.unique_name(&brokers), true)
            }
        };
        let broker = Arc::new(ClusteredBroker::new(
            NewBroker {
                name: name.clone(),
                name_generated,
                address: candidate.address,
                local: candidate.local,
                config_defined: candidate.config_defined,
                session: candidate.session,
                version: candidate.version,
            },
            Arc::clone(&self.pipeline),
        ));
        brokers.insert(name, Arc::clone(&broker));
        metrics::gauge!("felix_cluster_known_brokers").set(brokers.len() as f64);
        (broker, true)
    }

    fn raise_added(&self, broker: &Arc<ClusteredBroker>) {
        self.pipeline.broker_changed(ClusterChange::Added {
            broker: Arc::clone(broker),
            session: broker.session(),
        });
    }

    fn unique_name(&self, brokers: &BrokerMap) -> String {
        loop {
            let name = format!("broker{}", self.name_seq.fetch_add(1, Ordering::Relaxed));
            if !brokers.contains_key(&name) {
                return name;
            }
        }
    }
}

impl fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("membership", &self.source.kind())
            .field("initialized", &self.is_initialized())
            .field("brokers", &self.brokers.lock().len())
            .field("master", &*self.master.read())
            .finish()
    }
}

fn next_after(addresses: &[BrokerAddress], local: &BrokerAddress) -> Option<BrokerAddress> {
    match addresses.iter().position(|address| address == local) {
        Some(_) if addresses.len() == 1 => None,
        Some(index) => addresses.get((index + 1) % addresses.len()).cloned(),
        None => addresses.first().cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(input: &str) -> BrokerAddress {
        input.parse().expect("address")
    }

    fn registry(peers: &str) -> ClusterRegistry {
        let config = ClusterConfig {
            peers: peers.to_string(),
            ..ClusterConfig::default()
        };
        ClusterRegistry::new(config, RegistryVariant::StaticConfig)
    }

    #[test]
    fn next_after_wraps_around() {
        let list = vec![addr("a:1"), addr("b:2"), addr("c:3")];
        assert_eq!(next_after(&list, &addr("a:1")), Some(addr("b:2")));
        assert_eq!(next_after(&list, &addr("c:3")), Some(addr("a:1")));
        assert_eq!(next_after(&list, &addr("z:9")), Some(addr("a:1")));
        assert_eq!(next_after(&[addr("a:1")], &addr("a:1")), None);
        assert_eq!(next_after(&[], &addr("a:1")), None);
    }

    #[test]
    fn queries_fail_before_initialize() {
        let registry = registry("b:1001");
        assert!(matches!(
            registry.get_known_brokers(false),
            Err(ClusterError::NotInitialized)
        ));
        assert!(matches!(
            registry.get_local_broker(),
            Err(ClusterError::NotInitialized)
        ));
        assert!(matches!(
            registry.activate_broker(addr("b:1001"), None, None, None),
            Err(ClusterError::NotInitialized)
        ));
        assert!(matches!(
            registry.apply_config_update(ConfigField::Port, "1"),
            Err(ClusterError::NotInitialized)
        ));
    }

    #[test]
    fn local_broker_is_config_defined_only_when_listed() {
        let listed = registry("a:1000,b:1001");
        listed.initialize(addr("a:1000")).expect("init");
        assert!(listed.get_local_broker().expect("local").is_config_defined());

        let unlisted = registry("b:1001");
        unlisted.initialize(addr("a:1000")).expect("init");
        assert!(!unlisted.get_local_broker().expect("local").is_config_defined());
    }

    #[test]
    fn local_broker_is_activated_with_a_session() {
        let registry = registry("");
        registry.initialize(addr("a:1000")).expect("init");
        let local = registry.get_local_broker().expect("local");
        assert!(local.status().is_activated());
        assert!(local.session().is_some());
        assert_eq!(local.state(), crate::BrokerState::Operating);
        assert_eq!(registry.local_session().expect("session"), local.session());
    }

    #[test]
    fn second_initialize_moves_local_address() {
        let registry = registry("b:1001");
        let name = registry.initialize(addr("a:1000")).expect("init");
        let again = registry.set_local_address(addr("a:2000")).expect("move");
        assert_eq!(name, again);
        assert_eq!(registry.local_address().expect("address"), addr("a:2000"));
        assert_eq!(registry.known_broker_count().expect("count"), 2);
    }

    #[test]
    fn configured_broker_id_names_local() {
        let config = ClusterConfig {
            broker_id: Some("alpha".to_string()),
            ..ClusterConfig::default()
        };
        let registry = ClusterRegistry::new(config, RegistryVariant::StaticConfig);
        assert_eq!(registry.initialize(addr("a:1000")).expect("init"), "alpha");
        assert!(!registry.get_local_broker().expect("local").is_name_generated());
    }

    #[test]
    fn next_broker_follows_local() {
        let registry = registry("b:1001,a:1000,c:1002");
        registry.initialize(addr("a:1000")).expect("init");
        assert_eq!(registry.next_broker().expect("next"), Some(addr("c:1002")));
    }

    #[test]
    fn bad_master_does_not_abort_initialize() {
        let config = ClusterConfig {
            master_broker: Some("m:notaport".to_string()),
            ..ClusterConfig::default()
        };
        let registry = ClusterRegistry::new(config, RegistryVariant::StaticConfig);
        registry.initialize(addr("a:1000")).expect("init");
        assert!(registry.get_master_broker().expect("master").is_none());
    }

    #[test]
    fn master_is_added_when_unknown() {
        let config = ClusterConfig {
            peers: "b:1001".to_string(),
            master_broker: Some("m:1009".to_string()),
            ..ClusterConfig::default()
        };
        let registry = ClusterRegistry::new(config, RegistryVariant::StaticConfig);
        registry.initialize(addr("a:1000")).expect("init");
        let master = registry
            .get_master_broker()
            .expect("query")
            .expect("master");
        assert_eq!(master.address(), addr("m:1009"));
        assert!(master.is_config_defined());
        assert!(!master.is_local());
        assert_eq!(registry.known_broker_count().expect("count"), 3);
    }

    #[test]
    fn destroy_refuses_local_and_unknown() {
        let registry = registry("b:1001");
        let local = registry.initialize(addr("a:1000")).expect("init");
        assert!(matches!(
            registry.destroy_broker(&local),
            Err(ClusterError::LocalBroker(_))
        ));
        assert!(matches!(
            registry.destroy_broker("nobody"),
            Err(ClusterError::UnknownBroker(_))
        ));
    }

    #[test]
    fn unknown_name_cannot_be_activated() {
        let registry = registry("");
        registry.initialize(addr("a:1000")).expect("init");
        let err = registry
            .activate_broker("ghost", None, None, None)
            .expect_err("unknown");
        assert!(matches!(err, ClusterError::UnknownBroker(name) if name == "ghost"));
    }

    #[test]
    fn lookup_by_session_scans_members() {
        let registry = registry("");
        registry.initialize(addr("a:1000")).expect("init");
        let session = SessionId::new();
        let name = registry
            .activate_broker(addr("d:1003"), Some(session), None, None)
            .expect("activate");
        assert_eq!(
            registry.lookup_broker_session_id(session).expect("lookup"),
            Some(name)
        );
        assert_eq!(
            registry
                .lookup_broker_session_id(SessionId::new())
                .expect("lookup"),
            None
        );
    }

    #[test]
    fn property_updates_change_settings() {
        let registry = registry("");
        registry.initialize(addr("a:1000")).expect("init");
        registry
            .apply_config_update(ConfigField::PingInterval, "15")
            .expect("ping");
        registry
            .apply_config_update(ConfigField::Transport, "")
            .expect("transport");
        registry
            .apply_config_update(ConfigField::Port, "9100")
            .expect("port");
        registry
            .apply_config_update(ConfigField::Host, "cluster.local")
            .expect("host");
        assert_eq!(registry.ping_interval().expect("ping"), Duration::from_secs(15));
        assert_eq!(registry.transport().expect("transport"), "tcp");
        assert_eq!(registry.cluster_port().expect("port"), 9100);
        assert_eq!(
            registry.cluster_host().expect("host").as_deref(),
            Some("cluster.local")
        );
    }

    #[test]
    fn rejected_update_leaves_setting() {
        let registry = registry("");
        registry.initialize(addr("a:1000")).expect("init");
        let err = registry
            .apply_config_update(ConfigField::PingInterval, "0")
            .expect_err("rejected");
        assert!(matches!(err, ClusterError::ConfigRejected { .. }));
        assert_eq!(registry.ping_interval().expect("ping"), Duration::from_secs(60));
    }

    #[test]
    fn supported_sessions_include_local() {
        let registry = registry("");
        registry.initialize(addr("a:1000")).expect("init");
        let partition = StoreSessionId::new();
        registry.partition_added(partition);
        let ids = registry.supported_session_ids().expect("ids");
        assert!(ids.contains(&partition.to_string()));
        let local = registry
            .local_session()
            .expect("session")
            .expect("local session");
        assert!(ids.contains(&local.to_string()));
        registry.partition_removed(partition);
        assert!(registry.takeover().contains(partition));
    }
}
