// Change records delivered to cluster listeners.
use crate::broker::ClusteredBroker;
use crate::config::ConfigField;
use crate::state::BrokerState;
use crate::status::BrokerStatus;
use felix_common::BrokerAddress;
use felix_common::ids::SessionId;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque value a caller attaches to a status change and gets back in the
/// listener callback.
pub type UserData = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterReason {
    Added,
    Removed,
    StatusChanged,
    StateChanged,
    VersionChanged,
    AddressChanged,
    MasterBrokerChanged,
    PropertyChanged,
}

impl ClusterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::StatusChanged => "status_changed",
            Self::StateChanged => "state_changed",
            Self::VersionChanged => "version_changed",
            Self::AddressChanged => "address_changed",
            Self::MasterBrokerChanged => "master_broker_changed",
            Self::PropertyChanged => "property_changed",
        }
    }
}

impl fmt::Display for ClusterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single membership change, carrying the operands captured when it was
/// raised. Listeners see these values, never the live entity state.
#[derive(Clone, Debug)]
pub enum ClusterChange {
    Added {
        broker: Arc<ClusteredBroker>,
        session: Option<SessionId>,
    },
    Removed {
        broker: Arc<ClusteredBroker>,
        session: Option<SessionId>,
    },
    StatusChanged {
        name: String,
        old: BrokerStatus,
        new: BrokerStatus,
        session: Option<SessionId>,
        user_data: Option<UserData>,
    },
    StateChanged {
        name: String,
        old: BrokerState,
        new: BrokerState,
    },
    VersionChanged {
        name: String,
        old: u32,
        new: u32,
    },
    AddressChanged {
        name: String,
        old: BrokerAddress,
        new: BrokerAddress,
    },
    MasterBrokerChanged {
        old: Option<Arc<ClusteredBroker>>,
        new: Option<Arc<ClusteredBroker>>,
    },
    PropertyChanged {
        field: ConfigField,
        value: String,
    },
}

impl ClusterChange {
    pub fn reason(&self) -> ClusterReason {
        match self {
            Self::Added { .. } => ClusterReason::Added,
            Self::Removed { .. } => ClusterReason::Removed,
            Self::StatusChanged { .. } => ClusterReason::StatusChanged,
            Self::StateChanged { .. } => ClusterReason::StateChanged,
            Self::VersionChanged { .. } => ClusterReason::VersionChanged,
            Self::AddressChanged { .. } => ClusterReason::AddressChanged,
            Self::MasterBrokerChanged { .. } => ClusterReason::MasterBrokerChanged,
            Self::PropertyChanged { .. } => ClusterReason::PropertyChanged,
        }
    }

    /// Name of the broker the change is about, if it concerns one broker.
    pub fn broker_name(&self) -> Option<&str> {
        match self {
            Self::Added { broker, .. } | Self::Removed { broker, .. } => Some(broker.name()),
            Self::StatusChanged { name, .. }
            | Self::StateChanged { name, .. }
            | Self::VersionChanged { name, .. }
            | Self::AddressChanged { name, .. } => Some(name),
            Self::MasterBrokerChanged { new, old } => {
                new.as_ref().or(old.as_ref()).map(|broker| broker.name())
            }
            Self::PropertyChanged { .. } => None,
        }
    }

    pub(crate) fn deliver(&self, listener: &dyn ClusterListener) {
        match self {
            Self::Added { broker, session } => listener.broker_added(broker, *session),
            Self::Removed { broker, session } => listener.broker_removed(broker, *session),
            Self::StatusChanged {
                name,
                old,
                new,
                session,
                user_data,
            } => listener.broker_status_changed(name, *old, *new, *session, user_data.as_ref()),
            Self::StateChanged { name, old, new } => {
                listener.broker_state_changed(name, *old, *new)
            }
            Self::VersionChanged { name, old, new } => {
                listener.broker_version_changed(name, *old, *new)
            }
            Self::AddressChanged { name, old, new } => {
                listener.broker_address_changed(name, old, new)
            }
            Self::MasterBrokerChanged { old, new } => {
                listener.master_broker_changed(old.as_ref(), new.as_ref())
            }
            Self::PropertyChanged { field, value } => {
                listener.cluster_property_changed(*field, value)
            }
        }
    }
}

/// Receiver of cluster membership changes.
///
/// Callbacks run on whichever thread is draining the notification queue.
/// They may call back into the registry, but must not block: a stalled
/// callback stalls delivery to every listener.
pub trait ClusterListener: Send + Sync {
    fn broker_added(&self, _broker: &Arc<ClusteredBroker>, _session: Option<SessionId>) {}

    fn broker_removed(&self, _broker: &Arc<ClusteredBroker>, _session: Option<SessionId>) {}

    fn broker_status_changed(
        &self,
        _name: &str,
        _old: BrokerStatus,
        _new: BrokerStatus,
        _session: Option<SessionId>,
        _user_data: Option<&UserData>,
    ) {
    }

    fn broker_state_changed(&self, _name: &str, _old: BrokerState, _new: BrokerState) {}

    fn broker_version_changed(&self, _name: &str, _old: u32, _new: u32) {}

    fn broker_address_changed(&self, _name: &str, _old: &BrokerAddress, _new: &BrokerAddress) {}

    fn master_broker_changed(
        &self,
        _old: Option<&Arc<ClusteredBroker>>,
        _new: Option<&Arc<ClusteredBroker>>,
    ) {
    }

    fn cluster_property_changed(&self, _field: ConfigField, _value: &str) {}
}
