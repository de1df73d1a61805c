// One member of the cluster as seen from the local broker.
use crate::error::{ClusterError, Result};
use crate::event::{ClusterChange, UserData};
use crate::notify::NotificationPipeline;
use crate::state::BrokerState;
use crate::status::BrokerStatus;
use felix_common::BrokerAddress;
use felix_common::ids::SessionId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A broker known to the registry.
///
/// Identity (`name`, local flag) is fixed at construction. Everything else is
/// guarded by a per-entity lock that is always released before a change is
/// handed to the notification pipeline.
pub struct ClusteredBroker {
    name: String,
    name_generated: bool,
    local: bool,
    pipeline: Arc<NotificationPipeline>,
    inner: Mutex<BrokerFields>,
}

#[derive(Debug, Clone)]
struct BrokerFields {
    address: BrokerAddress,
    instance_name: Option<String>,
    config_defined: bool,
    status: BrokerStatus,
    state: BrokerState,
    version: u32,
    session: Option<SessionId>,
}

pub(crate) struct NewBroker {
    pub name: String,
    pub name_generated: bool,
    pub address: BrokerAddress,
    pub local: bool,
    pub config_defined: bool,
    pub session: Option<SessionId>,
    pub version: u32,
}

impl ClusteredBroker {
    pub(crate) fn new(fields: NewBroker, pipeline: Arc<NotificationPipeline>) -> Self {
        Self {
            name: fields.name,
            name_generated: fields.name_generated,
            local: fields.local,
            pipeline,
            inner: Mutex::new(BrokerFields {
                address: fields.address,
                instance_name: None,
                config_defined: fields.config_defined,
                status: BrokerStatus::UNKNOWN,
                state: BrokerState::Initializing,
                version: fields.version,
                session: fields.session,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_name_generated(&self) -> bool {
        self.name_generated
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn address(&self) -> BrokerAddress {
        self.inner.lock().address.clone()
    }

    pub fn instance_name(&self) -> Option<String> {
        self.inner.lock().instance_name.clone()
    }

    pub fn is_config_defined(&self) -> bool {
        self.inner.lock().config_defined
    }

    pub fn status(&self) -> BrokerStatus {
        self.inner.lock().status
    }

    pub fn state(&self) -> BrokerState {
        self.inner.lock().state
    }

    pub fn version(&self) -> u32 {
        self.inner.lock().version
    }

    pub fn session(&self) -> Option<SessionId> {
        self.inner.lock().session
    }

    pub fn set_instance_name(&self, instance_name: Option<String>) {
        self.inner.lock().instance_name = instance_name;
    }

    pub fn set_session(&self, session: Option<SessionId>) {
        self.inner.lock().session = session;
    }

    pub(crate) fn set_config_defined(&self, config_defined: bool) {
        self.inner.lock().config_defined = config_defined;
    }

    /// Replace the status bits.
    ///
    /// The new value is normalized first; an unchanged value raises nothing.
    /// Otherwise a status change is raised, followed by the lifecycle state
    /// implied by the new bits (up means operating, down means shut down).
    pub fn set_status(&self, status: BrokerStatus, user_data: Option<UserData>) {
        let status = status.normalize();
        let (old, session) = {
            let mut fields = self.inner.lock();
            if fields.status == status {
                return;
            }
            let old = fields.status;
            fields.status = status;
            (old, fields.session)
        };
        self.raise_status(old, status, session, user_data);
        self.derive_state(status);
    }

    /// Report the broker process up or down from the given session.
    ///
    /// A report from a session other than the current one never touches live
    /// status: it is raised against a synthetic in-doubt prior instead.
    pub fn set_broker_is_up(&self, up: bool, session: SessionId, user_data: Option<UserData>) {
        let update = self.apply_guarded(session, BrokerStatus::BROKER_INDOUBT, |status| {
            if up {
                status.set_up()
            } else {
                status.set_down()
            }
        });
        self.raise_guarded(update, user_data);
    }

    /// Report the link to this broker up or down.
    pub fn set_broker_link_up(&self, up: bool, user_data: Option<UserData>) {
        let (old, new, session) = {
            let mut fields = self.inner.lock();
            let old = fields.status;
            let new = if up {
                old.set_up().set_link_up()
            } else {
                old.set_down().set_link_down()
            }
            .normalize();
            fields.status = new;
            (old, new, fields.session)
        };
        self.raise_status(old, new, session, user_data);
        self.derive_state(new);
    }

    /// Mark the broker in doubt (or clear the flag) on behalf of a session.
    pub fn set_broker_in_doubt(
        &self,
        in_doubt: bool,
        session: SessionId,
        user_data: Option<UserData>,
    ) {
        let update = self.apply_guarded(session, BrokerStatus::ACTIVATE_BROKER, |status| {
            if in_doubt {
                status.set_in_doubt()
            } else {
                status.set_not_in_doubt()
            }
        });
        // In-doubt changes carry no lifecycle implication.
        self.raise_status(update.old, update.new, update.session, user_data);
    }

    fn apply_guarded(
        &self,
        session: SessionId,
        foreign_prior: BrokerStatus,
        change: impl Fn(BrokerStatus) -> BrokerStatus,
    ) -> GuardedUpdate {
        let mut fields = self.inner.lock();
        let current_session = fields.session;
        match current_session {
            Some(current) if current != session => {
                drop(fields);
                metrics::counter!("felix_cluster_foreign_session_updates_total").increment(1);
                tracing::info!(
                    broker = %self.name,
                    session = %session,
                    current = %current,
                    "status update from a superseded broker session"
                );
                GuardedUpdate {
                    old: foreign_prior,
                    new: change(foreign_prior).normalize(),
                    session: Some(session),
                    foreign: true,
                }
            }
            current => {
                if current.is_none() {
                    fields.session = Some(session);
                }
                let old = fields.status;
                let new = change(old).normalize();
                fields.status = new;
                GuardedUpdate {
                    old,
                    new,
                    session: Some(session),
                    foreign: false,
                }
            }
        }
    }

    fn raise_guarded(&self, update: GuardedUpdate, user_data: Option<UserData>) {
        self.raise_status(update.old, update.new, update.session, user_data);
        if !update.foreign {
            self.derive_state(update.new);
        }
    }

    fn raise_status(
        &self,
        old: BrokerStatus,
        new: BrokerStatus,
        session: Option<SessionId>,
        user_data: Option<UserData>,
    ) {
        self.pipeline.broker_changed(ClusterChange::StatusChanged {
            name: self.name.clone(),
            old,
            new,
            session,
            user_data,
        });
    }

    fn derive_state(&self, status: BrokerStatus) {
        let target = if status.is_up() {
            BrokerState::Operating
        } else if status.is_down() {
            BrokerState::ShutdownComplete
        } else {
            return;
        };
        if let Err(err) = self.set_state(target) {
            tracing::debug!(broker = %self.name, error = %err, "derived state not applied");
        }
    }

    /// Move to a new lifecycle state, raising a state change.
    ///
    /// Setting the current state again is a no-op; moving backwards within a
    /// lifecycle is refused.
    pub fn set_state(&self, state: BrokerState) -> Result<()> {
        let old = {
            let mut fields = self.inner.lock();
            let old = fields.state;
            if old == state {
                return Ok(());
            }
            if !old.can_transition_to(state) {
                return Err(ClusterError::InvalidStateTransition {
                    broker: self.name.clone(),
                    from: old,
                    to: state,
                });
            }
            fields.state = state;
            old
        };
        self.raise_state(old, state);
        Ok(())
    }

    /// Administrative override: set any state regardless of ordering.
    pub fn force_state(&self, state: BrokerState) {
        let old = {
            let mut fields = self.inner.lock();
            std::mem::replace(&mut fields.state, state)
        };
        if old != state {
            tracing::info!(broker = %self.name, from = %old, to = %state, "broker state forced");
            self.raise_state(old, state);
        }
    }

    fn raise_state(&self, old: BrokerState, new: BrokerState) {
        self.pipeline.broker_changed(ClusterChange::StateChanged {
            name: self.name.clone(),
            old,
            new,
        });
    }

    pub fn set_version(&self, version: u32) {
        let old = std::mem::replace(&mut self.inner.lock().version, version);
        if old != version {
            self.pipeline.broker_changed(ClusterChange::VersionChanged {
                name: self.name.clone(),
                old,
                new: version,
            });
        }
    }

    pub fn set_address(&self, address: BrokerAddress) {
        let old = std::mem::replace(&mut self.inner.lock().address, address.clone());
        if old != address {
            self.pipeline.broker_changed(ClusterChange::AddressChanged {
                name: self.name.clone(),
                old,
                new: address,
            });
        }
    }

    /// Clear activation bits and the instance name, leaving link state down.
    ///
    /// Raised as one status change from the bits held before the call.
    pub(crate) fn deactivate(&self, user_data: Option<UserData>) {
        let (old, new, session) = {
            let mut fields = self.inner.lock();
            fields.instance_name = None;
            let old = fields.status;
            let new = old.set_deactivated().set_down().set_link_down().normalize();
            fields.status = new;
            (old, new, fields.session)
        };
        self.raise_status(old, new, session, user_data);
        self.derive_state(new);
    }

    pub(crate) fn activate(
        &self,
        session: Option<SessionId>,
        instance_name: Option<String>,
        user_data: Option<UserData>,
    ) {
        {
            let mut fields = self.inner.lock();
            fields.instance_name = instance_name;
            // Without an id the current session stays authoritative.
            if session.is_some() {
                fields.session = session;
            }
        }
        self.set_status(BrokerStatus::ACTIVATE_BROKER, user_data);
    }

    pub(crate) fn mark_destroyed(&self) {
        let mut fields = self.inner.lock();
        fields.status = fields.status.set_down().normalize();
    }
}

struct GuardedUpdate {
    old: BrokerStatus,
    new: BrokerStatus,
    session: Option<SessionId>,
    foreign: bool,
}

impl fmt::Display for ClusteredBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (address, status) = {
            let fields = self.inner.lock();
            (fields.address.clone(), fields.status)
        };
        let marker = if self.local { "*" } else { "" };
        write!(f, "{}{} ({})[{}]", self.name, marker, address, status)
    }
}

impl fmt::Debug for ClusteredBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.inner.lock().clone();
        f.debug_struct("ClusteredBroker")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("address", &fields.address)
            .field("config_defined", &fields.config_defined)
            .field("status", &fields.status)
            .field("state", &fields.state)
            .field("version", &fields.version)
            .field("session", &fields.session)
            .finish()
    }
}
