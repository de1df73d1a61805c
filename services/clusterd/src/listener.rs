// Logs every cluster change the registry delivers.
use felix_cluster::{
    BrokerState, BrokerStatus, ClusterListener, ClusteredBroker, ConfigField, UserData,
};
use felix_common::BrokerAddress;
use felix_common::ids::SessionId;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct LoggingListener;

fn session_label(session: Option<SessionId>) -> String {
    session.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}

impl ClusterListener for LoggingListener {
    fn broker_added(&self, broker: &Arc<ClusteredBroker>, session: Option<SessionId>) {
        tracing::info!(
            broker = %broker.name(),
            address = %broker.address(),
            session = %session_label(session),
            "broker added"
        );
    }

    fn broker_removed(&self, broker: &Arc<ClusteredBroker>, session: Option<SessionId>) {
        tracing::info!(
            broker = %broker.name(),
            session = %session_label(session),
            "broker removed"
        );
    }

    fn broker_status_changed(
        &self,
        name: &str,
        old: BrokerStatus,
        new: BrokerStatus,
        session: Option<SessionId>,
        _user_data: Option<&UserData>,
    ) {
        tracing::info!(
            broker = name,
            %old,
            %new,
            session = %session_label(session),
            "broker status changed"
        );
    }

    fn broker_state_changed(&self, name: &str, old: BrokerState, new: BrokerState) {
        tracing::info!(broker = name, %old, %new, "broker state changed");
    }

    fn broker_version_changed(&self, name: &str, old: u32, new: u32) {
        tracing::debug!(broker = name, old, new, "broker version changed");
    }

    fn broker_address_changed(&self, name: &str, old: &BrokerAddress, new: &BrokerAddress) {
        tracing::info!(broker = name, %old, %new, "broker address changed");
    }

    fn master_broker_changed(
        &self,
        old: Option<&Arc<ClusteredBroker>>,
        new: Option<&Arc<ClusteredBroker>>,
    ) {
        tracing::info!(
            old = old.map(|b| b.name()).unwrap_or("-"),
            new = new.map(|b| b.name()).unwrap_or("-"),
            "master broker changed"
        );
    }

    fn cluster_property_changed(&self, field: ConfigField, value: &str) {
        tracing::info!(%field, value, "cluster property changed");
    }
}
