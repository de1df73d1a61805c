use crate::config::ConfigField;
use crate::state::BrokerState;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster registry used before initialize")]
    NotInitialized,
    #[error("unknown broker: {0}")]
    UnknownBroker(String),
    #[error("rejected {field} = '{value}': {reason}")]
    ConfigRejected {
        field: ConfigField,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    MalformedAddress(#[from] felix_common::Error),
    #[error("invalid state transition for {broker}: {from} -> {to}")]
    InvalidStateTransition {
        broker: String,
        from: BrokerState,
        to: BrokerState,
    },
    #[error("operation not permitted on the local broker {0}")]
    LocalBroker(String),
    #[error(transparent)]
    Directory(#[from] felix_metadata::MetadataError),
}

impl ClusterError {
    pub(crate) fn rejected(field: ConfigField, value: &str, reason: impl Into<String>) -> Self {
        Self::ConfigRejected {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
