//! Cluster membership and status propagation.
//!
//! # Purpose
//! Tracks which brokers belong to the cluster, their liveness and lifecycle,
//! and which broker (if any) is the configured master, and delivers every
//! change to registered listeners in the order it happened.
//!
//! # Notes
//! All operations are synchronous and never perform I/O. Link monitors report
//! into [`ClusteredBroker`]; routing and failover read from
//! [`ClusterRegistry`] snapshots. Listener callbacks must not block, since a
//! blocked callback holds up delivery for everyone.
pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod membership;
pub mod notify;
pub mod registry;
pub mod state;
pub mod status;
pub mod takeover;

pub use broker::ClusteredBroker;
pub use config::{ClusterConfig, ConfigField};
pub use error::{ClusterError, Result};
pub use event::{ClusterChange, ClusterListener, ClusterReason, UserData};
pub use membership::{
    DirectoryMembership, MembershipSource, PeerRecord, RegistryVariant, StaticMembership,
    parse_broker_list,
};
pub use notify::NotificationPipeline;
pub use registry::{BrokerRef, ClusterRegistry};
pub use state::BrokerState;
pub use status::BrokerStatus;
pub use takeover::TakeoverRetention;
