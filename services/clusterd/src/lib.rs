//! Cluster service library crate.
//!
//! # Purpose
//! Hosts one broker's view of the cluster: loads configuration, builds the
//! registry, logs every membership change, reloads configuration on a timer,
//! and serves metrics and health probes.
//!
//! # Notes
//! The binary is a thin wrapper over [`app::run_with_shutdown`] so tests can
//! drive the same wiring.
pub mod app;
pub mod config;
pub mod listener;
pub mod observability;
pub mod reload;
