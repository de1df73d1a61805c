// Periodic configuration reload.
//
// Each tick re-reads the service configuration, brings the broker directory
// in line with it (directory mode), and hands the cluster settings to the
// registry, which applies only the fields that changed.
use crate::config::ClusterServiceConfig;
use anyhow::{Context, Result};
use felix_cluster::{ClusterRegistry, ConfigField};
use felix_metadata::{BrokerDirectory, BrokerRecord, InMemoryBrokerDirectory};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Make `directory` hold exactly `records`. Returns (written, deleted).
pub fn sync_directory(
    directory: &InMemoryBrokerDirectory,
    records: &[BrokerRecord],
) -> Result<(usize, usize)> {
    let wanted: HashSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
    let mut deleted = 0;
    for existing in directory.list()? {
        if !wanted.contains(existing.name.as_str()) && directory.delete(&existing.name).is_some()
        {
            deleted += 1;
        }
    }
    let mut written = 0;
    for record in records {
        if directory.get(&record.name)?.as_ref() == Some(record) {
            continue;
        }
        directory
            .put(record.clone())
            .with_context(|| format!("publish directory entry {}", record.name))?;
        written += 1;
    }
    Ok((written, deleted))
}

pub fn reload_once(
    registry: &ClusterRegistry,
    directory: Option<&InMemoryBrokerDirectory>,
    config: &ClusterServiceConfig,
) -> Result<Vec<ConfigField>> {
    if let Some(directory) = directory {
        let (written, deleted) = sync_directory(directory, &config.directory)?;
        if written + deleted > 0 {
            tracing::info!(written, deleted, "broker directory updated");
            registry
                .get_known_brokers(true)
                .context("refresh cluster membership")?;
        }
    }
    let changed = registry
        .reload_config(&config.cluster)
        .context("apply cluster configuration")?;
    Ok(changed)
}

pub async fn start_reload<L>(
    registry: Arc<ClusterRegistry>,
    directory: Option<Arc<InMemoryBrokerDirectory>>,
    interval: Duration,
    load: L,
) where
    L: Fn() -> Result<ClusterServiceConfig> + Send + 'static,
{
    loop {
        tokio::time::sleep(interval).await;
        let config = match load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "cluster config reload failed");
                continue;
            }
        };
        match reload_once(&registry, directory.as_deref(), &config) {
            Ok(changed) if !changed.is_empty() => {
                metrics::counter!("felix_cluster_config_reloads_total").increment(1);
                tracing::debug!(fields = ?changed, "cluster config reloaded");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "cluster config rejected; keeping current settings");
            }
        }
    }
}
