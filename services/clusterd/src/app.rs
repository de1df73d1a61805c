// Service wiring: registry construction and the run loop.
use crate::config::{ClusterServiceConfig, MembershipMode};
use crate::listener::LoggingListener;
use crate::{observability, reload};
use anyhow::{Context, Result};
use felix_cluster::{ClusterRegistry, RegistryVariant};
use felix_metadata::InMemoryBrokerDirectory;
use std::future::Future;
use std::sync::Arc;

pub struct ClusterService {
    pub registry: Arc<ClusterRegistry>,
    // Present in directory mode only.
    pub directory: Option<Arc<InMemoryBrokerDirectory>>,
}

/// Build and initialize the registry described by `config`.
pub fn build_service(config: &ClusterServiceConfig) -> Result<ClusterService> {
    let (variant, directory) = match config.membership {
        MembershipMode::Static => (RegistryVariant::StaticConfig, None),
        MembershipMode::Directory => {
            let directory = Arc::new(InMemoryBrokerDirectory::new());
            reload::sync_directory(&directory, &config.directory)
                .context("seed broker directory")?;
            (
                RegistryVariant::AutoDiscovery(directory.clone()),
                Some(directory),
            )
        }
    };
    let registry = Arc::new(ClusterRegistry::new(config.cluster.clone(), variant));
    registry.add_listener(Arc::new(LoggingListener));
    let local = registry
        .initialize(config.local_address.clone())
        .context("initialize cluster registry")?;
    tracing::info!(
        broker = %local,
        address = %config.local_address,
        membership = ?config.membership,
        "cluster service started"
    );
    Ok(ClusterService {
        registry,
        directory,
    })
}

pub async fn run_with_shutdown<F>(config: ClusterServiceConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("felix-clusterd")?;
    let service = build_service(&config)?;

    let http_listener = tokio::net::TcpListener::bind(config.metrics_bind)
        .await
        .with_context(|| format!("bind metrics listener {}", config.metrics_bind))?;
    tracing::info!(addr = %http_listener.local_addr()?, "metrics listener started");
    let http_task = tokio::spawn(observability::serve_http_with_listener(
        metrics_handle,
        Arc::clone(&service.registry),
        http_listener,
        std::future::pending(),
    ));

    let reload_task = tokio::spawn(reload::start_reload(
        Arc::clone(&service.registry),
        service.directory.clone(),
        config.reload_interval(),
        ClusterServiceConfig::from_env_or_yaml,
    ));

    shutdown.await;
    tracing::info!("cluster service shutting down");
    http_task.abort();
    reload_task.abort();
    let _ = http_task.await;
    let _ = reload_task.await;
    Ok(())
}
