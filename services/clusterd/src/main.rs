// Cluster service main entry point.
use anyhow::Result;
use clusterd::app;
use clusterd::config::ClusterServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClusterServiceConfig::from_env_or_yaml()?;
    app::run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
