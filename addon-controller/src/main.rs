use addon_client::{Client, MemoryBackend};
use addon_controller::{manager, manifest, telemetry, Context, ControllerConfig, NoopInstaller};
use anyhow::Context as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::load().context("loading configuration")?;
    telemetry::init(&config.log).context("initialising logging")?;

    let client = Client::new(MemoryBackend::new());
    let seeded = manifest::load(&client, &config.manifests)
        .await
        .context("seeding manifests")?;
    info!(objects = seeded, files = config.manifests.len(), "seeded store");

    let ctx = Arc::new(Context::new(client, Arc::new(NoopInstaller), config));
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(%err, "failed to listen for ctrl-c, shutting down");
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    manager::run(ctx, shutdown).await;
    Ok(())
}
