use dcc_revocation::{
    config::Config,
    revocation::SyncScheduler,
    server::{Server, ServerConfig},
    setup::setup,
    telemetry,
};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        "Loaded configuration: server={:?} revocation={:?} redis={}",
        config.server,
        config.revocation,
        config.redis.is_some()
    );

    let service = setup(&config).await?;

    let scheduler = SyncScheduler::new(config.revocation.scheduler_config(), service.clone());
    if let Err(e) = scheduler.trigger_immediate_update().await {
        tracing::warn!("Initial revocation sync failed: {e}");
    }
    let _scheduler = scheduler.start();

    let server_config = ServerConfig {
        host: &config.server.host,
        port: config.server.port,
    };

    let server = Server::new(service, server_config).await?;
    server.run().await
}
