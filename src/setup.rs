use crate::config::Config;
use crate::revocation::{
    CacheStore, HttpTransport, MemoryStore, RedisStore, RemoteListFetcher, RevocationService,
    SignedPayloadVerifier,
};
use color_eyre::eyre::Context;
use std::sync::Arc;

/// Builds the revocation service from configuration: the cache backend, the
/// pinned verification key and the HTTP transport to the list host.
pub async fn setup(config: &Config) -> color_eyre::Result<Arc<RevocationService>> {
    let store: Arc<dyn CacheStore> = if let Some(redis_config) = &config.redis {
        tracing::info!("Redis URI provided, using Redis for the revocation cache.");
        let redis_conn = redis_config
            .start()
            .await
            .wrap_err("Failed to start Redis")?;
        Arc::new(RedisStore::new(redis_conn))
    } else {
        tracing::info!("No Redis URI, using in-memory revocation cache.");
        Arc::new(MemoryStore::new())
    };

    let revocation = &config.revocation;
    let verifier = SignedPayloadVerifier::from_pem_file(&revocation.public_key_path)
        .wrap_err_with(|| {
            format!(
                "Failed to load revocation list key from {}",
                revocation.public_key_path
            )
        })?;
    let transport = HttpTransport::new(&revocation.host, revocation.request_timeout())
        .wrap_err("Failed to build revocation list transport")?;
    tracing::info!("Fetching revocation lists from {}", transport.base_url());

    let fetcher = Arc::new(RemoteListFetcher::new(Arc::new(transport), verifier));
    let service = RevocationService::new(store, fetcher, revocation.service_options())
        .await
        .wrap_err("Failed to initialize revocation service")?;

    Ok(Arc::new(service))
}
