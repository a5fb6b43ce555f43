/// Liveness check. Touches neither the cache nor the list host.
pub async fn health_check() -> &'static str {
    "healthy"
}
