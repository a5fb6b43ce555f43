use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::errors::RevocationResult;
use super::fetcher::RemoteListFetcher;
use super::membership::{CachedSource, DirectSource, MembershipTester};
use super::store::CacheStore;
use super::sync::{SyncReport, Synchronizer};
use super::types::{HashVariant, SyncPhase, SyncState};

/// The certificate inputs the revocation hashes are derived from.
pub trait CertificateFields {
    /// Base64 key identifier of the signing key.
    fn kid(&self) -> &str;

    /// Input of the signature hash: the `r` value of an ECDSA signature,
    /// the whole signature otherwise.
    fn signature_value(&self) -> &[u8];

    /// Unique certificate identifier.
    fn certificate_id(&self) -> &str;

    /// Issuing country.
    fn issuer(&self) -> &str;
}

/// Owned [`CertificateFields`] as received from callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateData {
    pub kid: String,
    pub signature_value: Vec<u8>,
    pub certificate_id: String,
    pub issuer: String,
}

impl CertificateFields for CertificateData {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn signature_value(&self) -> &[u8] {
        &self.signature_value
    }

    fn certificate_id(&self) -> &str {
        &self.certificate_id
    }

    fn issuer(&self) -> &str {
        &self.issuer
    }
}

fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    ctx.finish().as_ref().to_vec()
}

/// Full hashes of every variant this client understands, keyed by variant byte.
pub fn candidate_hashes<C: CertificateFields + ?Sized>(cert: &C) -> BTreeMap<u8, Vec<u8>> {
    HashVariant::ALL
        .into_iter()
        .map(|variant| {
            let hash = match variant {
                HashVariant::Signature => sha256(&[cert.signature_value()]),
                HashVariant::Uci => sha256(&[cert.certificate_id().as_bytes()]),
                HashVariant::CountryUci => sha256(&[
                    cert.issuer().as_bytes(),
                    cert.certificate_id().as_bytes(),
                ]),
            };
            (variant.byte(), hash)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Used when no sync state has been persisted yet.
    pub caching_enabled: bool,
    pub update_interval: TimeDelta,
    pub max_concurrent_fetches: usize,
    pub direct_cache_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            caching_enabled: false,
            update_interval: TimeDelta::hours(24),
            max_concurrent_fetches: 8,
            direct_cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevocationStatus {
    pub caching_enabled: bool,
    pub sync_running: bool,
    pub last_sync_start: DateTime<Utc>,
    pub last_sync_finish: DateTime<Utc>,
    pub phase: SyncPhase,
    pub kids: usize,
    pub indices: usize,
    pub byte1_chunks: usize,
    pub byte2_chunks: usize,
}

/// Single entry point for revocation checks and cache maintenance.
///
/// Checks read the synchronized store while caching is enabled and go to the
/// remote host otherwise. At most one sync pass runs at a time.
pub struct RevocationService {
    store: Arc<dyn CacheStore>,
    synchronizer: Synchronizer,
    cached: MembershipTester,
    direct: MembershipTester,
    direct_source: DirectSource,
    update_interval: TimeDelta,
    default_caching: bool,
    caching_enabled: AtomicBool,
    sync_lock: Mutex<()>,
}

impl RevocationService {
    pub async fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<RemoteListFetcher>,
        options: ServiceOptions,
    ) -> RevocationResult<Self> {
        let state = match store.sync_state().await? {
            Some(state) => state,
            None => {
                let state = SyncState::new(options.caching_enabled);
                store.save_sync_state(&state).await?;
                state
            }
        };

        let synchronizer = Synchronizer::new(
            fetcher.clone(),
            store.clone(),
            options.update_interval,
            options.max_concurrent_fetches,
        );
        let direct_source = DirectSource::new(fetcher, options.direct_cache_capacity);

        Ok(Self {
            cached: MembershipTester::new(Arc::new(CachedSource::new(store.clone()))),
            direct: MembershipTester::new(Arc::new(direct_source.clone())),
            direct_source,
            synchronizer,
            store,
            update_interval: options.update_interval,
            default_caching: options.caching_enabled,
            caching_enabled: AtomicBool::new(state.caching_enabled),
            sync_lock: Mutex::new(()),
        })
    }

    async fn load_state(&self) -> RevocationResult<SyncState> {
        Ok(self
            .store
            .sync_state()
            .await?
            .unwrap_or_else(|| SyncState::new(self.default_caching)))
    }

    pub fn caching_enabled(&self) -> bool {
        self.caching_enabled.load(Ordering::SeqCst)
    }

    /// Whether any hash of `cert` is on its issuer's revocation list.
    pub async fn is_revoked<C>(&self, cert: &C) -> RevocationResult<bool>
    where
        C: CertificateFields + Sync + ?Sized,
    {
        let candidates = candidate_hashes(cert);
        let tester = if self.caching_enabled() {
            &self.cached
        } else {
            &self.direct
        };
        tester.is_revoked(cert.kid(), &candidates).await
    }

    /// Run (or resume) a sync pass, waiting for a running one to finish first.
    pub async fn sync(&self) -> RevocationResult<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let state = self.load_state().await?;
        let outcome = self.synchronizer.sync(state).await?;
        Ok(outcome.report)
    }

    /// Sync when caching is enabled and the last pass is older than the update
    /// interval or was interrupted. Returns `None` when nothing ran.
    pub async fn sync_if_due(&self) -> RevocationResult<Option<SyncReport>> {
        if !self.caching_enabled() {
            debug!("Revocation caching disabled, skipping sync");
            return Ok(None);
        }
        let Ok(_guard) = self.sync_lock.try_lock() else {
            debug!("Revocation sync already running");
            return Ok(None);
        };

        let state = self.load_state().await?;
        let due = state.is_interrupted()
            || Utc::now() - state.last_sync_finish > self.update_interval;
        if !due {
            return Ok(None);
        }

        let outcome = self.synchronizer.sync(state).await?;
        Ok(Some(outcome.report))
    }

    /// Ask a running pass to stop at the next partition boundary.
    pub fn cancel_sync(&self) {
        self.synchronizer.handle().cancel();
    }

    pub async fn set_caching_enabled(&self, enabled: bool) -> RevocationResult<()> {
        if !enabled {
            self.cancel_sync();
        }
        let _guard = self.sync_lock.lock().await;

        let mut state = self.load_state().await?;
        state.caching_enabled = enabled;
        self.store.save_sync_state(&state).await?;
        self.caching_enabled.store(enabled, Ordering::SeqCst);

        info!("Revocation caching {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Drop all cached lists and forget the last sync.
    pub async fn clear(&self) -> RevocationResult<()> {
        self.cancel_sync();
        let _guard = self.sync_lock.lock().await;

        self.store.clear().await?;
        let state = SyncState::new(self.load_state().await?.caching_enabled);
        self.store.save_sync_state(&state).await?;
        self.direct_source.clear().await;

        info!("Revocation cache cleared");
        Ok(())
    }

    pub async fn status(&self) -> RevocationResult<RevocationStatus> {
        let sync_running = self.sync_lock.try_lock().is_err();
        let state = self.load_state().await?;
        Ok(RevocationStatus {
            caching_enabled: self.caching_enabled(),
            sync_running,
            last_sync_start: state.last_sync_start,
            last_sync_finish: state.last_sync_finish,
            phase: state.phase,
            kids: self.store.kid_entries().await?.len(),
            indices: self.store.indices().await?.len(),
            byte1_chunks: self.store.byte1_keys().await?.len(),
            byte2_chunks: self.store.byte2_keys().await?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert() -> CertificateData {
        CertificateData {
            kid: "9cWXDDA52FQ=".into(),
            signature_value: hex::decode(
                "aa9ffbe3461d38427198aeaefc1f87df04c1055f28163bd734de983855c70c29",
            )
            .unwrap(),
            certificate_id: "URN:UVCI:V1:DE:MNI5SHBAVDC5JWF0WI63I5IQ68".into(),
            issuer: "DE".into(),
        }
    }

    #[test]
    fn test_candidate_hashes() {
        let hashes = candidate_hashes(&cert());
        assert_eq!(hashes.len(), 3);
        assert_eq!(
            hex::encode(&hashes[&0x0a][..16]),
            "a6b8a01b67030f32e0e3d7052a71a688"
        );
        assert_eq!(
            hex::encode(&hashes[&0x0b][..16]),
            "bc542ed65062e7034ee424bfde50a7f3"
        );
        assert!(hashes.values().all(|hash| hash.len() == 32));
    }

    #[test]
    fn test_country_hash_prefixes_issuer() {
        let hashes = candidate_hashes(&cert());
        // sha256("DE" || "URN:UVCI:V1:DE:MNI5SHBAVDC5JWF0WI63I5IQ68")
        assert_eq!(
            hex::encode(&hashes[&0x0c]),
            "452028e396896bef1eee57a4426b334188058b0f7d51849941567e51fd34b897"
        );

        let short = CertificateData {
            certificate_id: "cert-id-ABC".into(),
            ..cert()
        };
        let hashes = candidate_hashes(&short);
        assert_eq!(
            hex::encode(&hashes[&0x0c]),
            "a27c462ec32d88f411994d3537670b27e7add37fd3b260b5b24d5827f7b84e55"
        );
        // id || issuer would give sha256("cert-id-ABCDE")
        assert_ne!(
            hex::encode(&hashes[&0x0c]),
            "88406e8ee53c03d8eb5a4ce1120cac1157ee0e88904e310e1ee37d605fea45b6"
        );
    }
}
