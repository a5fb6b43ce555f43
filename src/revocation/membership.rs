use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::errors::{AbsentReason, RevocationError, RevocationResult};
use super::fetcher::{Fetched, RemoteListFetcher, ResourcePath, Verified};
use super::payload::{self, CborValue, PayloadError};
use super::store::CacheStore;
use super::types::{HashPrefix, HashVariant, Kid, KidEntry, RevocationIndex};

/// Where membership lookups read revocation data from.
#[async_trait]
pub trait ListSource: Send + Sync {
    async fn kid_entry(&self, kid: &Kid) -> RevocationResult<Option<KidEntry>>;

    async fn index(&self, kid: &Kid, variant: u8) -> RevocationResult<Option<RevocationIndex>>;

    async fn byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
    ) -> RevocationResult<Option<Vec<HashPrefix>>>;

    async fn byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> RevocationResult<Option<Vec<HashPrefix>>>;
}

/// Reads the synchronized cache store.
#[derive(Clone)]
pub struct CachedSource {
    store: Arc<dyn CacheStore>,
}

impl CachedSource {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ListSource for CachedSource {
    async fn kid_entry(&self, kid: &Kid) -> RevocationResult<Option<KidEntry>> {
        Ok(self.store.kid_entry(kid).await?)
    }

    async fn index(&self, kid: &Kid, variant: u8) -> RevocationResult<Option<RevocationIndex>> {
        Ok(self
            .store
            .index(kid, variant)
            .await?
            .map(|record| record.index))
    }

    async fn byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
    ) -> RevocationResult<Option<Vec<HashPrefix>>> {
        Ok(self
            .store
            .byte1_chunks(kid, variant, byte1)
            .await?
            .map(|record| record.chunks))
    }

    async fn byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> RevocationResult<Option<Vec<HashPrefix>>> {
        Ok(self
            .store
            .byte2_chunks(kid, variant, byte1, byte2)
            .await?
            .map(|record| record.chunks))
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    value: CborValue,
    /// Sent back as `If-Modified-Since`: the host's `Last-Modified`, or the
    /// local fetch time when the host sent none.
    validator: DateTime<Utc>,
}

/// Fetches every lookup from the remote host.
///
/// Verified responses are kept in an LRU and revalidated with
/// `If-Modified-Since` set to the host's own `Last-Modified`. While the
/// network is unavailable the last verified response is served.
#[derive(Clone)]
pub struct DirectSource {
    fetcher: Arc<RemoteListFetcher>,
    responses: Arc<Mutex<LruCache<ResourcePath, CachedResponse>>>,
}

impl DirectSource {
    pub fn new(fetcher: Arc<RemoteListFetcher>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            fetcher,
            responses: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Forget every remembered response.
    pub async fn clear(&self) {
        self.responses.lock().await.clear();
    }

    async fn resource(&self, path: ResourcePath) -> RevocationResult<Option<CborValue>> {
        let cached = self.responses.lock().await.get(&path).cloned();
        let since = cached.as_ref().map(|response| response.validator);
        let now = Utc::now();

        match self.fetcher.fetch(&path, since).await? {
            Fetched::Modified(Verified {
                value,
                last_modified,
            }) => {
                self.responses.lock().await.put(
                    path,
                    CachedResponse {
                        value: value.clone(),
                        validator: last_modified.unwrap_or(now),
                    },
                );
                Ok(Some(value))
            }
            Fetched::NotModified => Ok(cached.map(|response| response.value)),
            Fetched::Absent(AbsentReason::NetworkUnavailable) => {
                if cached.is_some() {
                    warn!("Serving last verified copy of {path} while the network is unavailable");
                }
                Ok(cached.map(|response| response.value))
            }
            Fetched::Absent(_) => Ok(None),
        }
    }

    async fn decoded<T>(
        &self,
        path: ResourcePath,
        decode: fn(&CborValue) -> Result<T, PayloadError>,
    ) -> RevocationResult<Option<T>> {
        let Some(value) = self.resource(path.clone()).await? else {
            return Ok(None);
        };
        match decode(&value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                warn!("Discarding {path}: {e}");
                self.responses.lock().await.pop(&path);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ListSource for DirectSource {
    async fn kid_entry(&self, kid: &Kid) -> RevocationResult<Option<KidEntry>> {
        let kids = self
            .decoded(ResourcePath::KidList, payload::decode_kid_list)
            .await?;
        Ok(kids.and_then(|kids| kids.into_iter().find(|entry| &entry.kid == kid)))
    }

    async fn index(&self, kid: &Kid, variant: u8) -> RevocationResult<Option<RevocationIndex>> {
        let path = ResourcePath::Index {
            kid: kid.clone(),
            variant,
        };
        self.decoded(path, payload::decode_index).await
    }

    async fn byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
    ) -> RevocationResult<Option<Vec<HashPrefix>>> {
        let path = ResourcePath::Byte1Chunk {
            kid: kid.clone(),
            variant,
            byte1,
        };
        self.decoded(path, payload::decode_chunk_list).await
    }

    async fn byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> RevocationResult<Option<Vec<HashPrefix>>> {
        let path = ResourcePath::Byte2Chunk {
            kid: kid.clone(),
            variant,
            byte1,
            byte2,
        };
        self.decoded(path, payload::decode_chunk_list).await
    }
}

/// Exact-match lookup of truncated certificate hashes in the partitioned lists.
#[derive(Clone)]
pub struct MembershipTester {
    source: Arc<dyn ListSource>,
}

impl MembershipTester {
    pub fn new(source: Arc<dyn ListSource>) -> Self {
        Self { source }
    }

    /// `candidates` maps hash variant bytes to full hashes. Unknown variants,
    /// variants the kid does not publish and hashes shorter than 16 bytes are
    /// ignored.
    ///
    /// Missing data at any level means "not revoked".
    pub async fn is_revoked(
        &self,
        kid_base64: &str,
        candidates: &BTreeMap<u8, Vec<u8>>,
    ) -> RevocationResult<bool> {
        let kid = Kid::from_base64(kid_base64)
            .map_err(|e| RevocationError::InvalidKid(format!("{kid_base64}: {e}")))?;

        let Some(entry) = self.source.kid_entry(&kid).await? else {
            debug!("Kid {kid} publishes no revocation list");
            return Ok(false);
        };

        for (variant, hash) in candidates {
            if let Err(unknown) = HashVariant::try_from(*variant) {
                debug!("Skipping unknown hash variant {unknown:02x}");
                continue;
            }
            if !entry.hash_variants.contains_key(variant) {
                continue;
            }
            let Some(prefix) = HashPrefix::truncate(hash) else {
                continue;
            };
            if self.matches(&kid, *variant, &prefix).await? {
                debug!("Kid {kid} revokes {prefix:?} via variant {variant:02x}");
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn matches(&self, kid: &Kid, variant: u8, prefix: &HashPrefix) -> RevocationResult<bool> {
        let (byte1, byte2) = (prefix.byte1(), prefix.byte2());

        let Some(index) = self.source.index(kid, variant).await? else {
            return Ok(false);
        };
        let partitioned = index
            .get(&byte1)
            .is_some_and(|entry| entry.byte2.contains_key(&byte2));
        if !partitioned {
            return Ok(false);
        }

        let byte2_hit = self
            .source
            .byte2_chunks(kid, variant, byte1, byte2)
            .await?
            .is_some_and(|chunks| chunks.contains(prefix));
        if byte2_hit {
            return Ok(true);
        }

        Ok(self
            .source
            .byte1_chunks(kid, variant, byte1)
            .await?
            .is_some_and(|chunks| chunks.contains(prefix)))
    }
}
