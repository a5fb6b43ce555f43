#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dcc_revocation::{
    config::Config,
    revocation::{
        CacheStore, CborValue, ChunkRecord, HashPrefix, IndexRecord, Kid, KidEntry, MemoryStore,
        RemoteListFetcher, ResourcePath, RevocationService, ServiceOptions,
        SignedPayloadVerifier, TransportError, TransportResponse,
        fetcher::ListTransport,
        store::{Byte1Key, Byte2Key, VariantKey},
        verifier::sig_structure,
    },
    server::{Server, ServerConfig},
    telemetry,
};
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};

/// Base64 of the kid bytes 01..08
pub const K1: &str = "AQIDBAUGBwg=";
/// 2022-03-01, well before any sync run by the tests
pub const PAST: i64 = 1_646_129_242;

pub fn k1() -> Kid {
    Kid::from_base64(K1).unwrap()
}

pub fn past() -> DateTime<Utc> {
    DateTime::from_timestamp(PAST, 0).unwrap()
}

/// An instant later than any pass started by the test.
pub fn future() -> DateTime<Utc> {
    Utc::now() + TimeDelta::hours(1)
}

pub fn prefix(hash: &[u8]) -> HashPrefix {
    HashPrefix::truncate(hash).unwrap()
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub if_modified_since: Option<DateTime<Utc>>,
}

struct Resource {
    body: Vec<u8>,
    modified_at: DateTime<Utc>,
}

type Hook = Box<dyn Fn(&str) + Send + Sync>;

/// In-memory revocation list host that signs what it serves.
///
/// Answers `NotModified` when `If-Modified-Since` is not older than the
/// resource, and a network error for unknown paths or while offline. Bodies
/// carry the resource's modification time as `Last-Modified` unless that
/// header is switched off.
pub struct FakeHost {
    key: EcdsaKeyPair,
    resources: Mutex<HashMap<String, Resource>>,
    requests: Mutex<Vec<Request>>,
    offline: AtomicBool,
    omit_last_modified: AtomicBool,
    on_request: Mutex<Option<Hook>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            key: generate_key(),
            resources: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            omit_last_modified: AtomicBool::new(false),
            on_request: Mutex::new(None),
        })
    }

    pub fn verifier(&self) -> SignedPayloadVerifier {
        SignedPayloadVerifier::from_sec1_point(self.key.public_key().as_ref()).unwrap()
    }

    pub fn fetcher(self: &Arc<Self>) -> Arc<RemoteListFetcher> {
        Arc::new(RemoteListFetcher::new(self.clone(), self.verifier()))
    }

    pub fn publish(&self, path: ResourcePath, payload: &CborValue, modified_at: DateTime<Utc>) {
        let body = sign(&self.key, payload);
        self.publish_raw(path, body, modified_at);
    }

    pub fn publish_raw(&self, path: ResourcePath, body: Vec<u8>, modified_at: DateTime<Utc>) {
        self.resources
            .lock()
            .unwrap()
            .insert(path.to_string(), Resource { body, modified_at });
    }

    /// Sign with a key nobody trusts.
    pub fn publish_forged(&self, path: ResourcePath, payload: &CborValue, modified_at: DateTime<Utc>) {
        self.publish_raw(path, sign(&generate_key(), payload), modified_at);
    }

    pub fn unpublish(&self, path: &ResourcePath) {
        self.resources.lock().unwrap().remove(&path.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn omit_last_modified(&self, omit: bool) {
        self.omit_last_modified.store(omit, Ordering::SeqCst);
    }

    pub fn on_request(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_request.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    pub fn reset_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn chunk_requests(&self) -> usize {
        self.paths()
            .iter()
            .filter(|p| p.ends_with("chunk.lst"))
            .count()
    }
}

#[async_trait]
impl ListTransport for FakeHost {
    async fn get(
        &self,
        path: &ResourcePath,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<TransportResponse, TransportError> {
        let path = path.to_string();
        self.requests.lock().unwrap().push(Request {
            path: path.clone(),
            if_modified_since,
        });
        if let Some(hook) = self.on_request.lock().unwrap().as_ref() {
            hook(&path);
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection refused".into()));
        }
        let resources = self.resources.lock().unwrap();
        let Some(resource) = resources.get(&path) else {
            return Err(TransportError::Network(format!("404 Not Found: {path}")));
        };
        if if_modified_since.is_some_and(|since| since >= resource.modified_at) {
            return Ok(TransportResponse::NotModified);
        }
        let omit = self.omit_last_modified.load(Ordering::SeqCst);
        Ok(TransportResponse::Body {
            body: resource.body.clone(),
            last_modified: (!omit).then_some(resource.modified_at),
        })
    }
}

fn generate_key() -> EcdsaKeyPair {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng).unwrap()
}

fn sign(key: &EcdsaKeyPair, payload: &CborValue) -> Vec<u8> {
    let protected = CborValue::Map(vec![(CborValue::Int(1), CborValue::Int(-7))])
        .encode()
        .unwrap();
    let payload = payload.encode().unwrap();
    let signature = key
        .sign(&SystemRandom::new(), &sig_structure(&protected, &payload).unwrap())
        .unwrap();
    CborValue::Array(vec![
        CborValue::Bytes(protected),
        CborValue::Map(vec![]),
        CborValue::Bytes(payload),
        CborValue::Bytes(signature.as_ref().to_vec()),
    ])
    .encode()
    .unwrap()
}

fn byte(b: u8) -> CborValue {
    CborValue::Bytes(vec![b])
}

/// `kid.lst` payload: kid -> { variant -> count }
pub fn kid_list(kids: &[(&Kid, &[(u8, u32)])]) -> CborValue {
    CborValue::Map(
        kids.iter()
            .map(|(kid, variants)| {
                let variants = variants
                    .iter()
                    .map(|(variant, n)| (byte(*variant), CborValue::Int(i64::from(*n))))
                    .collect();
                (CborValue::Bytes(kid.as_bytes().to_vec()), CborValue::Map(variants))
            })
            .collect(),
    )
}

/// `index.lst` payload: byte1 -> [ts, n, { byte2 -> [ts, n] }]
pub fn index(entries: &[(u8, i64, &[(u8, i64)])]) -> CborValue {
    CborValue::Map(
        entries
            .iter()
            .map(|(byte1, ts, byte2)| {
                let byte2 = byte2
                    .iter()
                    .map(|(b2, ts)| {
                        (
                            byte(*b2),
                            CborValue::Array(vec![CborValue::Int(*ts), CborValue::Int(1)]),
                        )
                    })
                    .collect();
                (
                    byte(*byte1),
                    CborValue::Array(vec![
                        CborValue::Int(*ts),
                        CborValue::Int(1),
                        CborValue::Map(byte2),
                    ]),
                )
            })
            .collect(),
    )
}

/// `chunk.lst` payload: array of 16-byte hash prefixes
pub fn chunks(prefixes: &[HashPrefix]) -> CborValue {
    CborValue::Array(
        prefixes
            .iter()
            .map(|p| CborValue::Bytes(p.as_bytes().to_vec()))
            .collect(),
    )
}

pub fn index_path(kid: &Kid, variant: u8) -> ResourcePath {
    ResourcePath::Index {
        kid: kid.clone(),
        variant,
    }
}

pub fn byte1_path(kid: &Kid, variant: u8, byte1: u8) -> ResourcePath {
    ResourcePath::Byte1Chunk {
        kid: kid.clone(),
        variant,
        byte1,
    }
}

pub fn byte2_path(kid: &Kid, variant: u8, byte1: u8, byte2: u8) -> ResourcePath {
    ResourcePath::Byte2Chunk {
        kid: kid.clone(),
        variant,
        byte1,
        byte2,
    }
}

/// Publishes `K1` with variant 0x0b and two partitions:
/// `42 -> 17` holding `other`, and the partition of `revoked` holding `revoked`
/// in both its byte1 and byte2 chunk list.
pub fn publish_k1(host: &FakeHost, revoked: &HashPrefix, other: &HashPrefix) {
    let kid = k1();
    let (b1, b2) = (revoked.byte1(), revoked.byte2());

    host.publish(ResourcePath::KidList, &kid_list(&[(&kid, &[(0x0b, 2)])]), past());
    host.publish(
        index_path(&kid, 0x0b),
        &index(&[(0x42, PAST, &[(0x17, PAST)]), (b1, PAST, &[(b2, PAST)])]),
        past(),
    );
    host.publish(byte1_path(&kid, 0x0b, 0x42), &chunks(&[*other]), past());
    host.publish(byte2_path(&kid, 0x0b, 0x42, 0x17), &chunks(&[*other]), past());
    host.publish(byte1_path(&kid, 0x0b, b1), &chunks(&[*revoked]), past());
    host.publish(byte2_path(&kid, 0x0b, b1, b2), &chunks(&[*revoked]), past());
}

pub fn options(caching_enabled: bool) -> ServiceOptions {
    ServiceOptions {
        caching_enabled,
        max_concurrent_fetches: 4,
        ..ServiceOptions::default()
    }
}

pub async fn service(
    host: &Arc<FakeHost>,
    caching_enabled: bool,
) -> (Arc<RevocationService>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let service = RevocationService::new(store.clone(), host.fetcher(), options(caching_enabled))
        .await
        .unwrap();
    (Arc::new(service), store)
}

/// Every cached row, for before/after comparisons.
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub kids: Vec<KidEntry>,
    pub indices: Vec<(VariantKey, IndexRecord)>,
    pub byte1: Vec<(Byte1Key, Option<ChunkRecord>)>,
    pub byte2: Vec<(Byte2Key, Option<ChunkRecord>)>,
}

impl Snapshot {
    pub fn references(&self, kid: &Kid) -> bool {
        self.kids.iter().any(|e| &e.kid == kid)
            || self.indices.iter().any(|((k, _), _)| k == kid)
            || self.byte1.iter().any(|((k, _, _), _)| k == kid)
            || self.byte2.iter().any(|((k, _, _, _), _)| k == kid)
    }
}

pub async fn snapshot(store: &dyn CacheStore) -> Snapshot {
    let mut byte1 = Vec::new();
    for (kid, variant, b1) in store.byte1_keys().await.unwrap() {
        let row = store.byte1_chunks(&kid, variant, b1).await.unwrap();
        byte1.push(((kid, variant, b1), row));
    }
    let mut byte2 = Vec::new();
    for (kid, variant, b1, b2) in store.byte2_keys().await.unwrap() {
        let row = store.byte2_chunks(&kid, variant, b1, b2).await.unwrap();
        byte2.push(((kid, variant, b1, b2), row));
    }
    Snapshot {
        kids: store.kid_entries().await.unwrap(),
        indices: store.indices().await.unwrap(),
        byte1,
        byte2,
    }
}

// Helper function to spawn a test server on a random port
pub async fn spawn_server(service: Arc<RevocationService>) -> String {
    telemetry::init_tracing();

    let config = {
        let mut config = Config::load_with_sources(Some(HashMap::new())).unwrap();
        config.server.host = "127.0.0.1".to_string();
        // Use a random OS port
        config.server.port = 0;
        config
    };

    let server_config = ServerConfig {
        host: &config.server.host,
        port: config.server.port,
    };

    let server = Server::new(service, server_config.clone()).await.unwrap();

    let port = server.port().unwrap();
    tokio::spawn(async move {
        server.run().await.expect("failed to run server");
    });

    format!("http://{}:{}", config.server.host, port)
}
