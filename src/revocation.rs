//! Revocation list synchronization and membership testing
//!
//! Issuers publish signed, partitioned lists of truncated certificate hashes.
//! This module keeps a local mirror of those lists up to date and answers
//! whether a certificate appears on them.
//!
//! # Features
//! - COSE_Sign1 verification of every published resource against a pinned key
//! - Conditional fetching of kid lists, indices and byte1/byte2 chunk lists
//! - Resumable four-phase sync with cascading pruning of removed partitions
//! - Exact-match lookups from the local cache or directly from the host

mod errors;
pub mod facade;
pub mod fetcher;
pub mod membership;
pub mod payload;
pub mod scheduler;
pub mod store;
pub mod sync;
mod types;
pub mod verifier;

// Re-export public types
pub use errors::{AbsentReason, RevocationError, RevocationResult};
pub use facade::{
    CertificateData, CertificateFields, RevocationService, RevocationStatus, ServiceOptions,
    candidate_hashes,
};
pub use fetcher::{
    Fetched, HttpTransport, ListTransport, RemoteListFetcher, ResourcePath, TransportError,
    TransportResponse, Verified,
};
pub use membership::{CachedSource, DirectSource, ListSource, MembershipTester};
pub use payload::CborValue;
pub use scheduler::{SyncScheduler, SyncSchedulerConfig};
pub use store::{CacheStore, MemoryStore, RedisStore, StoreError};
pub use sync::{SyncHandle, SyncOutcome, SyncReport, Synchronizer};
pub use types::{
    Byte2Entry, ChunkRecord, HASH_PREFIX_LEN, HashPrefix, HashVariant, IndexEntry, IndexRecord,
    Kid, KidEntry, RevocationIndex, SyncPhase, SyncState,
};
pub use verifier::{KeyError, SignedPayloadVerifier, VerificationError};
