use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode, Url, header};
use thiserror::Error;
use tracing::{debug, warn};

use super::errors::{AbsentReason, RevocationError, RevocationResult};
use super::payload::{self, CborValue};
use super::types::{HashPrefix, Kid, KidEntry, RevocationIndex};
use super::verifier::SignedPayloadVerifier;

/// Resources published by the revocation list host, relative to its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourcePath {
    KidList,
    Index {
        kid: Kid,
        variant: u8,
    },
    Byte1Chunk {
        kid: Kid,
        variant: u8,
        byte1: u8,
    },
    Byte2Chunk {
        kid: Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    },
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePath::KidList => f.write_str("kid.lst"),
            ResourcePath::Index { kid, variant } => write!(f, "{kid}{variant:02x}/index.lst"),
            ResourcePath::Byte1Chunk {
                kid,
                variant,
                byte1,
            } => write!(f, "{kid}{variant:02x}/{byte1:02x}/chunk.lst"),
            ResourcePath::Byte2Chunk {
                kid,
                variant,
                byte1,
                byte2,
            } => write!(f, "{kid}{variant:02x}/{byte1:02x}/{byte2:02x}/chunk.lst"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResponse {
    NotModified,
    Body {
        body: Vec<u8>,
        /// The host's `Last-Modified` stamp, when it sent a parseable one.
        last_modified: Option<DateTime<Utc>>,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connectivity trouble, timeouts or error statuses. The resource is treated as absent.
    #[error("Network unavailable: {0}")]
    Network(String),

    /// Anything that retrying cannot fix.
    #[error("Transport failure: {0}")]
    Fatal(String),
}

/// Fetches raw bytes of one published resource.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListTransport: Send + Sync {
    /// `if_modified_since` is `None` when nothing is cached for the resource.
    async fn get(
        &self,
        path: &ResourcePath,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<TransportResponse, TransportError>;
}

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a timestamp as an RFC 1123 HTTP date.
pub fn http_date(value: DateTime<Utc>) -> String {
    value.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an RFC 1123 HTTP date.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// HTTP implementation of [`ListTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(host: &str, request_timeout: Duration) -> RevocationResult<Self> {
        let mut host = host.trim().to_string();
        if !host.ends_with('/') {
            host.push('/');
        }
        let base = Url::parse(&host)
            .map_err(|e| RevocationError::Fatal(format!("Invalid revocation host {host}: {e}")))?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RevocationError::Fatal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Fatal(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl ListTransport for HttpTransport {
    async fn get(
        &self,
        path: &ResourcePath,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<TransportResponse, TransportError> {
        let url = self
            .base
            .join(&path.to_string())
            .map_err(|e| TransportError::Fatal(format!("Invalid resource path {path}: {e}")))?;

        let mut request = self.client.get(url);
        if let Some(since) = if_modified_since.filter(|s| *s > DateTime::<Utc>::UNIX_EPOCH) {
            request = request.header(header::IF_MODIFIED_SINCE, http_date(since));
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(TransportResponse::NotModified);
        }
        if !status.is_success() {
            return Err(TransportError::Network(format!(
                "HTTP error {status} while fetching {path}"
            )));
        }

        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);
        let body = response.bytes().await.map_err(classify)?;
        if body.is_empty() {
            return Ok(TransportResponse::NotModified);
        }
        Ok(TransportResponse::Body {
            body: body.to_vec(),
            last_modified,
        })
    }
}

/// Outcome of fetching one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    Modified(T),
    NotModified,
    Absent(AbsentReason),
}

/// A verified payload and the host's `Last-Modified` stamp for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub value: CborValue,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Fetches published resources and hands back verified, typed payloads.
#[derive(Clone)]
pub struct RemoteListFetcher {
    transport: Arc<dyn ListTransport>,
    verifier: SignedPayloadVerifier,
}

impl RemoteListFetcher {
    pub fn new(transport: Arc<dyn ListTransport>, verifier: SignedPayloadVerifier) -> Self {
        Self {
            transport,
            verifier,
        }
    }

    /// Fetch one resource and verify its envelope.
    pub async fn fetch(
        &self,
        path: &ResourcePath,
        since: Option<DateTime<Utc>>,
    ) -> RevocationResult<Fetched<Verified>> {
        let (envelope, last_modified) = match self.transport.get(path, since).await {
            Ok(TransportResponse::Body {
                body,
                last_modified,
            }) => (body, last_modified),
            Ok(TransportResponse::NotModified) => {
                debug!("{path} not modified");
                return Ok(Fetched::NotModified);
            }
            Err(TransportError::Network(e)) => {
                warn!("Fetching {path} failed: {e}");
                return Ok(Fetched::Absent(AbsentReason::NetworkUnavailable));
            }
            Err(TransportError::Fatal(e)) => return Err(RevocationError::Fatal(e)),
        };

        match self.verifier.verify(&envelope) {
            Ok(value) => {
                debug!("{path} downloaded and verified");
                Ok(Fetched::Modified(Verified {
                    value,
                    last_modified,
                }))
            }
            Err(e) => {
                warn!("Discarding {path}: {e}");
                Ok(Fetched::Absent(e.absent_reason()))
            }
        }
    }

    async fn fetch_typed<T>(
        &self,
        path: ResourcePath,
        since: Option<DateTime<Utc>>,
        decode: fn(&CborValue) -> Result<T, payload::PayloadError>,
    ) -> RevocationResult<Fetched<T>> {
        Ok(match self.fetch(&path, since).await? {
            Fetched::Modified(verified) => match decode(&verified.value) {
                Ok(decoded) => Fetched::Modified(decoded),
                Err(e) => {
                    warn!("Discarding {path}: {e}");
                    Fetched::Absent(AbsentReason::MalformedPayload)
                }
            },
            Fetched::NotModified => Fetched::NotModified,
            Fetched::Absent(reason) => Fetched::Absent(reason),
        })
    }

    pub async fn fetch_kid_list(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RevocationResult<Fetched<Vec<KidEntry>>> {
        self.fetch_typed(ResourcePath::KidList, since, payload::decode_kid_list)
            .await
    }

    pub async fn fetch_index(
        &self,
        kid: &Kid,
        variant: u8,
        since: Option<DateTime<Utc>>,
    ) -> RevocationResult<Fetched<RevocationIndex>> {
        let path = ResourcePath::Index {
            kid: kid.clone(),
            variant,
        };
        self.fetch_typed(path, since, payload::decode_index).await
    }

    pub async fn fetch_byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        since: Option<DateTime<Utc>>,
    ) -> RevocationResult<Fetched<Vec<HashPrefix>>> {
        let path = ResourcePath::Byte1Chunk {
            kid: kid.clone(),
            variant,
            byte1,
        };
        self.fetch_typed(path, since, payload::decode_chunk_list).await
    }

    pub async fn fetch_byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
        since: Option<DateTime<Utc>>,
    ) -> RevocationResult<Fetched<Vec<HashPrefix>>> {
        let path = ResourcePath::Byte2Chunk {
            kid: kid.clone(),
            variant,
            byte1,
            byte2,
        };
        self.fetch_typed(path, since, payload::decode_chunk_list).await
    }
}
