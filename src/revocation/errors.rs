use std::fmt;

use thiserror::Error;

use super::store::StoreError;
use super::verifier::KeyError;

/// Revocation-related errors
///
/// Only failures the caller has to act on end up here. Unusable responses
/// (bad signature, network trouble, malformed payload) are reported as
/// [`AbsentReason`] inside a fetch result instead.
#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("Revocation cache unavailable: {0}")]
    Storage(#[from] StoreError),

    #[error("Pinned revocation list key is unusable: {0}")]
    Key(#[from] KeyError),

    #[error("Kid is not valid base64: {0}")]
    InvalidKid(String),

    #[error("Unexpected failure while fetching revocation data: {0}")]
    Fatal(String),
}

/// Convenient Result type alias
pub type RevocationResult<T> = Result<T, RevocationError>;

/// Why a fetched resource could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentReason {
    SignatureInvalid,
    NetworkUnavailable,
    MalformedPayload,
}

impl fmt::Display for AbsentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AbsentReason::SignatureInvalid => "signature invalid",
            AbsentReason::NetworkUnavailable => "network unavailable",
            AbsentReason::MalformedPayload => "malformed payload",
        };
        f.write_str(reason)
    }
}
