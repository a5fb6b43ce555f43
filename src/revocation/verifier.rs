//! COSE_Sign1 envelope verification against the pinned revocation list key.

use std::path::Path;

use minicbor::Decoder;
use minicbor::Encoder;
use minicbor::data::Type;
use ring::signature::{self, UnparsedPublicKey};
use thiserror::Error;
use x509_parser::prelude::*;

use super::errors::AbsentReason;
use super::payload::{CborValue, PayloadError};

/// CBOR tag announcing a COSE_Sign1 message.
pub const COSE_SIGN1_TAG: u64 = 18;

const HEADER_ALG: i64 = 1;
const ALG_ES256: i64 = -7;
const UNCOMPRESSED_P256_LEN: usize = 65;

/// Errors raised while loading the pinned public key.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Failed to read key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid PEM encoding: {0}")]
    Pem(String),

    #[error("Unsupported PEM block: {0}")]
    UnsupportedPem(String),

    #[error("Invalid DER encoding: {0}")]
    Der(String),

    #[error("Key is not an uncompressed P-256 point")]
    NotP256,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Malformed COSE_Sign1 envelope: {0}")]
    Envelope(String),

    #[error("Unsupported signature algorithm: {0:?}")]
    UnsupportedAlgorithm(Option<i64>),

    #[error("Detached payloads are not supported")]
    DetachedPayload,

    #[error("Signature does not verify against the pinned key")]
    BadSignature,

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl VerificationError {
    pub fn absent_reason(&self) -> AbsentReason {
        match self {
            VerificationError::Payload(_) => AbsentReason::MalformedPayload,
            _ => AbsentReason::SignatureInvalid,
        }
    }
}

impl From<minicbor::decode::Error> for VerificationError {
    fn from(e: minicbor::decode::Error) -> Self {
        VerificationError::Envelope(e.to_string())
    }
}

/// Borrowed parts of a COSE_Sign1 message.
#[derive(Debug)]
struct CoseSign1<'a> {
    protected: &'a [u8],
    payload: &'a [u8],
    signature: &'a [u8],
}

fn parse_cose_sign1(input: &[u8]) -> Result<CoseSign1<'_>, VerificationError> {
    let mut dec = Decoder::new(input);

    if dec.datatype()? == Type::Tag {
        let tag = dec.tag()?;
        if tag.as_u64() != COSE_SIGN1_TAG {
            return Err(VerificationError::Envelope(format!(
                "unexpected tag {}",
                tag.as_u64()
            )));
        }
    }

    let len = dec
        .array()?
        .ok_or_else(|| VerificationError::Envelope("indefinite-length array".into()))?;
    if len != 4 {
        return Err(VerificationError::Envelope(format!(
            "expected 4 elements, found {len}"
        )));
    }

    let protected = dec.bytes()?;

    if dec.datatype()? != Type::Map {
        return Err(VerificationError::Envelope(
            "unprotected header is not a map".into(),
        ));
    }
    dec.skip()?;

    let payload = match dec.datatype()? {
        Type::Null => return Err(VerificationError::DetachedPayload),
        Type::Bytes => dec.bytes()?,
        other => {
            return Err(VerificationError::Envelope(format!(
                "payload has type {other:?}"
            )));
        }
    };

    let signature = dec.bytes()?;

    if dec.position() != input.len() {
        return Err(VerificationError::Envelope(
            "trailing bytes after COSE_Sign1".into(),
        ));
    }

    Ok(CoseSign1 {
        protected,
        payload,
        signature,
    })
}

fn protected_algorithm(protected: &[u8]) -> Option<i64> {
    if protected.is_empty() {
        return None;
    }
    CborValue::decode(protected)
        .ok()?
        .get_int_key(HEADER_ALG)?
        .as_int()
}

/// Sig_structure = ["Signature1", protected, external_aad, payload]
pub fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::with_capacity(protected.len() + payload.len() + 16);
    Encoder::new(&mut out)
        .array(4)?
        .str("Signature1")?
        .bytes(protected)?
        .bytes(&[])?
        .bytes(payload)?;
    Ok(out)
}

/// Verifies signed list envelopes against one pinned ES256 key.
#[derive(Clone)]
pub struct SignedPayloadVerifier {
    point: Vec<u8>,
}

impl std::fmt::Debug for SignedPayloadVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPayloadVerifier")
            .field("point", &hex::encode(&self.point))
            .finish()
    }
}

impl SignedPayloadVerifier {
    /// Build from a raw uncompressed SEC1 point (`04 || x || y`).
    pub fn from_sec1_point(point: &[u8]) -> Result<Self, KeyError> {
        if point.len() != UNCOMPRESSED_P256_LEN || point[0] != 0x04 {
            return Err(KeyError::NotP256);
        }
        Ok(Self {
            point: point.to_vec(),
        })
    }

    /// Build from a DER `SubjectPublicKeyInfo`.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        let (_, spki) =
            SubjectPublicKeyInfo::from_der(der).map_err(|e| KeyError::Der(e.to_string()))?;
        let point: &[u8] = &spki.subject_public_key.data;
        Self::from_sec1_point(point)
    }

    /// Build from the public key of a DER X.509 certificate.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, KeyError> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| KeyError::Der(e.to_string()))?;
        let point: &[u8] = &cert.public_key().subject_public_key.data;
        Self::from_sec1_point(point)
    }

    /// Build from a PEM `PUBLIC KEY` or `CERTIFICATE` block.
    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyError> {
        let (_, block) =
            x509_parser::pem::parse_x509_pem(pem).map_err(|e| KeyError::Pem(e.to_string()))?;
        match block.label.as_str() {
            "PUBLIC KEY" => Self::from_spki_der(&block.contents),
            "CERTIFICATE" => Self::from_certificate_der(&block.contents),
            other => Err(KeyError::UnsupportedPem(other.to_string())),
        }
    }

    /// Load a PEM key or certificate from disk.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let pem = std::fs::read(path)?;
        Self::from_pem(&pem)
    }

    /// Verify an envelope and decode its payload.
    pub fn verify(&self, envelope: &[u8]) -> Result<CborValue, VerificationError> {
        let message = parse_cose_sign1(envelope)?;

        match protected_algorithm(message.protected) {
            Some(ALG_ES256) => {}
            other => return Err(VerificationError::UnsupportedAlgorithm(other)),
        }

        let to_verify = sig_structure(message.protected, message.payload)?;
        UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, &self.point)
            .verify(&to_verify, message.signature)
            .map_err(|_| VerificationError::BadSignature)?;

        Ok(CborValue::decode(message.payload)?)
    }
}
