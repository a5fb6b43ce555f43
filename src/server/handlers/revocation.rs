use axum::{Json, extract::State};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::revocation::{CertificateData, RevocationStatus, SyncReport};
use crate::server::{AppState, errors::AppError};

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    /// Base64 key identifier
    pub kid: String,
    /// Base64 signature value (the `r` half for ECDSA)
    pub signature_value: String,
    pub certificate_id: String,
    pub issuer: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResponse {
    pub revoked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CachingRequest {
    pub enabled: bool,
}

pub async fn status(State(state): State<AppState>) -> Result<Json<RevocationStatus>, AppError> {
    Ok(Json(state.service.status().await?))
}

pub async fn sync(State(state): State<AppState>) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(state.service.sync().await?))
}

pub async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, AppError> {
    let signature_value = STANDARD
        .decode(request.signature_value.trim())
        .map_err(|e| AppError::InvalidRequest(format!("signature_value: {e}")))?;

    let cert = CertificateData {
        kid: request.kid,
        signature_value,
        certificate_id: request.certificate_id,
        issuer: request.issuer,
    };
    let revoked = state.service.is_revoked(&cert).await?;
    tracing::debug!("Revocation check for {}: {revoked}", cert.certificate_id);

    Ok(Json(CheckResponse { revoked }))
}

pub async fn set_caching(
    State(state): State<AppState>,
    Json(request): Json<CachingRequest>,
) -> Result<Json<RevocationStatus>, AppError> {
    state.service.set_caching_enabled(request.enabled).await?;
    Ok(Json(state.service.status().await?))
}
