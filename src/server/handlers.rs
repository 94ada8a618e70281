//! # Transit API Handlers
//!
//! Request handlers for the `/transit` surface:
//!
//! - `POST /transit/keys/{name}` creates a key, or extends the TTL of an
//!   existing one without regenerating material (so ciphertexts encrypted
//!   under the current material stay decryptable)
//! - `DELETE /transit/keys/{name}` revokes idempotently
//! - `POST /transit/encrypt/{name}` / `POST /transit/decrypt/{name}` run
//!   the named key over the raw request body
//!
//! The create TTL comes from the `X-Key-TTL` header or the `ttl` query
//! parameter as a duration literal, falling back to the server default.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::keys::{KeyError, TransitKey, KYBER_KEY_TYPE};
use crate::storage::{KeyStore, StorageError};

use super::responses::ApiError;

/// Header carrying the TTL override on key creation.
pub const KEY_TTL_HEADER: &str = "x-key-ttl";

const DEFAULT_KEY_SIZE: &str = "1024";

/// State shared by the transit handlers.
#[derive(Clone)]
pub struct AppState {
    /// Key storage layer
    pub storage: Arc<KeyStore>,
    /// TTL applied when a create request has no override
    pub default_key_ttl: Duration,
}

/// Query parameters accepted by the create endpoint.
#[derive(Debug, Deserialize)]
pub struct CreateKeyParams {
    /// TTL duration literal; the `X-Key-TTL` header takes precedence
    ttl: Option<String>,
    /// Key type tag, `kyber` by default
    #[serde(rename = "type")]
    key_type: Option<String>,
    /// Size tag for the chosen type
    size: Option<String>,
}

// TTL override: header first, query parameter second, default last.
fn resolve_ttl(
    headers: &HeaderMap,
    params: &CreateKeyParams,
    default: Duration,
) -> Result<Duration, ApiError> {
    let literal = headers
        .get(KEY_TTL_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| ApiError::bad_request("invalid ttl"))
        })
        .transpose()?
        .or_else(|| params.ttl.clone());

    match literal {
        Some(literal) => humantime::parse_duration(literal.trim()).map_err(|err| {
            tracing::warn!(ttl = %literal, error = %err, "invalid ttl override");
            ApiError::bad_request("invalid ttl")
        }),
        None => Ok(default),
    }
}

/// Create the named key, or extend its TTL when it already exists.
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<CreateKeyParams>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request("key name is required"));
    }

    let ttl = resolve_ttl(&headers, &params, state.default_key_ttl)?;

    match state.storage.get(&name).await {
        Ok(_) => {
            // Existing key: extend in place, never regenerate material
            state.storage.extend_ttl(&name, ttl).await.map_err(|err| {
                tracing::error!(key = %name, error = %err, "failed to extend key ttl");
                ApiError::internal("failed to extend key ttl")
            })?;
            tracing::info!(key = %name, ttl = %humantime::format_duration(ttl), "extended key ttl");
            return Ok(StatusCode::NO_CONTENT);
        }
        Err(StorageError::NotFound) => {}
        Err(err) => {
            tracing::error!(key = %name, error = %err, "failed to check key existence");
            return Err(ApiError::internal("failed to check key existence"));
        }
    }

    let key_type = params.key_type.as_deref().unwrap_or(KYBER_KEY_TYPE);
    let size = params.size.as_deref().unwrap_or(DEFAULT_KEY_SIZE);

    let key = TransitKey::new(key_type, size, &name, ttl).map_err(|err| match err {
        KeyError::UnknownKeyType(_) | KeyError::UnsupportedKeySize(_) => {
            ApiError::bad_request(err.to_string())
        }
        other => {
            tracing::error!(key = %name, error = %other, "failed to create key");
            ApiError::internal("failed to create key")
        }
    })?;

    state.storage.put(key).await.map_err(|err| {
        tracing::error!(key = %name, error = %err, "failed to store key");
        ApiError::internal("failed to store key")
    })?;

    tracing::info!(key = %name, key_type = key_type, size = size, "created key");
    Ok(StatusCode::NO_CONTENT)
}

/// Revoke the named key. Revoking an absent key succeeds.
pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request("key name is required"));
    }

    state.storage.delete(&name).await.map_err(|err| {
        tracing::error!(key = %name, error = %err, "failed to delete key");
        ApiError::internal("failed to delete key")
    })?;

    tracing::info!(key = %name, "revoked key");
    Ok(StatusCode::NO_CONTENT)
}

/// Encrypt the request body under the named key.
pub async fn encrypt(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Vec<u8>, ApiError> {
    let key = lookup_key(&state, &name).await?;

    key.encrypt(&body).map_err(|err| {
        tracing::error!(key = %name, error = %err, "encrypt failed");
        ApiError::internal("encrypt failed")
    })
}

/// Decrypt the request body under the named key.
pub async fn decrypt(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Vec<u8>, ApiError> {
    let key = lookup_key(&state, &name).await?;

    key.decrypt(&body).map_err(|err| {
        tracing::error!(key = %name, error = %err, "decrypt failed");
        ApiError::internal("decrypt failed")
    })
}

async fn lookup_key(state: &AppState, name: &str) -> Result<TransitKey, ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request("key name is required"));
    }

    state.storage.get(name).await.map_err(|err| match err {
        StorageError::NotFound => ApiError::not_found("key not found"),
        other => {
            tracing::error!(key = %name, error = %other, "failed to get key");
            ApiError::internal("failed to get key")
        }
    })
}

/// Serve the packed envelope for a name to cache peers.
pub async fn peer_get_packed(
    State(storage): State<Arc<KeyStore>>,
    Path(name): Path<String>,
) -> Result<Vec<u8>, ApiError> {
    storage
        .get_packed(&name)
        .await
        .ok_or_else(|| ApiError::not_found("key not found"))
}
