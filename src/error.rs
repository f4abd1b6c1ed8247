//! Error types for rustpub
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Federation failures keep enough structure (status codes, URIs) for the
/// delivery queue to decide between retrying and dead-lettering a job.
#[derive(Debug, Error)]
pub enum AppError {
    /// Inbound signature could not be verified (401)
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// The signing key's owner could not be resolved (401)
    #[error("Key lookup failed for {key_id}: {reason}")]
    KeyLookup { key_id: String, reason: String },

    /// Private key absent or malformed (500)
    #[error("Signing error: {0}")]
    Signing(String),

    /// Network or decoding failure while fetching a remote object (502)
    #[error("Remote fetch failed for {uri}: {reason}")]
    RemoteFetch { uri: String, reason: String },

    /// Remote actor document lacks required fields (502)
    #[error("Malformed actor {uri}: {reason}")]
    MalformedActor { uri: String, reason: String },

    /// Remote status document lacks required fields (502)
    #[error("Malformed status {uri}: {reason}")]
    MalformedStatus { uri: String, reason: String },

    /// Inbound activity body is not a JSON object (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// (name, domain) already belongs to an actor with a different URI (409)
    #[error("Actor {name}@{domain} already exists with a different URI than {uri}")]
    ActorConflict {
        uri: String,
        name: String,
        domain: String,
    },

    /// Delivery target does not declare an inbox (422)
    #[error("No inbox found for {0}")]
    NoInbox(String),

    /// Outbound request failed; `status` is absent for network failures (502)
    #[error("Delivery to {uri} failed{}: {reason}", status_suffix(.status))]
    Delivery {
        uri: String,
        status: Option<u16>,
        reason: String,
    },

    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Outbound destination refused (403)
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Operation cancelled before completion (503)
    #[error("Operation cancelled")]
    Cancelled,

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error (500)
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" with status {code}"))
        .unwrap_or_default()
}

impl AppError {
    /// Whether a failed delivery is worth another attempt.
    ///
    /// Network errors, timeouts, 408, 429 and 5xx are transient. Everything
    /// else (other 4xx, signing failures, refused destinations) is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Delivery { status: None, .. } => true,
            AppError::Delivery {
                status: Some(code), ..
            } => *code == 408 || *code == 429 || (500..=599).contains(code),
            AppError::RemoteFetch { .. } => true,
            _ => false,
        }
    }

    /// Storage and internal failures on this server.
    ///
    /// These never describe the remote peer, so callers that tolerate remote
    /// failures still have to propagate them.
    pub fn is_local_failure(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Migration(_) | AppError::Internal(_)
        )
    }

    /// Short label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::SignatureInvalid(_) => "signature_invalid",
            AppError::KeyLookup { .. } => "key_lookup",
            AppError::Signing(_) => "signing",
            AppError::RemoteFetch { .. } => "remote_fetch",
            AppError::MalformedActor { .. } => "malformed_actor",
            AppError::MalformedStatus { .. } => "malformed_status",
            AppError::MalformedActivity(_) => "malformed_activity",
            AppError::ActorConflict { .. } => "actor_conflict",
            AppError::NoInbox(_) => "no_inbox",
            AppError::Delivery { .. } => "delivery",
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Forbidden(_) => "forbidden",
            AppError::Cancelled => "cancelled",
            AppError::Database(_) => "database",
            AppError::Migration(_) => "migration",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SignatureInvalid(_) | AppError::KeyLookup { .. } => StatusCode::UNAUTHORIZED,
            AppError::MalformedActivity(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::ActorConflict { .. } => StatusCode::CONFLICT,
            AppError::NoInbox(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RemoteFetch { .. }
            | AppError::MalformedActor { .. }
            | AppError::MalformedStatus { .. }
            | AppError::Delivery { .. } => StatusCode::BAD_GATEWAY,
            AppError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Signing(_)
            | AppError::Database(_)
            | AppError::Migration(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Storage and internal failures are logged but never echoed to the
    /// client.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status_code();
        let error_message = match &self {
            AppError::Database(_) | AppError::Migration(_) => "Database error".to_string(),
            AppError::Internal(_) | AppError::Signing(_) | AppError::Config(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
