//! Gateway error kinds and their HTTP surface.

use thiserror::Error;

use crate::dialect::Dialect;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),

    /// Credential lacks required key material. Marks the credential disabled.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Provider signaled 429 or explicit quota exhaustion. Transient.
    #[error("Credential cooling down{}", retry_after.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    Cooldown { retry_after: Option<u64> },

    /// Non-2xx upstream response, body passed through verbatim.
    #[error("Upstream error {status}")]
    Upstream {
        status: u16,
        body: Vec<u8>,
        content_type: Option<String>,
        /// Parsed from a `Retry-After` header on 429 responses.
        retry_after: Option<u64>,
    },

    #[error("Network error: {0}")]
    Network(String),

    /// Malformed upstream payload the converter cannot parse. Fatal for the
    /// stream, surfaces as a gateway 502.
    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Client cancelled")]
    ClientCancelled,

    #[error("No eligible credential for {dialect} model '{model}'")]
    NoEligibleCredential { dialect: Dialect, model: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether the selector's retry loop may try another credential.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Cooldown { .. } | GatewayError::Network(_) => true,
            GatewayError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status the gateway surfaces for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Config(_) => 500,
            GatewayError::Unauthenticated(_) => 401,
            GatewayError::Cooldown { .. } => 429,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Network(_) => 502,
            GatewayError::Translation(_) => 502,
            GatewayError::ClientCancelled => 499,
            GatewayError::NoEligibleCredential { .. } => 503,
            GatewayError::Io(_) | GatewayError::Json(_) | GatewayError::Other(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
