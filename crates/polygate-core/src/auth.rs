//! The credential model.
//!
//! A [`Credential`] is the fundamental routable entity: one way to call one
//! provider. Credentials are synthesized from config entries and read from
//! auth-dir JSON files; they are mutated only by the selector (status and
//! cooldown updates) and replaced wholesale by the reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Well-known attribute keys.
pub mod attr {
    pub const API_KEY: &str = "api_key";
    pub const BASE_URL: &str = "base_url";
    pub const PROVIDER_TYPE: &str = "provider_type";
    pub const MODEL_NAME: &str = "model_name";
    pub const MODEL_ALIAS: &str = "model_alias";
    pub const PROXY_URL: &str = "proxy_url";
    pub const SOURCE: &str = "source";
    pub const PATH: &str = "path";
    /// Prefix for injected upstream headers: `header:<Name>`.
    pub const HEADER_PREFIX: &str = "header:";
}

/// Provider tags.
pub mod provider {
    pub const OPENAI: &str = "openai";
    pub const ANTHROPIC: &str = "anthropic";
    pub const GEMINI: &str = "gemini";
    pub const GEMINI_OAUTH: &str = "gemini-oauth";
    pub const AZURE_CLAUDE: &str = "azure-claude";
    pub const OPENAI_COMPAT_PREFIX: &str = "openai-compat:";
    pub const CROSS_PROVIDER_PREFIX: &str = "cross-provider:";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Active,
    Cooling,
    Disabled,
    Exhausted,
}

/// Shared token-refresh state for OAuth credentials.
///
/// Gemini "virtual" credentials (one per project) hold the same runtime as
/// their parent, so a refresh performed through any of them is visible to all
/// and refreshes are serialized by the mutex.
pub struct RefreshRuntime {
    pub state: tokio::sync::Mutex<TokenState>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl RefreshRuntime {
    pub fn new(state: TokenState) -> Arc<Self> {
        Arc::new(Self {
            state: tokio::sync::Mutex::new(state),
        })
    }
}

impl std::fmt::Debug for RefreshRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RefreshRuntime")
    }
}

/// One way to call one provider.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Stable across restarts for the same underlying source.
    pub id: String,
    /// Provider tag; see [`provider`].
    pub provider: String,
    pub label: String,
    pub status: AuthStatus,
    pub attributes: BTreeMap<String, String>,
    /// Opaque payload from auth files (refresh tokens, email, project ids).
    pub metadata: serde_json::Value,
    pub proxy_url: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub runtime: Option<Arc<RefreshRuntime>>,
}

impl Credential {
    pub fn new(id: String, provider: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id,
            provider: provider.into(),
            label: label.into(),
            status: AuthStatus::Active,
            attributes: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            proxy_url: None,
            cooldown_until: None,
            last_used_at: None,
            updated_at: Utc::now(),
            runtime: None,
        }
    }

    /// Deterministic id from the credential's identity material.
    pub fn stable_id(provider: &str, key_material: &str, base_url: &str, salt_index: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(key_material.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(base_url.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(salt_index.to_string().as_bytes());
        let digest = hasher.finalize();
        hex(&digest)[..16].to_string()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Declared upstream headers from `header:<Name>` attributes.
    pub fn header_attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(k, v)| {
            k.strip_prefix(attr::HEADER_PREFIX)
                .map(|name| (name, v.as_str()))
        })
    }

    pub fn is_cross_provider(&self) -> bool {
        self.provider.starts_with(provider::CROSS_PROVIDER_PREFIX)
    }

    /// Resolve the model name to send upstream for a client-requested model.
    ///
    /// Alias matching is case-insensitive and whitespace-trimmed. Multi-model
    /// credentials carry one `alias:<client-name>` attribute per mapping;
    /// single-alias cross-provider credentials carry `model_alias` +
    /// `model_name`. No match means the requested name goes through as-is.
    pub fn resolve_upstream_model(&self, requested: &str) -> String {
        let wanted = requested.trim();
        let key = format!("alias:{}", wanted.to_lowercase());
        if let Some(name) = self.attributes.get(&key) {
            return name.clone();
        }
        if let Some(alias) = self.attr(attr::MODEL_ALIAS) {
            if alias.trim().eq_ignore_ascii_case(wanted) {
                if let Some(name) = self.attr(attr::MODEL_NAME) {
                    return name.to_string();
                }
            }
        }
        wanted.to_string()
    }

    /// Whether the selector may dispatch to this credential right now.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            AuthStatus::Active => true,
            AuthStatus::Cooling => self.cooldown_until.is_none_or(|t| t <= now),
            AuthStatus::Disabled | AuthStatus::Exhausted => false,
        }
    }

    /// Content equality for reconcile diffing. Timestamp fields, runtime
    /// state, and quota recovery times never count as changes.
    pub fn content_eq(&self, other: &Credential) -> bool {
        self.id == other.id
            && self.provider == other.provider
            && self.label == other.label
            && self.attributes == other.attributes
            && self.proxy_url == other.proxy_url
            && normalize_metadata(&self.metadata) == normalize_metadata(&other.metadata)
    }
}

/// Strip fields that change on every refresh so they never produce
/// reconcile events.
pub fn normalize_metadata(value: &serde_json::Value) -> serde_json::Value {
    const VOLATILE: &[&str] = &[
        "created_at",
        "updated_at",
        "last_refreshed_at",
        "next_refresh_after",
        "runtime",
        "expired",
        "access_token",
    ];

    let mut out = value.clone();
    if let Some(map) = out.as_object_mut() {
        for key in VOLATILE {
            map.remove(*key);
        }
        if let Some(quota) = map.get_mut("quota").and_then(|q| q.as_object_mut()) {
            quota.remove("next_recover_at");
        }
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
