//! Configuration loading and validation.
//!
//! The config file is YAML with kebab-case keys and is hot-reloaded by the
//! gateway's watcher. Credential-bearing sections (`gemini-api-key`,
//! `claude-api-key`, `codex-api-key`, `openai-compatibility`) are synthesized
//! into credentials on every reload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Top-level polygate configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub port: Option<u16>,

    pub auth_dir: Option<String>,

    pub debug: bool,

    pub logging_to_file: bool,

    /// Process-default outbound proxy. Per-credential `proxy-url` wins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    /// Distinct credential attempts per request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_retry: Option<u32>,

    /// Upper bound in seconds for provider-supplied Retry-After values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry_interval: Option<u64>,

    /// Client-facing API keys. Empty disables client auth.
    pub api_keys: Vec<String>,

    pub gemini_api_key: Vec<GeminiKeyConfig>,

    pub claude_api_key: Vec<ClaudeKeyConfig>,

    pub codex_api_key: Vec<CodexKeyConfig>,

    pub openai_compatibility: Vec<OpenAiCompatConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_exceeded: Option<QuotaExceededConfig>,

    /// External upstream that receives requests no credential can serve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_upstream: Option<String>,
}

/// A Gemini API key entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeminiKeyConfig {
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// An Anthropic API key entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClaudeKeyConfig {
    pub api_key: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelAliasConfig>,
}

/// An OpenAI (Codex) API key entry. When `provider-type` is set, one
/// cross-provider credential is synthesized per declared model alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CodexKeyConfig {
    pub api_key: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelAliasConfig>,
}

/// An OpenAI-compatible endpoint with one credential per API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpenAiCompatConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_key_entries: Vec<ApiKeyEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelAliasConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiKeyEntry {
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

/// Client-facing model name → upstream model name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelAliasConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ModelAliasConfig {
    /// The client-facing name: the alias when declared, else the upstream name.
    pub fn client_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuotaExceededConfig {
    pub switch_project: bool,
    pub switch_preview_model: bool,
}

pub const DEFAULT_PORT: u16 = 8317;
pub const DEFAULT_REQUEST_RETRY: u32 = 3;
pub const DEFAULT_MAX_RETRY_INTERVAL: u64 = 3600;

/// Environment variable holding an extra client-facing API key.
pub const CLIENT_KEY_ENV: &str = "POLYGATE_API_KEY";

impl Config {
    /// Load config from a YAML file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(GatewayError::Io)?;
        let config: Config =
            serde_yaml::from_str(&raw).map_err(|e| GatewayError::Config(e.to_string()))?;

        let errors = config.validate();
        if !errors.is_empty() {
            return Err(GatewayError::Config(errors.join("; ")));
        }

        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn request_retry(&self) -> u32 {
        self.request_retry.unwrap_or(DEFAULT_REQUEST_RETRY)
    }

    pub fn max_retry_interval(&self) -> u64 {
        self.max_retry_interval.unwrap_or(DEFAULT_MAX_RETRY_INTERVAL)
    }

    /// Resolve the auth directory, expanding a leading tilde.
    pub fn auth_dir_path(&self) -> PathBuf {
        let dir = self.auth_dir.as_deref().unwrap_or("~/.polygate");
        PathBuf::from(shellexpand::tilde(dir).as_ref())
    }

    /// All client-facing API keys, including the environment override.
    pub fn client_api_keys(&self) -> Vec<String> {
        let mut keys = self.api_keys.clone();
        if let Ok(env_key) = std::env::var(CLIENT_KEY_ENV) {
            if !env_key.is_empty() {
                keys.push(env_key);
            }
        }
        keys
    }

    /// Validate the config, returning hard errors. Warnings are logged.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for entry in &self.codex_api_key {
            if let Some(pt) = &entry.provider_type {
                // Only an Anthropic target is implemented; refuse the rest at
                // load time instead of synthesizing credentials that will
                // always fail.
                if pt != "claude" {
                    errors.push(format!(
                        "codex-api-key: unsupported provider-type '{pt}' (only 'claude' is supported)"
                    ));
                } else if entry.models.is_empty() {
                    tracing::warn!(
                        base_url = %entry.base_url,
                        "codex-api-key declares provider-type but no models; no cross-provider credentials will be synthesized"
                    );
                }
            }
        }

        for compat in &self.openai_compatibility {
            if compat.name.is_empty() {
                errors.push("openai-compatibility entry with empty name".into());
            }
            if compat.api_keys.is_empty() && compat.api_key_entries.is_empty() {
                tracing::warn!(name = %compat.name, "openai-compatibility entry has no API keys");
            }
        }

        if let Some(0) = self.port {
            errors.push("port must be non-zero".into());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
port: 9100
auth-dir: "/tmp/polygate-auth"
request-retry: 2
api-keys:
  - "sk-client-1"
gemini-api-key:
  - api-key: "AIza-test"
claude-api-key:
  - api-key: "sk-ant-test"
    base-url: "https://api.anthropic.com"
codex-api-key:
  - api-key: "azure-key"
    base-url: "https://foundry.example.com"
    provider-type: claude
    models:
      - name: "claude-opus-4-5"
        alias: "gpt-5"
openai-compatibility:
  - name: "openrouter"
    base-url: "https://openrouter.ai/api/v1"
    api-keys: ["or-key"]
    models:
      - name: "moonshotai/kimi-k2"
        alias: "kimi"
quota-exceeded:
  switch-project: true
  switch-preview-model: false
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.port(), 9100);
        assert_eq!(config.request_retry(), 2);
        assert_eq!(config.api_keys, vec!["sk-client-1"]);
        assert_eq!(config.gemini_api_key.len(), 1);
        assert_eq!(config.claude_api_key[0].base_url, "https://api.anthropic.com");

        let codex = &config.codex_api_key[0];
        assert_eq!(codex.provider_type.as_deref(), Some("claude"));
        assert_eq!(codex.models[0].client_name(), "gpt-5");

        let compat = &config.openai_compatibility[0];
        assert_eq!(compat.models[0].client_name(), "kimi");
        assert!(config.quota_exceeded.as_ref().unwrap().switch_project);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.request_retry(), DEFAULT_REQUEST_RETRY);
        assert!(!config.debug);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_unsupported_provider_type_is_an_error() {
        let yaml = r#"
codex-api-key:
  - api-key: "k"
    base-url: "https://x"
    provider-type: gemini
    models:
      - name: "gemini-2.5-pro"
        alias: "g"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unsupported provider-type"));
    }

    #[test]
    fn test_load_rejects_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "port: [not a port").unwrap();
        drop(f);

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_model_alias_falls_back_to_name() {
        let m = ModelAliasConfig {
            name: "claude-sonnet-4-5".into(),
            alias: None,
        };
        assert_eq!(m.client_name(), "claude-sonnet-4-5");
    }
}
