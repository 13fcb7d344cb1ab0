//! The model registry: client-facing model name → serving credential ids.
//!
//! Rebuilt by the reconciler from each snapshot and swapped atomically.
//! Lookups are case-sensitive on the declared names, with Gemini "thinking"
//! suffix stripping as the one canonicalization.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use polygate_core::auth::{Credential, attr, provider};

use crate::store::AuthSnapshot;

/// Published model catalogues for credentials that do not declare a list.
const ANTHROPIC_MODELS: &[&str] = &[
    "claude-opus-4-5",
    "claude-sonnet-4-5",
    "claude-haiku-4-5",
    "claude-opus-4-1",
    "claude-sonnet-4-0",
];

const OPENAI_MODELS: &[&str] = &["gpt-5", "gpt-5-mini", "gpt-5-codex", "gpt-4o", "gpt-4o-mini"];

const GEMINI_MODELS: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.0-flash",
];

#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, BTreeSet<String>>,
}

impl ModelRegistry {
    /// Derive every credential's client-model set and index it.
    pub fn build(snapshot: &AuthSnapshot) -> Self {
        let mut models: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for cred in snapshot.iter() {
            for name in credential_models(cred) {
                models.entry(name).or_default().insert(cred.id.clone());
            }
        }
        Self { models }
    }

    /// Credential ids serving `model`, in id order. Unknown models yield an
    /// empty set.
    pub fn lookup(&self, model: &str) -> Vec<String> {
        if let Some(ids) = self.models.get(model) {
            return ids.iter().cloned().collect();
        }
        // Gemini "thinking" variants route to the base model.
        if let Some(base) = model.strip_suffix("-thinking") {
            if let Some(ids) = self.models.get(base) {
                return ids.iter().cloned().collect();
            }
        }
        Vec::new()
    }

    pub fn contains(&self, model: &str) -> bool {
        !self.lookup(model).is_empty()
    }

    /// All client-facing model names, sorted.
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }
}

/// Client-model names one credential serves.
fn credential_models(cred: &Credential) -> Vec<String> {
    // Cross-provider credentials serve exactly their alias.
    if cred.is_cross_provider() {
        return cred
            .attr(attr::MODEL_ALIAS)
            .map(|a| vec![a.to_string()])
            .unwrap_or_default();
    }

    // Declared model list wins.
    if let Some(declared) = cred
        .metadata
        .get("models")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
    {
        return declared
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }

    // Fall back to the provider's published catalogue.
    let catalogue: &[&str] = if cred.provider == provider::ANTHROPIC
        || cred.provider == provider::AZURE_CLAUDE
    {
        ANTHROPIC_MODELS
    } else if cred.provider == provider::GEMINI || cred.provider == provider::GEMINI_OAUTH {
        GEMINI_MODELS
    } else if cred.provider == provider::OPENAI {
        OPENAI_MODELS
    } else {
        // openai-compat credentials without a declared list serve nothing.
        &[]
    };
    catalogue.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(creds: Vec<Credential>) -> AuthSnapshot {
        AuthSnapshot::from_credentials(creds)
    }

    #[test]
    fn test_catalogue_fallback() {
        let cred = Credential::new("a1".into(), "anthropic", "a");
        let registry = ModelRegistry::build(&snapshot(vec![cred]));
        assert_eq!(registry.lookup("claude-opus-4-5"), vec!["a1".to_string()]);
        assert!(registry.lookup("gpt-5").is_empty());
    }

    #[test]
    fn test_declared_models_win() {
        let mut cred = Credential::new("c1".into(), "openai-compat:router", "r");
        cred.metadata = json!({"models": ["kimi", "moonshotai/kimi-k2"]});
        let registry = ModelRegistry::build(&snapshot(vec![cred]));
        assert!(registry.contains("kimi"));
        assert!(registry.contains("moonshotai/kimi-k2"));
        assert!(!registry.contains("gpt-4o"));
    }

    #[test]
    fn test_cross_provider_serves_exactly_its_alias() {
        let mut cred = Credential::new("x1".into(), "cross-provider:claude", "x");
        cred.set_attr("model_alias", "gpt-5");
        cred.set_attr("model_name", "claude-opus-4-5");
        let registry = ModelRegistry::build(&snapshot(vec![cred]));
        assert_eq!(registry.lookup("gpt-5"), vec!["x1".to_string()]);
        assert!(!registry.contains("claude-opus-4-5"));
    }

    #[test]
    fn test_many_to_many() {
        let a = Credential::new("a".into(), "anthropic", "a");
        let b = Credential::new("b".into(), "anthropic", "b");
        let registry = ModelRegistry::build(&snapshot(vec![a, b]));
        assert_eq!(
            registry.lookup("claude-sonnet-4-5"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_thinking_suffix_strips_to_base() {
        let cred = Credential::new("g1".into(), "gemini", "g");
        let registry = ModelRegistry::build(&snapshot(vec![cred]));
        assert_eq!(
            registry.lookup("gemini-2.5-flash-thinking"),
            vec!["g1".to_string()]
        );
    }
}
