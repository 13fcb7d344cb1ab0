//! The credential store.
//!
//! Credentials come from two sources: entries synthesized from the config on
//! every reload, and `*.json` files in the auth directory. The store's
//! product is an immutable [`AuthSnapshot`]; the reconciler diffs successive
//! snapshots into `Add`/`Modify`/`Delete` events.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use polygate_core::auth::{AuthStatus, Credential, RefreshRuntime, TokenState, attr, provider};
use polygate_core::config::Config;

/// One reconcile event for a single credential id.
#[derive(Debug, Clone)]
pub enum AuthUpdate {
    Add(Credential),
    Modify(Credential),
    Delete(String),
}

impl AuthUpdate {
    pub fn id(&self) -> &str {
        match self {
            AuthUpdate::Add(c) | AuthUpdate::Modify(c) => &c.id,
            AuthUpdate::Delete(id) => id,
        }
    }
}

/// An immutable view of all credentials. Readers hold the `Arc`; the
/// reconciler builds and publishes a replacement.
#[derive(Debug, Default, Clone)]
pub struct AuthSnapshot {
    credentials: BTreeMap<String, Credential>,
}

impl AuthSnapshot {
    pub fn from_credentials(credentials: Vec<Credential>) -> Self {
        let mut map = BTreeMap::new();
        for cred in credentials {
            if map.contains_key(&cred.id) {
                warn!(id = %cred.id, label = %cred.label, "duplicate credential id, keeping first");
                continue;
            }
            map.insert(cred.id.clone(), cred);
        }
        Self { credentials: map }
    }

    pub fn get(&self, id: &str) -> Option<&Credential> {
        self.credentials.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.values()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Deterministic diff: adds and modifications in id order, then deletes
    /// in id order. Timestamp-only changes produce nothing.
    pub fn diff(prev: &AuthSnapshot, next: &AuthSnapshot) -> Vec<AuthUpdate> {
        let mut updates = Vec::new();
        for (id, cred) in &next.credentials {
            match prev.credentials.get(id) {
                None => updates.push(AuthUpdate::Add(cred.clone())),
                Some(old) if !old.content_eq(cred) => {
                    updates.push(AuthUpdate::Modify(cred.clone()));
                }
                Some(_) => {}
            }
        }
        for id in prev.credentials.keys() {
            if !next.credentials.contains_key(id) {
                updates.push(AuthUpdate::Delete(id.clone()));
            }
        }
        updates
    }
}

/// Build the full snapshot from config plus the auth directory.
pub fn build_snapshot(config: &Config, auth_dir: &Path) -> Arc<AuthSnapshot> {
    let mut credentials = synthesize_config_credentials(config);
    credentials.extend(load_auth_dir(auth_dir));
    Arc::new(AuthSnapshot::from_credentials(credentials))
}

fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "***".into();
    }
    format!("{}…{}", &key[..4], &key[key.len() - 4..])
}

fn apply_headers(cred: &mut Credential, headers: &BTreeMap<String, String>) {
    for (name, value) in headers {
        cred.set_attr(format!("{}{name}", attr::HEADER_PREFIX), value.clone());
    }
}

fn set_models_metadata(cred: &mut Credential, names: Vec<String>) {
    if !names.is_empty() {
        cred.metadata = serde_json::json!({"models": names});
    }
}

/// Synthesize one credential per configured API key (and one cross-provider
/// credential per declared alias for `codex-api-key` entries that set
/// `provider-type`).
pub fn synthesize_config_credentials(config: &Config) -> Vec<Credential> {
    let mut out = Vec::new();

    for (i, entry) in config.gemini_api_key.iter().enumerate() {
        let base = entry.base_url.clone().unwrap_or_default();
        let id = Credential::stable_id(provider::GEMINI, &entry.api_key, &base, i);
        let mut cred = Credential::new(
            id,
            provider::GEMINI,
            format!("gemini:{}", mask_key(&entry.api_key)),
        );
        cred.set_attr(attr::API_KEY, &entry.api_key);
        if let Some(url) = &entry.base_url {
            cred.set_attr(attr::BASE_URL, url);
        }
        cred.proxy_url = entry.proxy_url.clone();
        apply_headers(&mut cred, &entry.headers);
        out.push(cred);
    }

    for (i, entry) in config.claude_api_key.iter().enumerate() {
        let id = Credential::stable_id(provider::ANTHROPIC, &entry.api_key, &entry.base_url, i);
        let mut cred = Credential::new(
            id,
            provider::ANTHROPIC,
            format!("claude:{}", mask_key(&entry.api_key)),
        );
        cred.set_attr(attr::API_KEY, &entry.api_key);
        cred.set_attr(attr::BASE_URL, &entry.base_url);
        cred.proxy_url = entry.proxy_url.clone();
        apply_headers(&mut cred, &entry.headers);
        let mut names = Vec::new();
        for model in &entry.models {
            cred.set_attr(
                format!("alias:{}", model.client_name().trim().to_lowercase()),
                &model.name,
            );
            names.push(model.client_name().to_string());
            if model.alias.is_some() {
                names.push(model.name.clone());
            }
        }
        set_models_metadata(&mut cred, names);
        out.push(cred);
    }

    for (i, entry) in config.codex_api_key.iter().enumerate() {
        match entry.provider_type.as_deref() {
            Some("claude") => {
                if entry.models.is_empty() {
                    warn!(
                        base_url = %entry.base_url,
                        "codex-api-key has provider-type but no models; nothing synthesized"
                    );
                    continue;
                }
                for model in &entry.models {
                    let alias = model.client_name().to_string();
                    let tag = format!("{}claude", provider::CROSS_PROVIDER_PREFIX);
                    let id = Credential::stable_id(
                        &tag,
                        &format!("{}|{}", entry.api_key, alias),
                        &entry.base_url,
                        i,
                    );
                    let mut cred =
                        Credential::new(id, tag.clone(), format!("{}→{}", alias, model.name));
                    cred.set_attr(attr::API_KEY, &entry.api_key);
                    cred.set_attr(attr::BASE_URL, &entry.base_url);
                    cred.set_attr(attr::PROVIDER_TYPE, "claude");
                    cred.set_attr(attr::MODEL_NAME, &model.name);
                    cred.set_attr(attr::MODEL_ALIAS, &alias);
                    cred.proxy_url = entry.proxy_url.clone();
                    apply_headers(&mut cred, &entry.headers);
                    set_models_metadata(&mut cred, vec![alias]);
                    out.push(cred);
                }
            }
            Some(other) => {
                // Config validation refuses these; tolerate stale configs.
                warn!(provider_type = other, "skipping unsupported provider-type");
            }
            None => {
                let id =
                    Credential::stable_id(provider::OPENAI, &entry.api_key, &entry.base_url, i);
                let mut cred = Credential::new(
                    id,
                    provider::OPENAI,
                    format!("codex:{}", mask_key(&entry.api_key)),
                );
                cred.set_attr(attr::API_KEY, &entry.api_key);
                cred.set_attr(attr::BASE_URL, &entry.base_url);
                cred.proxy_url = entry.proxy_url.clone();
                apply_headers(&mut cred, &entry.headers);
                let mut names = Vec::new();
                for model in &entry.models {
                    cred.set_attr(
                        format!("alias:{}", model.client_name().trim().to_lowercase()),
                        &model.name,
                    );
                    names.push(model.client_name().to_string());
                    if model.alias.is_some() {
                        names.push(model.name.clone());
                    }
                }
                set_models_metadata(&mut cred, names);
                out.push(cred);
            }
        }
    }

    for compat in &config.openai_compatibility {
        let tag = format!("{}{}", provider::OPENAI_COMPAT_PREFIX, compat.name);
        let mut keys: Vec<(String, Option<String>)> = compat
            .api_keys
            .iter()
            .map(|k| (k.clone(), None))
            .collect();
        keys.extend(
            compat
                .api_key_entries
                .iter()
                .map(|e| (e.api_key.clone(), e.proxy_url.clone())),
        );
        for (i, (key, proxy)) in keys.into_iter().enumerate() {
            let id = Credential::stable_id(&tag, &key, &compat.base_url, i);
            let mut cred =
                Credential::new(id, tag.clone(), format!("{}:{}", compat.name, mask_key(&key)));
            cred.set_attr(attr::API_KEY, &key);
            cred.set_attr(attr::BASE_URL, &compat.base_url);
            cred.proxy_url = proxy;
            apply_headers(&mut cred, &compat.headers);
            let mut names = Vec::new();
            for model in &compat.models {
                cred.set_attr(
                    format!("alias:{}", model.client_name().trim().to_lowercase()),
                    &model.name,
                );
                // Both the alias and the upstream name are client-facing.
                names.push(model.client_name().to_string());
                names.push(model.name.clone());
                cred.set_attr(
                    format!("alias:{}", model.name.trim().to_lowercase()),
                    &model.name,
                );
            }
            names.dedup();
            set_models_metadata(&mut cred, names);
            out.push(cred);
        }
    }

    out
}

/// Read every `*.json` auth file. Invalid or empty files are skipped and
/// logged; they never tear down other credentials.
pub fn load_auth_dir(dir: &Path) -> Vec<Credential> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), %e, "cannot read auth dir");
            return out;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), %e, "cannot read auth file");
                continue;
            }
        };
        if content.trim().is_empty() {
            continue;
        }
        match credentials_from_auth_file(&path, &content) {
            Some(creds) => out.extend(creds),
            None => warn!(path = %path.display(), "invalid auth file, skipping"),
        }
    }

    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Parse one auth file into credentials. Gemini OAuth files with a
/// comma-separated `project_id` spawn a disabled primary plus one virtual
/// child per project; the children share the primary's refresh runtime.
pub fn credentials_from_auth_file(path: &Path, content: &str) -> Option<Vec<Credential>> {
    let json: Value = serde_json::from_str(content).ok()?;
    let file_type = json.get("type").and_then(Value::as_str)?;

    let provider_tag = match file_type {
        "gemini" | "gemini-cli" => provider::GEMINI_OAUTH,
        "claude" | "anthropic" => provider::ANTHROPIC,
        "codex" | "openai" => provider::OPENAI,
        other => other,
    };

    let path_str = path.to_string_lossy().to_string();
    let label = json
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| path_str.clone())
        });

    let id = Credential::stable_id(provider_tag, &path_str, "", 0);
    let mut primary = Credential::new(id, provider_tag, label.clone());
    primary.set_attr(attr::SOURCE, &path_str);
    primary.set_attr(attr::PATH, &path_str);
    primary.metadata = json.clone();
    primary.proxy_url = json
        .get("proxy_url")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(key) = json.get("api_key").and_then(Value::as_str) {
        primary.set_attr(attr::API_KEY, key);
    }
    if let Some(url) = json.get("base_url").and_then(Value::as_str) {
        primary.set_attr(attr::BASE_URL, url);
    }

    let runtime = RefreshRuntime::new(TokenState {
        access_token: json
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        refresh_token: json
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string),
        expiry: json
            .get("expiry")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&chrono::Utc)),
    });
    primary.runtime = Some(runtime.clone());

    let projects: Vec<String> = json
        .get("project_id")
        .and_then(Value::as_str)
        .map(|p| {
            p.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if provider_tag == provider::GEMINI_OAUTH && projects.len() > 1 {
        // Primary stays as the refresh anchor but is never routed to.
        primary.status = AuthStatus::Disabled;
        let mut out = vec![primary];
        for (i, project) in projects.iter().enumerate() {
            let child_id = Credential::stable_id(provider_tag, &path_str, project, i + 1);
            let mut child =
                Credential::new(child_id, provider_tag, format!("{label}/{project}"));
            child.set_attr(attr::SOURCE, &path_str);
            child.set_attr(attr::PATH, &path_str);
            child.set_attr("project_id", project);
            child.metadata = json.clone();
            child.proxy_url = out[0].proxy_url.clone();
            child.runtime = Some(runtime.clone());
            out.push(child);
        }
        debug!(path = %path_str, projects = projects.len(), "split gemini OAuth credential");
        Some(out)
    } else {
        if let Some(project) = projects.first() {
            primary.set_attr("project_id", project);
        }
        Some(vec![primary])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polygate_core::config::Config;

    fn sample_config() -> Config {
        serde_yaml::from_str(
            r#"
gemini-api-key:
  - api-key: "AIza-one"
claude-api-key:
  - api-key: "sk-ant-one"
    base-url: "https://api.anthropic.com"
codex-api-key:
  - api-key: "azure-one"
    base-url: "https://foundry.example.com"
    provider-type: claude
    models:
      - name: "claude-opus-4-5"
        alias: "gpt-5"
      - name: "claude-sonnet-4-5"
        alias: "gpt-5-mini"
openai-compatibility:
  - name: "openrouter"
    base-url: "https://openrouter.ai/api/v1"
    api-keys: ["or-key"]
    models:
      - name: "moonshotai/kimi-k2"
        alias: "kimi"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_synthesis_counts_and_tags() {
        let creds = synthesize_config_credentials(&sample_config());
        // 1 gemini + 1 claude + 2 cross (one per alias) + 1 compat
        assert_eq!(creds.len(), 5);

        let cross: Vec<_> = creds.iter().filter(|c| c.is_cross_provider()).collect();
        assert_eq!(cross.len(), 2);
        for c in &cross {
            assert_eq!(c.attr(attr::PROVIDER_TYPE), Some("claude"));
            assert!(c.attr(attr::MODEL_ALIAS).is_some());
            assert!(c.attr(attr::MODEL_NAME).is_some());
            assert!(c.attr(attr::API_KEY).is_some());
            assert!(c.attr(attr::BASE_URL).is_some());
        }
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let a = synthesize_config_credentials(&sample_config());
        let b = synthesize_config_credentials(&sample_config());
        let ids_a: Vec<_> = a.iter().map(|c| c.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_provider_type_without_models_synthesizes_nothing() {
        let config: Config = serde_yaml::from_str(
            r#"
codex-api-key:
  - api-key: "k"
    base-url: "https://x"
    provider-type: claude
"#,
        )
        .unwrap();
        assert!(synthesize_config_credentials(&config).is_empty());
    }

    #[test]
    fn test_auth_file_basic() {
        let path = Path::new("/auth/claude-work.json");
        let content = r#"{"type": "claude", "api_key": "sk-ant-x", "email": "ops@example.com"}"#;
        let creds = credentials_from_auth_file(path, content).unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].provider, "anthropic");
        assert_eq!(creds[0].label, "ops@example.com");
        assert_eq!(creds[0].attr(attr::SOURCE), Some("/auth/claude-work.json"));
        assert_eq!(creds[0].attr(attr::PATH), Some("/auth/claude-work.json"));
    }

    #[test]
    fn test_auth_file_invalid_json_is_none() {
        assert!(credentials_from_auth_file(Path::new("/a/b.json"), "{nope").is_none());
        assert!(credentials_from_auth_file(Path::new("/a/b.json"), r#"{"no_type": 1}"#).is_none());
    }

    #[test]
    fn test_gemini_virtual_children_share_runtime() {
        let path = Path::new("/auth/gem.json");
        let content = r#"{
            "type": "gemini",
            "email": "dev@example.com",
            "project_id": "proj-a, proj-b",
            "access_token": "at",
            "refresh_token": "rt"
        }"#;
        let creds = credentials_from_auth_file(path, content).unwrap();
        assert_eq!(creds.len(), 3);
        assert_eq!(creds[0].status, AuthStatus::Disabled);
        assert_eq!(creds[1].attr("project_id"), Some("proj-a"));
        assert_eq!(creds[2].attr("project_id"), Some("proj-b"));

        let parent_rt = creds[0].runtime.as_ref().unwrap();
        for child in &creds[1..] {
            assert!(Arc::ptr_eq(parent_rt, child.runtime.as_ref().unwrap()));
        }
        // ids are distinct
        let mut ids: Vec<_> = creds.iter().map(|c| c.id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_diff_add_modify_delete() {
        let mut a = Credential::new("a".into(), "anthropic", "a");
        a.set_attr("api_key", "k1");
        let b = Credential::new("b".into(), "gemini", "b");

        let prev = AuthSnapshot::from_credentials(vec![a.clone(), b.clone()]);

        let mut a2 = a.clone();
        a2.set_attr("api_key", "k2");
        let c = Credential::new("c".into(), "openai", "c");
        let next = AuthSnapshot::from_credentials(vec![a2, c]);

        let updates = AuthSnapshot::diff(&prev, &next);
        assert_eq!(updates.len(), 3);
        assert!(matches!(&updates[0], AuthUpdate::Modify(cred) if cred.id == "a"));
        assert!(matches!(&updates[1], AuthUpdate::Add(cred) if cred.id == "c"));
        assert!(matches!(&updates[2], AuthUpdate::Delete(id) if id == "b"));
    }

    #[test]
    fn test_diff_ignores_timestamp_only_changes() {
        let path = Path::new("/auth/gem.json");
        let c1 = credentials_from_auth_file(
            path,
            r#"{"type": "gemini", "access_token": "a", "last_refreshed_at": "t1"}"#,
        )
        .unwrap();
        let c2 = credentials_from_auth_file(
            path,
            r#"{"type": "gemini", "access_token": "b", "last_refreshed_at": "t2"}"#,
        )
        .unwrap();
        let prev = AuthSnapshot::from_credentials(c1);
        let next = AuthSnapshot::from_credentials(c2);
        assert!(AuthSnapshot::diff(&prev, &next).is_empty());
    }

    #[test]
    fn test_diff_is_idempotent() {
        let a = Credential::new("a".into(), "anthropic", "a");
        let snap = AuthSnapshot::from_credentials(vec![a]);
        assert!(AuthSnapshot::diff(&snap, &snap).is_empty());
    }

    #[test]
    fn test_load_auth_dir_skips_invalid_and_non_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), r#"{"type": "claude", "api_key": "k"}"#)
            .unwrap();
        std::fs::write(dir.path().join("bad.json"), "{broken").unwrap();
        std::fs::write(dir.path().join("empty.json"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.path().join("good.json.cookie"), "sidecar").unwrap();

        let creds = load_auth_dir(dir.path());
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].provider, "anthropic");
    }
}
