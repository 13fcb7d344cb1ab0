//! Hot reload: filesystem watcher + reconciler.
//!
//! The watcher observes the config file and the auth directory and nudges
//! the reconciler, which rescans both sources, hashes contents to skip
//! no-op reloads, builds a fresh snapshot, and publishes it together with a
//! rebuilt model registry. Diffing end states (rather than replaying raw
//! file events) makes remove-then-create sequences collapse into a single
//! `Modify` and coalesces multiple writes per debounce window into at most
//! one net event per credential id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use polygate_core::config::Config;

use crate::manager::CredentialManager;
use crate::registry::ModelRegistry;
use crate::store::{AuthSnapshot, AuthUpdate, build_snapshot};

/// Writes are debounced this long before a reload runs; an auth-file remove
/// followed by a create lands in the same window and reconciles as one
/// replace.
const DEBOUNCE: Duration = Duration::from_millis(150);

pub struct Reconciler {
    config_path: PathBuf,
    auth_dir: PathBuf,
    config: Arc<RwLock<Arc<Config>>>,
    manager: Arc<CredentialManager>,
    hashes: Mutex<HashMap<PathBuf, [u8; 32]>>,
}

impl Reconciler {
    pub fn new(
        config_path: PathBuf,
        auth_dir: PathBuf,
        config: Arc<RwLock<Arc<Config>>>,
        manager: Arc<CredentialManager>,
    ) -> Self {
        Self {
            config_path,
            auth_dir,
            config,
            manager,
            hashes: Mutex::new(HashMap::new()),
        }
    }

    fn hash_sources(&self) -> HashMap<PathBuf, [u8; 32]> {
        let mut hashes = HashMap::new();
        if let Ok(content) = std::fs::read(&self.config_path) {
            hashes.insert(self.config_path.clone(), Sha256::digest(&content).into());
        }
        if let Ok(entries) = std::fs::read_dir(&self.auth_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(content) = std::fs::read(&path) {
                    if content.is_empty() {
                        continue;
                    }
                    hashes.insert(path, Sha256::digest(&content).into());
                }
            }
        }
        hashes
    }

    /// Rescan config + auth dir and publish the result. Returns the net
    /// per-credential events; identical on-disk content returns nothing and
    /// publishes nothing.
    pub async fn reconcile(&self) -> Vec<AuthUpdate> {
        let new_hashes = self.hash_sources();
        {
            let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
            if *hashes == new_hashes {
                debug!("reload skipped, content unchanged");
                return Vec::new();
            }
            *hashes = new_hashes;
        }

        // Re-read config; a broken config keeps the previous one alive.
        match Config::load(&self.config_path) {
            Ok(new_config) => {
                let new_config = Arc::new(new_config);
                self.manager.set_retry_policy(
                    new_config.request_retry(),
                    new_config.max_retry_interval(),
                );
                *self.config.write().await = new_config;
            }
            Err(e) => {
                error!(%e, "config reload failed, keeping previous config");
            }
        }

        let config = self.config.read().await.clone();
        let next = build_snapshot(&config, &self.auth_dir);
        let prev = self.manager.snapshot().await;
        let updates = AuthSnapshot::diff(&prev, &next);

        if updates.is_empty() {
            debug!("reload produced no credential changes");
            return updates;
        }

        for update in &updates {
            match update {
                AuthUpdate::Add(c) => info!(id = %c.id, label = %c.label, "credential added"),
                AuthUpdate::Modify(c) => {
                    // Secret values never hit the log.
                    info!(id = %c.id, label = %c.label, "credential updated (redacted)");
                }
                AuthUpdate::Delete(id) => info!(id = %id, "credential removed"),
            }
        }

        let registry = Arc::new(ModelRegistry::build(&next));
        self.manager.publish(next, registry).await;
        updates
    }

    /// Initial load at boot; also primes the hash gate.
    pub async fn bootstrap(&self) -> usize {
        let updates = self.reconcile().await;
        updates.len()
    }
}

/// Filesystem watcher feeding the reconciler. Keep the handle alive for the
/// lifetime of the server.
pub struct WatchHandle {
    _watcher: notify::RecommendedWatcher,
}

pub fn start_watching(reconciler: Arc<Reconciler>) -> anyhow::Result<WatchHandle> {
    let (tx, rx) = mpsc::unbounded_channel::<()>();

    let config_path = reconciler.config_path.clone();
    let auth_dir = reconciler.auth_dir.clone();
    let config_name = config_path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<notify::Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!(%e, "file watch error");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            if event.paths.iter().any(|p| relevant(p, &config_name)) {
                let _ = tx.send(());
            }
        },
    )?;

    // Watch the config file's parent (to catch renames/recreates) and the
    // auth dir.
    let config_parent = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    watcher.watch(&config_parent, RecursiveMode::NonRecursive)?;
    if auth_dir.is_dir() && auth_dir != config_parent {
        watcher.watch(&auth_dir, RecursiveMode::NonRecursive)?;
    }
    info!(
        config = %config_path.display(),
        auth_dir = %auth_dir.display(),
        "hot-reload watcher started"
    );

    tokio::spawn(debounce_loop(rx, reconciler));

    Ok(WatchHandle { _watcher: watcher })
}

/// Only the config file and `*.json` auth files trigger reloads; editor
/// swap files and sidecars are ignored.
fn relevant(path: &Path, config_name: &Option<std::ffi::OsString>) -> bool {
    if let Some(name) = config_name {
        if path.file_name() == Some(name.as_os_str()) {
            return true;
        }
    }
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

async fn debounce_loop(mut rx: mpsc::UnboundedReceiver<()>, reconciler: Arc<Reconciler>) {
    while rx.recv().await.is_some() {
        // Collect the burst before reloading.
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        let updates = reconciler.reconcile().await;
        if !updates.is_empty() {
            info!(events = updates.len(), "hot reload applied");
        } else {
            debug!("hot reload was a no-op");
        }
    }
    warn!("watch channel closed, hot reload stopped");
}
