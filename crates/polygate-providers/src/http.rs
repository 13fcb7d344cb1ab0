//! Shared HTTP client pool.
//!
//! Executors are stateless aside from this pool, which caches one
//! `reqwest::Client` per distinct proxy URL. A credential's `proxy_url`
//! attribute wins over the process default.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use polygate_core::error::{GatewayError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ClientPool {
    default_proxy: Option<String>,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ClientPool {
    pub fn new(default_proxy: Option<String>) -> Self {
        Self {
            default_proxy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for the given per-credential proxy override.
    pub fn client(&self, proxy_url: Option<&str>) -> Result<reqwest::Client> {
        let proxy = proxy_url
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_proxy.clone());
        let key = proxy.clone().unwrap_or_default();

        let mut clients = self
            .clients
            .lock()
            .map_err(|_| GatewayError::Network("client pool poisoned".into()))?;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(url) = &proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| GatewayError::Config(format!("invalid proxy url '{url}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_caches_by_proxy() {
        let pool = ClientPool::new(None);
        // Same key twice is fine; distinct proxies build distinct clients.
        assert!(pool.client(None).is_ok());
        assert!(pool.client(None).is_ok());
        assert!(pool.client(Some("http://127.0.0.1:8888")).is_ok());
        assert_eq!(pool.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let pool = ClientPool::new(None);
        assert!(pool.client(Some("::not a url::")).is_err());
    }

    #[test]
    fn test_default_proxy_applies_when_no_override() {
        let pool = ClientPool::new(Some("http://127.0.0.1:1080".into()));
        assert!(pool.client(None).is_ok());
        let clients = pool.clients.lock().unwrap();
        assert!(clients.contains_key("http://127.0.0.1:1080"));
    }
}
