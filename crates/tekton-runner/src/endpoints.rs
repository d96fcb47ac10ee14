//! Process-wide cache of resolved app endpoints.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use crate::error::Result;
use crate::workspace::AppKey;

/// `(workspace, app)` to URL memo.
///
/// Entries are derived from live service state and may be evicted at any
/// time. The lock is never held across a lookup.
pub struct EndpointCache {
    host: String,
    entries: Mutex<HashMap<AppKey, String>>,
}

impl EndpointCache {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// URL for a node port on the configured host.
    pub fn url_for(&self, node_port: u16) -> String {
        format!("http://{}:{node_port}", self.host)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AppKey, String>> {
        // A poisoned memo is still a valid memo.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, key: &AppKey) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Record the endpoint for `key`, returning its URL.
    pub fn insert(&self, key: AppKey, node_port: u16) -> String {
        let url = self.url_for(node_port);
        self.lock().insert(key, url.clone());
        url
    }

    /// Cached URL, or the result of `lookup` (a node port) cached on success.
    ///
    /// Concurrent misses may both run `lookup`; the first result stored wins.
    pub async fn resolve<F, Fut>(&self, key: &AppKey, lookup: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u16>>,
    {
        if let Some(url) = self.get(key) {
            return Ok(url);
        }
        let url = self.url_for(lookup().await?);
        Ok(self
            .lock()
            .entry(key.clone())
            .or_insert(url)
            .clone())
    }

    pub fn evict(&self, key: &AppKey) {
        self.lock().remove(key);
    }

    pub fn evict_workspace(&self, workspace: &str) {
        self.lock().retain(|k, _| k.workspace != workspace);
    }
}
