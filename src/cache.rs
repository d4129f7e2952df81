use crate::results::HostnameResult;
use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Backing store for hostname scans. The default is an in-memory map,
/// a persistent implementation can be substituted as long as it
/// provides its own serialization of concurrent access.
pub trait ScanStore: Send + Sync {
    fn get_hostname_scan<'a>(
        &'a self,
        hostname: &'a str,
    ) -> BoxFuture<'a, Result<Option<HostnameResult>>>;

    fn put_hostname_scan<'a>(
        &'a self,
        hostname: &'a str,
        scan: HostnameResult,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Default)]
pub struct MemoryScanStore {
    scans: Mutex<HashMap<String, HostnameResult>>,
}

impl ScanStore for MemoryScanStore {
    fn get_hostname_scan<'a>(
        &'a self,
        hostname: &'a str,
    ) -> BoxFuture<'a, Result<Option<HostnameResult>>> {
        Box::pin(async move { Ok(self.scans.lock().await.get(hostname).cloned()) })
    }

    fn put_hostname_scan<'a>(
        &'a self,
        hostname: &'a str,
        scan: HostnameResult,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.scans.lock().await.insert(hostname.to_string(), scan);
            Ok(())
        })
    }
}

/// Time-windowed cache of hostname scans, so that domains sharing an
/// MX host are not probed twice within the expiry window. Expiry is
/// lazy: stale entries are ignored on read and linger until overwritten.
pub struct ScanCache {
    store: Arc<dyn ScanStore>,
    expire_after: Duration,
}

impl ScanCache {
    pub fn new(store: Arc<dyn ScanStore>, expire_after: Duration) -> Self {
        Self {
            store,
            expire_after,
        }
    }

    pub fn in_memory(expire_after: Duration) -> Self {
        Self::new(Arc::new(MemoryScanStore::default()), expire_after)
    }

    /// Looks up a non-expired scan. Store errors count as misses.
    pub async fn get(&self, hostname: &str) -> Option<HostnameResult> {
        let key = normalize_hostname(hostname);
        match self.store.get_hostname_scan(&key).await {
            Ok(Some(scan)) if self.is_fresh(&scan) => Some(scan),
            Ok(_) => None,
            Err(err) => {
                warn!("Scan store lookup for {key} failed: {err:#}");
                None
            }
        }
    }

    /// Stores a scan, best effort. A failing store never fails the scan.
    pub async fn put(&self, scan: HostnameResult) {
        let key = normalize_hostname(&scan.hostname);
        if let Err(err) = self.store.put_hostname_scan(&key, scan).await {
            warn!("Scan store write for {key} failed: {err:#}");
        }
    }

    fn is_fresh(&self, scan: &HostnameResult) -> bool {
        match Utc::now().signed_duration_since(scan.timestamp).to_std() {
            Ok(age) => age < self.expire_after,
            // A timestamp from the future counts as fresh
            Err(_) => true,
        }
    }
}

/// Cache keys are lowercased with any trailing dot stripped.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_lowercase()
}
