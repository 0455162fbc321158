use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{CacheConfig, StoreConfig};

/// Header stamped onto every cached entry with the write time (unix
/// millis). Staleness is computed from this stamp on every read; an
/// entry without a parseable stamp counts as already expired.
pub const CACHE_TIME_HEADER: &str = "x-maneki-cached-at";

/// A cached HTTP response. Hop-by-hop headers are stripped before the
/// entry is stored.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }

    /// Write-time stamp in unix millis, if present and parseable
    pub fn cached_at_millis(&self) -> Option<i64> {
        self.header(CACHE_TIME_HEADER)?.parse().ok()
    }

    /// Age in seconds; None means no usable stamp (treated as expired)
    pub fn age_secs(&self) -> Option<u64> {
        let stamp = self.cached_at_millis()?;
        let now = Utc::now().timestamp_millis();
        Some(((now - stamp).max(0) / 1000) as u64)
    }

    pub fn size_bytes(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

/// One named, policy-governed cache store
pub struct CacheStore {
    full_name: String,
    config: StoreConfig,
    entries: DashMap<String, CachedResponse>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn entry_key(url: &str) -> String {
    // Only GET responses are cached, so the method is fixed
    format!("GET {}", url)
}

impl CacheStore {
    pub fn new(full_name: String, config: StoreConfig) -> Self {
        Self {
            full_name,
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn is_fresh(&self, entry: &CachedResponse) -> bool {
        match entry.age_secs() {
            Some(age) => age <= self.config.max_age_secs,
            None => false,
        }
    }

    /// Fresh entry or nothing; stale entries count as misses
    pub fn get_fresh(&self, url: &str) -> Option<CachedResponse> {
        if let Some(entry) = self.entries.get(&entry_key(url)) {
            if self.is_fresh(&entry) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Any entry, stale included (cache-first network-failure fallback)
    pub fn get_any(&self, url: &str) -> Option<CachedResponse> {
        self.entries.get(&entry_key(url)).map(|e| {
            self.hits.fetch_add(1, Ordering::Relaxed);
            e.clone()
        })
    }

    /// Write path: non-2xx responses are rejected outright; accepted
    /// entries are stamped and the eviction routine runs afterwards.
    pub fn put(&self, url: &str, mut response: CachedResponse) -> bool {
        if !response.is_success() {
            debug!(
                "Refusing to cache {} (HTTP {}) in {}",
                url, response.status, self.full_name
            );
            return false;
        }
        response.set_header(CACHE_TIME_HEADER, Utc::now().timestamp_millis().to_string());
        self.entries.insert(entry_key(url), response);
        self.enforce_limits();
        true
    }

    pub fn remove(&self, url: &str) {
        self.entries.remove(&entry_key(url));
    }

    /// Insert without stamping or eviction (test scaffolding)
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, url: &str, response: CachedResponse) {
        self.entries.insert(entry_key(url), response);
    }

    /// Eviction: expired entries first, then oldest-stamp-first until
    /// the store is back within max_entries. Idempotent; safe to run
    /// redundantly from concurrent write paths.
    pub fn enforce_limits(&self) {
        let mut expired = Vec::new();
        for entry in self.entries.iter() {
            let dead = match entry.age_secs() {
                Some(age) => age > self.config.max_age_secs,
                None => true,
            };
            if dead {
                expired.push(entry.key().clone());
            }
        }
        for key in expired {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.entries.len() <= self.config.max_entries {
            return;
        }

        let mut by_age: Vec<(String, i64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.cached_at_millis().unwrap_or(0)))
            .collect();
        by_age.sort_by_key(|(_, stamp)| *stamp);

        let excess = self.entries.len().saturating_sub(self.config.max_entries);
        for (key, _) in by_age.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes() as u64).sum()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 { hits as f64 / total as f64 * 100.0 } else { 0.0 };

        serde_json::json!({
            "name": self.full_name,
            "entries": self.entries.len(),
            "size": self.total_bytes(),
            "hits": hits,
            "misses": misses,
            "hit_rate_percent": format!("{:.1}", hit_rate),
            "evictions": self.evictions.load(Ordering::Relaxed),
            "config": {
                "strategy": self.config.strategy.name(),
                "max_entries": self.config.max_entries,
                "max_age_secs": self.config.max_age_secs,
                "network_timeout_secs": self.config.network_timeout_secs,
            },
        })
    }

    /// List entries for the Web UI
    pub fn list_entries(&self) -> Vec<serde_json::Value> {
        self.entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "key": entry.key(),
                    "status": entry.status,
                    "bytes": entry.size_bytes(),
                    "age_secs": entry.age_secs(),
                    "stale": !self.is_fresh(&entry),
                })
            })
            .collect()
    }
}

/// The versioned set of named stores.
///
/// Full store names embed the cache generation
/// ("<prefix>-<name>-v<version>"); activation deletes every store whose
/// name carries the prefix but not the current version suffix. That is
/// the sole migration mechanism - nothing is carried forward.
pub struct CacheRegistry {
    prefix: String,
    version: u32,
    quota_bytes: u64,
    configs: HashMap<String, StoreConfig>,
    stores: DashMap<String, Arc<CacheStore>>,
}

impl CacheRegistry {
    pub fn new(config: &CacheConfig) -> Self {
        let configs = config
            .stores
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        Self {
            prefix: config.prefix.clone(),
            version: config.version,
            quota_bytes: config.quota_bytes,
            configs,
            stores: DashMap::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn full_name(&self, logical: &str) -> String {
        format!("{}-{}-v{}", self.prefix, logical, self.version)
    }

    /// Store handle by logical name ("static", "api"...), created
    /// lazily on first use. None for unconfigured names.
    pub fn store(&self, logical: &str) -> Option<Arc<CacheStore>> {
        let config = self.configs.get(logical)?.clone();
        let full = self.full_name(logical);
        Some(
            self.stores
                .entry(full.clone())
                .or_insert_with(|| {
                    debug!("Creating cache store {}", full);
                    Arc::new(CacheStore::new(full.clone(), config))
                })
                .clone(),
        )
    }

    /// Version rollover: delete stores tagged with a prior generation
    pub fn activate(&self) -> usize {
        let suffix = format!("-v{}", self.version);
        let stale: Vec<String> = self
            .stores
            .iter()
            .filter(|e| e.key().starts_with(&self.prefix) && !e.key().ends_with(&suffix))
            .map(|e| e.key().clone())
            .collect();
        let count = stale.len();
        for name in stale {
            info!("Deleting stale cache store {}", name);
            self.stores.remove(&name);
        }
        count
    }

    /// Clear one store (logical or full name) or all of them
    pub fn clear(&self, name: Option<&str>) -> anyhow::Result<()> {
        match name {
            Some(n) => {
                let full = if self.configs.contains_key(n) {
                    self.full_name(n)
                } else {
                    n.to_string()
                };
                match self.stores.get(&full) {
                    Some(store) => {
                        store.clear();
                        info!("Cleared cache store {}", full);
                        Ok(())
                    }
                    None => Err(anyhow::anyhow!("Unknown cache store: {}", n)),
                }
            }
            None => {
                for store in self.stores.iter() {
                    store.clear();
                }
                info!("Cleared all cache stores");
                Ok(())
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.stores.iter().map(|s| s.total_bytes()).sum()
    }

    /// Aggregate stats for GET_CACHE_STATS
    pub fn stats(&self) -> serde_json::Value {
        let stores: Vec<serde_json::Value> =
            self.stores.iter().map(|s| s.get_stats()).collect();
        serde_json::json!(stores)
    }

    /// Quota usage for GET_STORAGE_INFO
    pub fn storage_info(&self) -> serde_json::Value {
        let usage = self.total_bytes();
        serde_json::json!({
            "quota": self.quota_bytes,
            "usage": usage,
            "available": self.quota_bytes.saturating_sub(usage),
        })
    }

    pub fn list_entries(&self) -> serde_json::Value {
        let mut all = serde_json::Map::new();
        for store in self.stores.iter() {
            all.insert(
                store.full_name().to_string(),
                serde_json::Value::Array(store.list_entries()),
            );
        }
        serde_json::Value::Object(all)
    }
}
