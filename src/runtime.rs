use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::fetch::{ResilientFetcher, UpstreamClient};
use crate::patterns::NavigationTracker;
use crate::preload::{IntervalIdle, PreloadScheduler};
use crate::store::CacheRegistry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level assembly of the worker: one registry, one resilient
/// fetcher, the dispatcher, the pattern tracker and the preload
/// scheduler, shared across the gateway and the control channel.
pub struct WorkerRuntime {
    pub config: Config,
    pub registry: Arc<CacheRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: Arc<NavigationTracker>,
    pub scheduler: Arc<PreloadScheduler>,
    fetcher: Arc<ResilientFetcher>,
    sync_registered: AtomicBool,
    started_at: DateTime<Utc>,
}

impl WorkerRuntime {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let upstream = Arc::new(UpstreamClient::new(&config.retry)?);
        let fetcher = Arc::new(ResilientFetcher::new(upstream, &config.retry, &config.breaker));

        let registry = Arc::new(CacheRegistry::new(&config.cache));
        let removed = registry.activate();
        if removed > 0 {
            info!("🧹 Activation removed {} stale cache stores", removed);
        }

        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), fetcher.clone(), &config));
        let tracker = Arc::new(NavigationTracker::new(&config.patterns));
        let scheduler = Arc::new(PreloadScheduler::new(
            &config.preload,
            dispatcher.clone(),
            tracker.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            dispatcher,
            tracker,
            scheduler,
            fetcher,
            sync_registered: AtomicBool::new(false),
            started_at: Utc::now(),
        }))
    }

    /// Best-effort warm-up: offline fallback page plus the critical
    /// resource set. Failures are logged and never block startup.
    pub async fn startup_warm(&self) {
        if let Err(e) = self.dispatcher.precache_offline_page().await {
            warn!("Could not precache offline page: {}", e);
        }
        self.scheduler.preload_critical().await;
    }

    /// Navigation hook for the gateway: feed the pattern model, then
    /// kick predictive preloading for the previous path's successor.
    pub async fn on_navigation(&self, path: &str, session_id: Option<&str>) {
        self.tracker.track_navigation(path, session_id);
        self.scheduler.preload_for_path(path).await;
    }

    pub fn register_sync(&self) {
        self.sync_registered.store(true, Ordering::Relaxed);
        info!("🔄 Background sync registered");
    }

    pub fn sync_registered(&self) -> bool {
        self.sync_registered.load(Ordering::Relaxed)
    }

    /// Periodic re-warm of the critical resource set once a sync has
    /// been registered. Dormant until then.
    pub async fn run_sync_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.sync.interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            if !self.sync_registered() {
                continue;
            }
            info!("🔄 Background sync tick");
            self.scheduler.preload_critical().await;
        }
    }

    /// Idle preload loop with the interval-timer fallback detector
    pub async fn run_idle_loop(self: Arc<Self>) {
        let detector = Arc::new(IntervalIdle::new(Duration::from_millis(
            self.config.preload.idle_interval_ms,
        )));
        self.scheduler.clone().run_idle_loop(detector).await;
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "version": VERSION,
            "uptime_secs": self.uptime_secs(),
            "cache": self.registry.stats(),
            "storage": self.registry.storage_info(),
            "fetch": self.fetcher.get_stats(),
            "patterns": self.tracker.get_stats(),
            "preload": self.scheduler.get_stats(),
            "sync_registered": self.sync_registered(),
        })
    }
}
