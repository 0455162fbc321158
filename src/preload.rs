use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{PreloadConfig, PreloadRoute};
use crate::fetch::FetchError;
use crate::patterns::NavigationTracker;

/// Predictive preload scheduler - 招き猫が先に手を振る
///
/// Consumes the pattern model plus the configured route table to warm
/// the cache ahead of navigation. Preloading is best-effort: failures
/// are retried a bounded number of times, then dropped; every terminal
/// outcome lands in the completion ledger, nothing is ever thrown at a
/// caller.

/// Lower value = more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(v: u8) -> Self {
        match v {
            1 => Priority::Critical,
            2 => Priority::High,
            3 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadStrategy {
    Immediate,
    Idle,
    Predictive,
    Critical,
}

impl PreloadStrategy {
    pub fn name(self) -> &'static str {
        match self {
            PreloadStrategy::Immediate => "immediate",
            PreloadStrategy::Idle => "idle",
            PreloadStrategy::Predictive => "predictive",
            PreloadStrategy::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreloadResource {
    pub url: String,
    pub priority: Priority,
}

/// One resource pending speculative fetch
#[derive(Debug, Clone)]
pub struct PreloadQueueItem {
    pub url: String,
    pub priority: Priority,
    pub strategy: PreloadStrategy,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

/// Terminal outcome, kept in the bounded completion ledger
#[derive(Debug, Clone, serde::Serialize)]
pub struct PreloadOutcome {
    pub url: String,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub timestamp: String,
}

/// Seam between the scheduler and the fetch-and-cache path
#[async_trait]
pub trait Warm: Send + Sync {
    async fn warm(&self, url: &str) -> Result<(), FetchError>;
}

#[async_trait]
impl Warm for crate::dispatch::Dispatcher {
    async fn warm(&self, url: &str) -> Result<(), FetchError> {
        crate::dispatch::Dispatcher::warm(self, url).await
    }
}

/// Injected idle capability: prefer a native idle signal when the host
/// has one; the default falls back to a fixed-interval timer.
#[async_trait]
pub trait IdleDetector: Send + Sync {
    /// Wait for the next idle period and return the remaining budget;
    /// zero means "woke up but no idle time left, check again later"
    async fn wait_for_idle(&self) -> Duration;
}

pub struct IntervalIdle {
    interval: Duration,
    budget: Duration,
}

impl IntervalIdle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            budget: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl IdleDetector for IntervalIdle {
    async fn wait_for_idle(&self) -> Duration {
        tokio::time::sleep(self.interval).await;
        self.budget
    }
}

pub struct PreloadScheduler {
    config: PreloadConfig,
    warmer: Arc<dyn Warm>,
    tracker: Arc<NavigationTracker>,
    routes: HashMap<String, PreloadRoute>,
    queue: RwLock<HashMap<String, PreloadQueueItem>>,
    active: RwLock<HashSet<String>>,
    ledger: RwLock<VecDeque<PreloadOutcome>>,
    scheduled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl PreloadScheduler {
    pub fn new(
        config: &PreloadConfig,
        warmer: Arc<dyn Warm>,
        tracker: Arc<NavigationTracker>,
    ) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|r| (r.path.clone(), r.clone()))
            .collect();
        Self {
            config: config.clone(),
            warmer,
            tracker,
            routes,
            queue: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            ledger: RwLock::new(VecDeque::new()),
            scheduled: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Enqueue resources (deduplicated by URL, last write wins) and
    /// dispatch according to the strategy.
    pub async fn schedule(
        self: &Arc<Self>,
        resources: &[PreloadResource],
        strategy: PreloadStrategy,
    ) {
        if !self.config.enabled {
            return;
        }

        {
            let mut queue = self.queue.write();
            let active = self.active.read();
            for resource in resources {
                if active.contains(&resource.url) {
                    continue;
                }
                queue.insert(
                    resource.url.clone(),
                    PreloadQueueItem {
                        url: resource.url.clone(),
                        priority: resource.priority,
                        strategy,
                        enqueued_at: Instant::now(),
                        attempts: 0,
                    },
                );
                self.scheduled.fetch_add(1, Ordering::Relaxed);
            }
        }

        match strategy {
            PreloadStrategy::Immediate => {
                let batch = self.next_batch(self.config.batch_size);
                self.execute_batch(batch).await;
            }
            PreloadStrategy::Idle => {
                // Left queued for the idle loop
            }
            PreloadStrategy::Predictive => {
                let batch = self.predictive_batch();
                self.execute_batch(batch).await;
            }
            PreloadStrategy::Critical => {
                let batch = self.critical_batch();
                self.execute_batch(batch).await;
            }
        }
    }

    /// Most urgent items first (ascending priority value), capped
    pub fn next_batch(&self, max: usize) -> Vec<PreloadQueueItem> {
        let mut queue = self.queue.write();
        let mut items: Vec<PreloadQueueItem> = queue.values().cloned().collect();
        items.sort_by_key(|i| (i.priority.value(), i.enqueued_at));
        items.truncate(max);
        for item in &items {
            queue.remove(&item.url);
        }
        items
    }

    /// Items whose computed confidence clears the threshold, capped
    fn predictive_batch(&self) -> Vec<PreloadQueueItem> {
        let mut queue = self.queue.write();
        let mut items: Vec<PreloadQueueItem> = queue
            .values()
            .filter(|i| self.item_confidence(i) >= self.config.confidence_threshold)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.priority.value(), i.enqueued_at));
        items.truncate(self.config.batch_size);
        for item in &items {
            queue.remove(&item.url);
        }
        items
    }

    /// Every critical-priority item, regardless of batch size
    fn critical_batch(&self) -> Vec<PreloadQueueItem> {
        let mut queue = self.queue.write();
        let items: Vec<PreloadQueueItem> = queue
            .values()
            .filter(|i| i.priority == Priority::Critical)
            .cloned()
            .collect();
        for item in &items {
            queue.remove(&item.url);
        }
        items
    }

    /// Idle-tagged items only, smaller cap
    fn idle_batch(&self) -> Vec<PreloadQueueItem> {
        let mut queue = self.queue.write();
        let mut items: Vec<PreloadQueueItem> = queue
            .values()
            .filter(|i| i.strategy == PreloadStrategy::Idle)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.priority.value(), i.enqueued_at));
        items.truncate(self.config.idle_batch_size);
        for item in &items {
            queue.remove(&item.url);
        }
        items
    }

    /// Priority/age blend in [0,1]. A policy knob, not a law: higher
    /// priority and fresher items score higher, items older than
    /// max_preload_age score toward zero.
    pub fn item_confidence(&self, item: &PreloadQueueItem) -> f64 {
        let priority_part = 1.0 - item.priority.value() as f64 / 4.0;
        let age = item.enqueued_at.elapsed().as_secs_f64();
        let freshness = (1.0 - age / self.config.max_preload_age_secs as f64).max(0.0);
        priority_part * freshness
    }

    /// All-settled concurrent execution: one failure never cancels or
    /// delays the rest of the batch.
    async fn execute_batch(self: &Arc<Self>, items: Vec<PreloadQueueItem>) {
        if items.is_empty() {
            return;
        }
        debug!("Executing preload batch of {}", items.len());
        {
            let mut active = self.active.write();
            for item in &items {
                active.insert(item.url.clone());
            }
        }
        let tasks: Vec<_> = items
            .into_iter()
            .map(|item| {
                let scheduler = self.clone();
                async move { scheduler.execute_one(item).await }
            })
            .collect();
        futures::future::join_all(tasks).await;
    }

    fn execute_one(
        self: &Arc<Self>,
        mut item: PreloadQueueItem,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let this = self.clone();
        Box::pin(async move {
            let result = this.warmer.warm(&item.url).await;
            this.active.write().remove(&item.url);

            match result {
                Ok(()) => {
                    this.succeeded.fetch_add(1, Ordering::Relaxed);
                    this.record_outcome(PreloadOutcome {
                        url: item.url.clone(),
                        success: true,
                        attempts: item.attempts,
                        error: None,
                        timestamp: Utc::now().to_rfc3339(),
                    });
                }
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts < this.config.max_attempts {
                        // Retry after exponential backoff. The timer is not
                        // tracked: a worker teardown before it fires loses
                        // the retry, which preloading tolerates.
                        let delay = Duration::from_secs(2u64.pow(item.attempts));
                        debug!(
                            "Preload failed for {} (attempt {}), retrying in {:?}",
                            item.url, item.attempts, delay
                        );
                        let scheduler = this.clone();
                        let backoff = tokio::time::sleep(delay);
                        tokio::spawn(async move {
                            backoff.await;
                            scheduler.active.write().insert(item.url.clone());
                            scheduler.execute_one(item).await;
                        });
                    } else {
                        warn!("Dropping preload for {} after {} attempts: {}", item.url, item.attempts, e);
                        this.failed.fetch_add(1, Ordering::Relaxed);
                        this.record_outcome(PreloadOutcome {
                            url: item.url.clone(),
                            success: false,
                            attempts: item.attempts,
                            error: Some(e.to_string()),
                            timestamp: Utc::now().to_rfc3339(),
                        });
                    }
                }
            }
        })
    }

    fn record_outcome(&self, outcome: PreloadOutcome) {
        let mut ledger = self.ledger.write();
        if ledger.len() >= self.config.ledger_size {
            ledger.pop_front();
        }
        ledger.push_back(outcome);
    }

    /// Predictive preloading for a just-visited path: rank its
    /// transition targets, map each to its configured resource set and
    /// schedule under the predictive strategy.
    pub async fn preload_for_path(self: &Arc<Self>, path: &str) {
        let predictions = self.tracker.predictions(path);
        if predictions.is_empty() {
            return;
        }

        let mut resources = Vec::new();
        for (target, confidence) in &predictions {
            debug!("Predicted {} -> {} ({:.2})", path, target, confidence);
            match self.routes.get(target) {
                Some(route) => {
                    for url in &route.resources {
                        resources.push(PreloadResource {
                            url: url.clone(),
                            priority: Priority::from_value(route.priority),
                        });
                    }
                }
                // No configured resource set: warm the page itself
                None => resources.push(PreloadResource {
                    url: target.clone(),
                    priority: Priority::Critical,
                }),
            }
        }
        self.schedule(&resources, PreloadStrategy::Predictive).await;
    }

    /// Warm the configured critical resources (startup and
    /// PRELOAD_CRITICAL_DATA)
    pub async fn preload_critical(self: &Arc<Self>) {
        let resources: Vec<PreloadResource> = self
            .config
            .critical_resources
            .iter()
            .map(|url| PreloadResource {
                url: url.clone(),
                priority: Priority::Critical,
            })
            .collect();
        if resources.is_empty() {
            return;
        }
        info!("Preloading {} critical resources", resources.len());
        self.schedule(&resources, PreloadStrategy::Critical).await;
    }

    /// Forced preload of explicit URLs (FORCE_PRELOAD)
    pub async fn force_preload(self: &Arc<Self>, urls: &[String]) {
        let resources: Vec<PreloadResource> = urls
            .iter()
            .map(|url| PreloadResource {
                url: url.clone(),
                priority: Priority::High,
            })
            .collect();
        self.schedule(&resources, PreloadStrategy::Immediate).await;
    }

    /// One idle slice of work
    pub async fn process_idle_batch(self: &Arc<Self>) {
        let batch = self.idle_batch();
        self.execute_batch(batch).await;
    }

    /// Idle loop: only work while the detector reports remaining
    /// budget, then immediately wait for the next idle period.
    pub async fn run_idle_loop(self: Arc<Self>, detector: Arc<dyn IdleDetector>) {
        if !self.config.enabled {
            return;
        }
        info!("Preload idle loop started");
        loop {
            let budget = detector.wait_for_idle().await;
            if budget > Duration::ZERO {
                self.process_idle_batch().await;
            }
        }
    }

    pub fn clear_queue(&self) {
        self.queue.write().clear();
        debug!("Preload queue cleared");
    }

    pub fn queue_len(&self) -> usize {
        self.queue.read().len()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let ledger = self.ledger.read();
        let recent: Vec<&PreloadOutcome> = ledger.iter().rev().take(20).collect();
        serde_json::json!({
            "enabled": self.config.enabled,
            "queued": self.queue.read().len(),
            "active": self.active.read().len(),
            "scheduled": self.scheduled.load(Ordering::Relaxed),
            "succeeded": self.succeeded.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "completed": ledger.len(),
            "recent": recent,
        })
    }

    #[cfg(test)]
    fn ledger_snapshot(&self) -> Vec<PreloadOutcome> {
        self.ledger.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    /// Scripted warmer: per-URL countdown of failures before success
    struct StubWarm {
        failures_left: Mutex<HashMap<String, u32>>,
        always_fail: bool,
        calls: AtomicU32,
    }

    impl StubWarm {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(HashMap::new()),
                always_fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                failures_left: Mutex::new(HashMap::new()),
                always_fail: true,
                calls: AtomicU32::new(0),
            })
        }

        fn flaky(url: &str, failures: u32) -> Arc<Self> {
            let mut map = HashMap::new();
            map.insert(url.to_string(), failures);
            Arc::new(Self {
                failures_left: Mutex::new(map),
                always_fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Warm for StubWarm {
        async fn warm(&self, url: &str) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail {
                return Err(FetchError::Status(503));
            }
            let mut map = self.failures_left.lock();
            match map.get_mut(url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(FetchError::Status(503))
                }
                _ => Ok(()),
            }
        }
    }

    fn scheduler(warmer: Arc<dyn Warm>) -> Arc<PreloadScheduler> {
        let mut config = PreloadConfig::default();
        config.batch_size = 3;
        let tracker = Arc::new(NavigationTracker::new(&PatternConfig::default()));
        Arc::new(PreloadScheduler::new(&config, warmer, tracker))
    }

    fn resource(url: &str, priority: Priority) -> PreloadResource {
        PreloadResource { url: url.to_string(), priority }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_batch_sorts_by_priority() {
        let sched = scheduler(StubWarm::ok());
        {
            let mut queue = sched.queue.write();
            for (url, priority) in [("/api/y", Priority::Medium), ("/api/x", Priority::Critical)] {
                queue.insert(
                    url.to_string(),
                    PreloadQueueItem {
                        url: url.to_string(),
                        priority,
                        strategy: PreloadStrategy::Immediate,
                        enqueued_at: Instant::now(),
                        attempts: 0,
                    },
                );
            }
        }

        let batch = sched.next_batch(3);
        let urls: Vec<&str> = batch.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["/api/x", "/api/y"]);
        assert_eq!(sched.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_dedupes_last_write_wins() {
        let sched = scheduler(StubWarm::ok());
        sched
            .schedule(&[resource("/api/x", Priority::Low)], PreloadStrategy::Idle)
            .await;
        sched
            .schedule(&[resource("/api/x", Priority::Critical)], PreloadStrategy::Idle)
            .await;

        assert_eq!(sched.queue_len(), 1);
        assert_eq!(sched.queue.read()["/api/x"].priority, Priority::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confidence_mixes_priority_and_age() {
        let sched = scheduler(StubWarm::ok());
        let fresh = PreloadQueueItem {
            url: "/x".into(),
            priority: Priority::Critical,
            strategy: PreloadStrategy::Predictive,
            enqueued_at: Instant::now(),
            attempts: 0,
        };
        assert!((sched.item_confidence(&fresh) - 0.75).abs() < 1e-9);

        let mid = PreloadQueueItem { priority: Priority::High, ..fresh.clone() };
        assert!((sched.item_confidence(&mid) - 0.5).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(sched.item_confidence(&fresh), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predictive_only_executes_confident_items() {
        let warmer = StubWarm::ok();
        let sched = scheduler(warmer.clone());
        sched
            .schedule(
                &[
                    resource("/critical", Priority::Critical),
                    resource("/casual", Priority::High),
                ],
                PreloadStrategy::Predictive,
            )
            .await;

        // 0.75 clears the 0.7 threshold, 0.5 does not
        assert_eq!(warmer.calls(), 1);
        assert_eq!(sched.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_strategy_ignores_batch_size() {
        let warmer = StubWarm::ok();
        let sched = scheduler(warmer.clone());
        let resources: Vec<PreloadResource> = (0..7)
            .map(|i| resource(&format!("/c/{}", i), Priority::Critical))
            .collect();

        sched.schedule(&resources, PreloadStrategy::Critical).await;
        assert_eq!(warmer.calls(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_records_attempts() {
        let warmer = StubWarm::flaky("/api/x", 2);
        let sched = scheduler(warmer.clone());

        sched
            .schedule(&[resource("/api/x", Priority::Critical)], PreloadStrategy::Immediate)
            .await;

        // Backoff timers: 2s after the first failure, 4s after the second
        for delay in [2, 4] {
            tokio::time::advance(Duration::from_secs(delay)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(warmer.calls(), 3);
        let ledger = sched.ledger_snapshot();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].success);
        assert_eq!(ledger[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_item_into_ledger() {
        let warmer = StubWarm::failing();
        let sched = scheduler(warmer.clone());

        sched
            .schedule(&[resource("/api/x", Priority::Critical)], PreloadStrategy::Immediate)
            .await;

        for delay in [2, 4] {
            tokio::time::advance(Duration::from_secs(delay)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(warmer.calls(), 3);
        let ledger = sched.ledger_snapshot();
        assert_eq!(ledger.len(), 1);
        assert!(!ledger[0].success);
        assert_eq!(ledger[0].attempts, 3);
        assert!(ledger[0].error.as_deref().unwrap().contains("503"));
        assert_eq!(sched.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_batch_only_takes_idle_items() {
        let warmer = StubWarm::ok();
        let sched = scheduler(warmer.clone());
        sched
            .schedule(&[resource("/idle/a", Priority::Low)], PreloadStrategy::Idle)
            .await;
        {
            // A non-idle leftover in the queue
            sched.queue.write().insert(
                "/other".to_string(),
                PreloadQueueItem {
                    url: "/other".to_string(),
                    priority: Priority::High,
                    strategy: PreloadStrategy::Predictive,
                    enqueued_at: Instant::now(),
                    attempts: 0,
                },
            );
        }

        sched.process_idle_batch().await;
        assert_eq!(warmer.calls(), 1);
        assert_eq!(sched.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predictive_for_path_uses_tracker() {
        let warmer = StubWarm::ok();
        let mut config = PreloadConfig::default();
        config.routes = vec![PreloadRoute {
            path: "/github".to_string(),
            resources: vec!["/api/github/summary".to_string()],
            priority: 1,
        }];
        let tracker = Arc::new(NavigationTracker::new(&PatternConfig::default()));
        let sched = Arc::new(PreloadScheduler::new(&config, warmer.clone(), tracker.clone()));

        tracker.track_navigation("/home", Some("s1"));
        tracker.track_navigation("/github", Some("s1"));

        sched.preload_for_path("/home").await;
        // /home -> /github has confidence 1.0; its resource set is warmed
        assert_eq!(warmer.calls(), 1);
    }
}
