use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{Config, RoutingConfig, Strategy};
use crate::fetch::{Fetch, FetchError};
use crate::store::{CacheRegistry, CacheStore, CachedResponse};

/// What to do with an intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch through the named store's strategy
    Intercept { store: String },
    /// Hands off - forward untouched (non-GET, excluded scheme, streaming)
    Passthrough { reason: &'static str },
}

/// Request dispatch / strategy engine.
///
/// Classifies intercepted requests by URL shape, executes the owning
/// store's consistency strategy, and falls back to the offline page or
/// a synthetic 503 when everything else fails.
pub struct Dispatcher {
    registry: Arc<CacheRegistry>,
    fetcher: Arc<dyn Fetch>,
    routing: RoutingConfig,
    base_url: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<CacheRegistry>, fetcher: Arc<dyn Fetch>, config: &Config) -> Self {
        Self {
            registry,
            fetcher,
            routing: config.routing.clone(),
            base_url: config.upstream.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// URL classification: API prefix, static asset, or default dynamic.
    /// Exclusions win over everything - those requests must reach the
    /// network untouched to preserve their semantics.
    pub fn classify(&self, method: &str, url: &str, accept: Option<&str>) -> Decision {
        if method != "GET" {
            return Decision::Passthrough { reason: "non-GET" };
        }

        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            if self.routing.excluded_schemes.iter().any(|s| s == scheme) {
                return Decision::Passthrough { reason: "excluded scheme" };
            }
        }

        let path = path_of(url);
        if self.routing.streaming_paths.iter().any(|p| path.starts_with(p.as_str()))
            || accept.map(|a| a.contains("text/event-stream")).unwrap_or(false)
        {
            return Decision::Passthrough { reason: "streaming" };
        }

        if self.routing.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Decision::Intercept { store: "api".to_string() };
        }

        let by_prefix = self.routing.static_prefixes.iter().any(|p| path.starts_with(p.as_str()));
        let by_extension = path
            .rsplit_once('.')
            .map(|(_, ext)| self.routing.static_extensions.iter().any(|e| e == ext))
            .unwrap_or(false);
        if by_prefix || by_extension {
            return Decision::Intercept { store: "static".to_string() };
        }

        Decision::Intercept { store: "dynamic".to_string() }
    }

    fn absolute(&self, path_or_url: &str) -> String {
        if path_or_url.contains("://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.base_url, path_or_url)
        }
    }

    /// Full dispatch for an intercepted GET. Never fails: unhandled
    /// errors degrade to the offline page (navigation) or a 503.
    pub async fn dispatch(&self, path: &str, navigation: bool) -> CachedResponse {
        let store_name = match self.classify("GET", path, None) {
            Decision::Intercept { store } => store,
            Decision::Passthrough { .. } => "dynamic".to_string(),
        };

        let result = match self.registry.store(&store_name) {
            Some(store) => {
                let url = self.absolute(path);
                self.execute(store.config().strategy, &store, &url).await
            }
            None => Err(anyhow::anyhow!("No store configured for {}", store_name)),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Dispatch failed for {}: {}", path, e);
                if navigation {
                    if let Some(page) = self.offline_fallback() {
                        return page;
                    }
                }
                synthetic_503()
            }
        }
    }

    /// Execute one consistency strategy against a store
    pub async fn execute(
        &self,
        strategy: Strategy,
        store: &Arc<CacheStore>,
        url: &str,
    ) -> anyhow::Result<CachedResponse> {
        match strategy {
            Strategy::CacheFirst => self.cache_first(store, url).await,
            Strategy::NetworkFirst => self.network_first(store, url).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(store, url).await,
            Strategy::CacheOnly => self.cache_only(store, url),
        }
    }

    async fn cache_first(&self, store: &Arc<CacheStore>, url: &str) -> anyhow::Result<CachedResponse> {
        if let Some(hit) = store.get_fresh(url) {
            return Ok(hit);
        }

        match self.fetcher.fetch(url).await {
            Ok(response) => {
                store.put(url, response.clone());
                Ok(response)
            }
            Err(e) => {
                // Stale beats nothing
                if let Some(stale) = store.get_any(url) {
                    debug!("Serving stale entry for {} after network failure", url);
                    return Ok(stale);
                }
                Err(e.into())
            }
        }
    }

    /// Race the fetch against the store's network timeout. A fired
    /// timeout does not abort the fetch; the attempt is simply lost
    /// for this call.
    async fn network_first(&self, store: &Arc<CacheStore>, url: &str) -> anyhow::Result<CachedResponse> {
        let limit = Duration::from_secs(store.config().network_timeout_secs);
        let result = match tokio::time::timeout(limit, self.fetcher.fetch(url)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout),
        };

        match result {
            Ok(response) => {
                store.put(url, response.clone());
                Ok(response)
            }
            Err(e) => match store.get_fresh(url) {
                Some(hit) => {
                    debug!("Network-first fallback to cache for {} ({})", url, e);
                    Ok(hit)
                }
                None => Err(e.into()),
            },
        }
    }

    /// Return whatever is cached immediately and refresh in the
    /// background; revalidation errors are logged, never surfaced.
    async fn stale_while_revalidate(
        &self,
        store: &Arc<CacheStore>,
        url: &str,
    ) -> anyhow::Result<CachedResponse> {
        if let Some(hit) = store.get_any(url) {
            let fetcher = self.fetcher.clone();
            let store = store.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                match fetcher.fetch(&url).await {
                    Ok(response) => {
                        store.put(&url, response);
                    }
                    Err(e) => debug!("Background revalidation failed for {}: {}", url, e),
                }
            });
            return Ok(hit);
        }

        let response = self.fetcher.fetch(url).await?;
        store.put(url, response.clone());
        Ok(response)
    }

    fn cache_only(&self, store: &Arc<CacheStore>, url: &str) -> anyhow::Result<CachedResponse> {
        store
            .get_fresh(url)
            .ok_or_else(|| anyhow::anyhow!("No cached response available for {}", url))
    }

    /// Fetch-and-cache for the preloader: always goes to the network
    /// and writes through the classified store.
    pub async fn warm(&self, path_or_url: &str) -> Result<(), FetchError> {
        let store_name = match self.classify("GET", path_or_url, None) {
            Decision::Intercept { store } => store,
            Decision::Passthrough { reason } => {
                debug!("Not warming {} ({})", path_or_url, reason);
                return Ok(());
            }
        };
        let store = self
            .registry
            .store(&store_name)
            .ok_or_else(|| FetchError::Transport(format!("no store for {}", store_name)))?;

        let url = self.absolute(path_or_url);
        let response = self.fetcher.fetch(&url).await?;
        store.put(&url, response);
        Ok(())
    }

    /// Warm the offline fallback page into the offline store
    pub async fn precache_offline_page(&self) -> Result<(), FetchError> {
        let store = match self.registry.store("offline") {
            Some(s) => s,
            None => return Ok(()),
        };
        let url = self.absolute(&self.routing.offline_page);
        let response = self.fetcher.fetch(&url).await?;
        store.put(&url, response);
        Ok(())
    }

    fn offline_fallback(&self) -> Option<CachedResponse> {
        let store = self.registry.store("offline")?;
        let url = self.absolute(&self.routing.offline_page);
        store.get_any(&url)
    }
}

pub fn synthetic_503() -> CachedResponse {
    CachedResponse {
        status: 503,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: b"Service temporarily unavailable".to_vec(),
    }
}

fn path_of(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            }
        }
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted fetcher: pops one scripted result per call
    struct StubFetch {
        script: Mutex<VecDeque<Result<CachedResponse, FetchError>>>,
        calls: AtomicU32,
    }

    impl StubFetch {
        fn new(script: Vec<Result<CachedResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for StubFetch {
        async fn fetch(&self, _url: &str) -> Result<CachedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(FetchError::Transport("script exhausted".into())))
        }
    }

    /// Fetcher that never settles (timeout scenarios)
    struct HangingFetch;

    #[async_trait]
    impl Fetch for HangingFetch {
        async fn fetch(&self, _url: &str) -> Result<CachedResponse, FetchError> {
            std::future::pending().await
        }
    }

    fn ok(body: &str) -> Result<CachedResponse, FetchError> {
        Ok(CachedResponse {
            status: 200,
            headers: vec![],
            body: body.as_bytes().to_vec(),
        })
    }

    fn dispatcher(fetcher: Arc<dyn Fetch>) -> (Dispatcher, Arc<CacheRegistry>) {
        let config = Config::default();
        let registry = Arc::new(CacheRegistry::new(&config.cache));
        (Dispatcher::new(registry.clone(), fetcher, &config), registry)
    }

    #[test]
    fn test_classification() {
        let (d, _) = dispatcher(StubFetch::new(vec![]));

        assert_eq!(
            d.classify("GET", "/api/github/summary", None),
            Decision::Intercept { store: "api".into() }
        );
        assert_eq!(
            d.classify("GET", "/assets/app.js", None),
            Decision::Intercept { store: "static".into() }
        );
        assert_eq!(
            d.classify("GET", "/favicon.ico", None),
            Decision::Intercept { store: "static".into() }
        );
        assert_eq!(
            d.classify("GET", "/dashboard", None),
            Decision::Intercept { store: "dynamic".into() }
        );
        assert_eq!(
            d.classify("POST", "/api/github/summary", None),
            Decision::Passthrough { reason: "non-GET" }
        );
        assert_eq!(
            d.classify("GET", "/api/slack/events", None),
            Decision::Passthrough { reason: "streaming" }
        );
        assert_eq!(
            d.classify("GET", "/api/feed", Some("text/event-stream")),
            Decision::Passthrough { reason: "streaming" }
        );
        assert_eq!(
            d.classify("GET", "chrome-extension://abc/page.js", None),
            Decision::Passthrough { reason: "excluded scheme" }
        );
    }

    #[tokio::test]
    async fn test_cache_first_serves_fresh_hit_without_network() {
        let stub = StubFetch::new(vec![ok("fetched")]);
        let (d, registry) = dispatcher(stub.clone());
        let store = registry.store("static").unwrap();

        let first = d
            .execute(Strategy::CacheFirst, &store, "http://up/a.js")
            .await
            .unwrap();
        assert_eq!(first.body, b"fetched");
        assert_eq!(stub.calls(), 1);

        let second = d
            .execute(Strategy::CacheFirst, &store, "http://up/a.js")
            .await
            .unwrap();
        assert_eq!(second.body, b"fetched");
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_first_falls_back_to_stale_on_failure() {
        let stub = StubFetch::new(vec![Err(FetchError::Status(500))]);
        let (d, registry) = dispatcher(stub);
        let store = registry.store("static").unwrap();

        // Stale entry planted directly (stamp far in the past)
        let mut old = CachedResponse {
            status: 200,
            headers: vec![],
            body: b"stale".to_vec(),
        };
        old.set_header(
            crate::store::CACHE_TIME_HEADER,
            (chrono::Utc::now().timestamp_millis() - 100 * 86400 * 1000).to_string(),
        );
        store.insert_raw("http://up/a.js", old);

        let got = d
            .execute(Strategy::CacheFirst, &store, "http://up/a.js")
            .await
            .unwrap();
        assert_eq!(got.body, b"stale");
    }

    #[tokio::test]
    async fn test_cache_first_propagates_error_with_empty_cache() {
        let stub = StubFetch::new(vec![Err(FetchError::Status(502))]);
        let (d, registry) = dispatcher(stub);
        let store = registry.store("static").unwrap();

        let err = d
            .execute(Strategy::CacheFirst, &store, "http://up/missing.js")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_network_first_success_writes_back() {
        let stub = StubFetch::new(vec![ok("live")]);
        let (d, registry) = dispatcher(stub);
        let store = registry.store("api").unwrap();

        let got = d
            .execute(Strategy::NetworkFirst, &store, "http://up/api/x")
            .await
            .unwrap();
        assert_eq!(got.body, b"live");
        assert_eq!(store.get_fresh("http://up/api/x").unwrap().body, b"live");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_timeout_falls_back_to_fresh_cache() {
        let (d, registry) = dispatcher(Arc::new(HangingFetch));
        let store = registry.store("api").unwrap();
        store.put(
            "http://up/api/x",
            CachedResponse { status: 200, headers: vec![], body: b"cached".to_vec() },
        );

        let got = d
            .execute(Strategy::NetworkFirst, &store, "http://up/api/x")
            .await
            .unwrap();
        assert_eq!(got.body, b"cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_timeout_without_cache_is_an_error() {
        let (d, registry) = dispatcher(Arc::new(HangingFetch));
        let store = registry.store("api").unwrap();

        let err = d
            .execute(Strategy::NetworkFirst, &store, "http://up/api/x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_returns_old_then_updates() {
        let stub = StubFetch::new(vec![ok("v2")]);
        let (d, registry) = dispatcher(stub);
        let store = registry.store("dynamic").unwrap();
        store.put(
            "http://up/page",
            CachedResponse { status: 200, headers: vec![], body: b"v1".to_vec() },
        );

        let got = d
            .execute(Strategy::StaleWhileRevalidate, &store, "http://up/page")
            .await
            .unwrap();
        assert_eq!(got.body, b"v1");

        // Let the background refresh settle
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get_fresh("http://up/page").unwrap().body, b"v2");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_swallows_background_failure() {
        let stub = StubFetch::new(vec![Err(FetchError::Status(500))]);
        let (d, registry) = dispatcher(stub);
        let store = registry.store("dynamic").unwrap();
        store.put(
            "http://up/page",
            CachedResponse { status: 200, headers: vec![], body: b"v1".to_vec() },
        );

        let got = d
            .execute(Strategy::StaleWhileRevalidate, &store, "http://up/page")
            .await
            .unwrap();
        assert_eq!(got.body, b"v1");

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // Old value survives the failed refresh
        assert_eq!(store.get_any("http://up/page").unwrap().body, b"v1");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_awaits_network_on_miss() {
        let stub = StubFetch::new(vec![ok("first")]);
        let (d, registry) = dispatcher(stub);
        let store = registry.store("dynamic").unwrap();

        let got = d
            .execute(Strategy::StaleWhileRevalidate, &store, "http://up/page")
            .await
            .unwrap();
        assert_eq!(got.body, b"first");
    }

    #[tokio::test]
    async fn test_cache_only_names_the_missing_url() {
        let (d, registry) = dispatcher(StubFetch::new(vec![]));
        let store = registry.store("offline").unwrap();

        let err = d
            .execute(Strategy::CacheOnly, &store, "http://up/offline.html")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http://up/offline.html"));

        store.put(
            "http://up/offline.html",
            CachedResponse { status: 200, headers: vec![], body: b"offline".to_vec() },
        );
        let got = d
            .execute(Strategy::CacheOnly, &store, "http://up/offline.html")
            .await
            .unwrap();
        assert_eq!(got.body, b"offline");
    }

    #[tokio::test]
    async fn test_dispatch_failure_falls_back_to_offline_page_for_navigation() {
        let stub = StubFetch::new(vec![Err(FetchError::Transport("down".into()))]);
        let (d, registry) = dispatcher(stub);

        let offline = registry.store("offline").unwrap();
        offline.put(
            "http://127.0.0.1:3000/offline.html",
            CachedResponse { status: 200, headers: vec![], body: b"you are offline".to_vec() },
        );

        let got = d.dispatch("/dashboard", true).await;
        assert_eq!(got.body, b"you are offline");
    }

    #[tokio::test]
    async fn test_dispatch_failure_returns_503_for_resources() {
        let stub = StubFetch::new(vec![Err(FetchError::Transport("down".into()))]);
        let (d, _) = dispatcher(stub);

        let got = d.dispatch("/dashboard", false).await;
        assert_eq!(got.status, 503);
    }
}
