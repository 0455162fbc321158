use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub patterns: PatternConfig,
    pub preload: PreloadConfig,
    pub sync: SyncConfig,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_gw_address")]
    pub address: String,
    #[serde(default = "default_gw_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base URL the gateway forwards intercepted paths to
    #[serde(default = "default_upstream_base")]
    pub base_url: String,
}

/// Consistency strategy for a cache store
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    CacheOnly,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::CacheOnly => "cache-only",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub name: String,
    pub strategy: Strategy,
    #[serde(default = "default_store_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_store_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Store name prefix; full names are "<prefix>-<store>-v<version>"
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    /// Cache generation; bumping it deletes all stores of older versions
    #[serde(default = "default_cache_version")]
    pub version: u32,
    /// Nominal storage quota reported by GET_STORAGE_INFO (bytes)
    #[serde(default = "default_quota")]
    pub quota_bytes: u64,
    #[serde(default = "default_stores")]
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    #[serde(default = "default_api_prefixes")]
    pub api_prefixes: Vec<String>,
    #[serde(default = "default_static_prefixes")]
    pub static_prefixes: Vec<String>,
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,
    /// Long-lived streaming endpoints - always passed through untouched
    #[serde(default = "default_streaming_paths")]
    pub streaming_paths: Vec<String>,
    /// URL schemes the dispatcher refuses to intercept
    #[serde(default = "default_excluded_schemes")]
    pub excluded_schemes: Vec<String>,
    /// Path of the cached offline fallback page
    #[serde(default = "default_offline_page")]
    pub offline_page: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Per-attempt timeout for upstream fetches
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    /// Cool-down before a HALF_OPEN probe is allowed
    #[serde(default = "default_breaker_reset_ms")]
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PatternConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_patterns")]
    pub max_patterns: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Session expires after this much inactivity
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Minimum transition confidence for a predictive target
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Visit count above which a path counts as critical
    #[serde(default = "default_critical_visits")]
    pub critical_visits: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreloadRoute {
    pub path: String,
    pub resources: Vec<String>,
    #[serde(default = "default_route_priority")]
    pub priority: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_batch_size")]
    pub idle_batch_size: usize,
    /// Queue items older than this score toward zero confidence
    #[serde(default = "default_max_preload_age")]
    pub max_preload_age_secs: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_ledger_size")]
    pub ledger_size: usize,
    /// Resources warmed on startup / PRELOAD_CRITICAL_DATA
    #[serde(default)]
    pub critical_resources: Vec<String>,
    /// Per-route resource sets used by predictive preloading
    #[serde(default)]
    pub routes: Vec<PreloadRoute>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Interval of the background sync loop once registered
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

// Sections default to their all-defaults shape when absent from the file
macro_rules! section_default {
    ($($ty:ty),+ $(,)?) => {$(
        impl Default for $ty {
            fn default() -> Self {
                toml::from_str("").expect("section defaults are total")
            }
        }
    )+};
}

section_default!(
    GatewayConfig,
    UpstreamConfig,
    CacheConfig,
    RoutingConfig,
    RetryConfig,
    BreakerConfig,
    PatternConfig,
    PreloadConfig,
    SyncConfig,
    WebConfig,
);

// Default value functions
fn default_gw_address() -> String { "0.0.0.0".to_string() }
fn default_gw_port() -> u16 { 8080 }
fn default_upstream_base() -> String { "http://127.0.0.1:3000".to_string() }
fn default_cache_prefix() -> String { "maneki".to_string() }
fn default_cache_version() -> u32 { 1 }
fn default_quota() -> u64 { 256 * 1024 * 1024 }
fn default_store_max_entries() -> usize { 100 }
fn default_store_max_age() -> u64 { 86400 }
fn default_network_timeout() -> u64 { 5 }
fn default_api_prefixes() -> Vec<String> {
    vec!["/api/".to_string()]
}
fn default_static_prefixes() -> Vec<String> {
    vec!["/assets/".to_string(), "/static/".to_string()]
}
fn default_static_extensions() -> Vec<String> {
    ["js", "css", "png", "jpg", "svg", "ico", "woff", "woff2"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_streaming_paths() -> Vec<String> {
    vec!["/api/slack/events".to_string(), "/api/sync/stream".to_string()]
}
fn default_excluded_schemes() -> Vec<String> {
    vec!["chrome-extension".to_string(), "data".to_string(), "blob".to_string()]
}
fn default_offline_page() -> String { "/offline.html".to_string() }
fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_attempt_timeout_ms() -> u64 { 10_000 }
fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_reset_ms() -> u64 { 60_000 }
fn default_max_patterns() -> usize { 500 }
fn default_max_sessions() -> usize { 200 }
fn default_session_timeout() -> u64 { 1800 }
fn default_confidence_threshold() -> f64 { 0.7 }
fn default_critical_visits() -> u64 { 10 }
fn default_route_priority() -> u8 { 2 }
fn default_batch_size() -> usize { 5 }
fn default_idle_batch_size() -> usize { 2 }
fn default_max_preload_age() -> u64 { 300 }
fn default_max_attempts() -> u32 { 3 }
fn default_idle_interval_ms() -> u64 { 2000 }
fn default_ledger_size() -> usize { 200 }
fn default_sync_interval() -> u64 { 300 }
fn default_true() -> bool { true }
fn default_web_address() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8089 }

fn default_stores() -> Vec<StoreConfig> {
    vec![
        StoreConfig {
            name: "static".to_string(),
            strategy: Strategy::CacheFirst,
            max_entries: 100,
            max_age_secs: 7 * 86400,
            network_timeout_secs: 5,
        },
        StoreConfig {
            name: "dynamic".to_string(),
            strategy: Strategy::StaleWhileRevalidate,
            max_entries: 50,
            max_age_secs: 86400,
            network_timeout_secs: 3,
        },
        StoreConfig {
            name: "api".to_string(),
            strategy: Strategy::NetworkFirst,
            max_entries: 100,
            max_age_secs: 3600,
            network_timeout_secs: 3,
        },
        StoreConfig {
            name: "offline".to_string(),
            strategy: Strategy::CacheOnly,
            max_entries: 10,
            max_age_secs: 30 * 86400,
            network_timeout_secs: 5,
        },
    ]
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))?;
        Ok(config)
    }

    /// Load from the given path, falling back to built-in defaults when
    /// the file does not exist. The worker is fully usable without one.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
