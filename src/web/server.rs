use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::runtime::{WorkerRuntime, VERSION};

/// Control channel + dashboard - 招き猫の操作盤
///
/// Clients drive the worker through POST /api/message with a tagged
/// JSON command; every reply carries a `success` flag. Unknown command
/// types are tolerated (logged, 204) so old workers survive newer
/// clients.
pub struct ControlServer {
    runtime: Arc<WorkerRuntime>,
}

#[derive(Clone)]
struct AppState {
    runtime: Arc<WorkerRuntime>,
}

impl ControlServer {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        if !self.runtime.config.web.enabled {
            info!("Control channel disabled");
            return Ok(());
        }

        let app = router(self.runtime.clone());
        let addr = format!(
            "{}:{}",
            self.runtime.config.web.address, self.runtime.config.web.port
        );
        info!("🎛️ Control channel listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn router(runtime: Arc<WorkerRuntime>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/api/message", post(api_message))
        .route("/api/stats", get(api_stats))
        .route("/api/cache", get(api_cache))
        .route("/api/patterns", get(api_patterns))
        .route("/api/preload", get(api_preload))
        .layer(CorsLayer::permissive())
        .with_state(AppState { runtime })
}

/// Dashboard HTML - embedded single-page app
async fn dashboard() -> Html<String> {
    Html(include_str!("../../static/dashboard.html").to_string())
}

async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.runtime.get_stats())
}

async fn api_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "entries": state.runtime.registry.list_entries(),
        "stats": state.runtime.registry.stats(),
    }))
}

async fn api_patterns(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "summary": state.runtime.tracker.summary(50),
        "stats": state.runtime.tracker.get_stats(),
    }))
}

async fn api_preload(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.runtime.scheduler.get_stats())
}

/// Command endpoint. Handler failures become {success:false, error}
/// rather than HTTP errors; the transport worked, the command did not.
async fn api_message(
    State(state): State<AppState>,
    Json(msg): Json<serde_json::Value>,
) -> Response {
    let msg_type = msg.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match run_command(&state.runtime, msg_type, &msg).await {
        Some(Ok(mut value)) => {
            value["success"] = serde_json::Value::Bool(true);
            Json(value).into_response()
        }
        Some(Err(e)) => Json(serde_json::json!({
            "success": false,
            "error": e.to_string(),
        }))
        .into_response(),
        None => {
            warn!("Unknown message type: {:?}", msg_type);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

/// None = unrecognized command type
async fn run_command(
    runtime: &Arc<WorkerRuntime>,
    msg_type: &str,
    msg: &serde_json::Value,
) -> Option<anyhow::Result<serde_json::Value>> {
    let path_arg = || msg.get("path").and_then(|v| v.as_str());

    let result = match msg_type {
        "GET_VERSION" => Ok(serde_json::json!({ "version": VERSION })),
        "CLEAR_CACHE" => {
            let name = msg.get("cacheName").and_then(|v| v.as_str());
            runtime
                .registry
                .clear(name)
                .map(|_| serde_json::json!({ "cleared": name.unwrap_or("all") }))
        }
        "GET_CACHE_STATS" => Ok(serde_json::json!({ "stats": runtime.registry.stats() })),
        "GET_STORAGE_INFO" => Ok(serde_json::json!({ "info": runtime.registry.storage_info() })),
        "REGISTER_BACKGROUND_SYNC" => {
            runtime.register_sync();
            Ok(serde_json::json!({ "registered": true }))
        }
        "PRELOAD_CRITICAL_DATA" => {
            runtime.scheduler.preload_critical().await;
            Ok(serde_json::json!({ "scheduled": true }))
        }
        // Both spellings are in the wild
        "GET_PRELOAD_STATS" | "GET_PRELOADER_STATS" => {
            Ok(serde_json::json!({ "stats": runtime.scheduler.get_stats() }))
        }
        "CLEAR_NAVIGATION_PATTERNS" => {
            runtime.tracker.clear();
            Ok(serde_json::json!({ "cleared": true }))
        }
        "CLEAR_PRELOAD_QUEUE" => {
            runtime.scheduler.clear_queue();
            Ok(serde_json::json!({ "cleared": true }))
        }
        "TRACK_NAVIGATION" => match path_arg() {
            Some(path) => {
                let session = msg.get("sessionId").and_then(|v| v.as_str());
                runtime.tracker.track_navigation(path, session);
                Ok(serde_json::json!({ "tracked": path }))
            }
            None => Err(anyhow::anyhow!("Path required")),
        },
        "GET_NAVIGATION_PATTERNS" => {
            let limit = msg.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
            Ok(serde_json::json!({ "patterns": runtime.tracker.summary(limit) }))
        }
        "PRELOAD_FOR_PATH" => match path_arg() {
            Some(path) => {
                runtime.scheduler.preload_for_path(path).await;
                Ok(serde_json::json!({ "scheduled": path }))
            }
            None => Err(anyhow::anyhow!("Path required")),
        },
        "FORCE_PRELOAD" => match msg.get("urls").and_then(|v| v.as_array()) {
            Some(array) => {
                let urls: Vec<String> = array
                    .iter()
                    .filter_map(|u| u.as_str().map(|s| s.to_string()))
                    .collect();
                runtime.scheduler.force_preload(&urls).await;
                Ok(serde_json::json!({ "scheduled": urls.len() }))
            }
            None => Err(anyhow::anyhow!("URLs required")),
        },
        _ => return None,
    };
    Some(result)
}
