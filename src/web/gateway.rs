use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tracing::{debug, info, warn};

use crate::dispatch::Decision;
use crate::runtime::WorkerRuntime;
use crate::store::CachedResponse;

/// Caching gateway - リクエストの関所
///
/// Sits in front of the upstream app. Intercepted GETs flow through the
/// store strategies; everything else is forwarded untouched with a
/// streaming body so long-lived connections (SSE) survive the hop.
pub struct GatewayServer {
    runtime: Arc<WorkerRuntime>,
    client: reqwest::Client,
}

#[derive(Clone)]
struct GatewayState {
    runtime: Arc<WorkerRuntime>,
    client: reqwest::Client,
    base_url: String,
}

/// Not forwarded in either direction
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::HOST,
    header::CONTENT_LENGTH,
];

impl GatewayServer {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self {
            runtime,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let state = GatewayState {
            runtime: self.runtime.clone(),
            client: self.client.clone(),
            base_url: self
                .runtime
                .config
                .upstream
                .base_url
                .trim_end_matches('/')
                .to_string(),
        };
        let app = router(state);

        let addr = format!(
            "{}:{}",
            self.runtime.config.gateway.address, self.runtime.config.gateway.port
        );
        info!("🐾 Gateway listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn router(state: GatewayState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<GatewayState>, req: Request) -> Response {
    let method = req.method().as_str().to_string();
    let path_q = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match state
        .runtime
        .dispatcher
        .classify(&method, &path_q, accept.as_deref())
    {
        Decision::Intercept { store } => {
            debug!("Intercepting {} {} -> {}", method, path_q, store);
            let navigation = accept
                .as_deref()
                .map(|a| a.contains("text/html"))
                .unwrap_or(false);

            if navigation {
                let session = req
                    .headers()
                    .get("x-session-id")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let runtime = state.runtime.clone();
                let path = path_q.clone();
                // Pattern learning and predictive preloading never
                // delay the response
                tokio::spawn(async move {
                    runtime.on_navigation(&path, session.as_deref()).await;
                });
            }

            let cached = state.runtime.dispatcher.dispatch(&path_q, navigation).await;
            to_response(cached)
        }
        Decision::Passthrough { reason } => {
            debug!("Passing through {} {} ({})", method, path_q, reason);
            forward(&state, req, &path_q).await
        }
    }
}

/// Materialize a cache-layer response for the wire
fn to_response(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &cached.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Untouched forward to the upstream, streaming both bodies
async fn forward(state: &GatewayState, req: Request, path_q: &str) -> Response {
    let url = format!("{}{}", state.base_url, path_q);
    let method = req.method().clone();

    let mut upstream = state.client.request(method, &url);
    for (name, value) in req.headers() {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        upstream = upstream.header(name, value);
    }
    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

    match upstream.body(body).send().await {
        Ok(resp) => {
            let mut builder = Response::builder().status(resp.status());
            for (name, value) in resp.headers() {
                if HOP_BY_HOP.contains(name) {
                    continue;
                }
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from_stream(resp.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => {
            warn!("Passthrough to {} failed: {}", url, e);
            (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response()
        }
    }
}
