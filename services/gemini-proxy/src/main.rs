//! Gemini Rotation Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads API keys and the model ladder
//! 2. Listens for OpenAI-compatible requests
//! 3. Picks a working key and model per attempt, rotating on failure
//! 4. Proxies to the Gemini OpenAI-compatible endpoint

mod config;
mod metrics;
mod notifier;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_rotation::{LogNotifier, Manager, Notifier};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, NotifyConfig};
use crate::notifier::PushoverNotifier;
use crate::proxy::ProxyState;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/usage", get(usage_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Pushover when configured with both token and user, logs otherwise.
/// Returns the channel name alongside the notifier.
fn build_notifier(
    client: &reqwest::Client,
    notify: Option<NotifyConfig>,
) -> (&'static str, Arc<dyn Notifier>) {
    let Some(notify) = notify else {
        return ("log", Arc::new(LogNotifier));
    };
    match (notify.token, notify.user) {
        (Some(token), Some(user)) => (
            "pushover",
            Arc::new(PushoverNotifier::new(
                client.clone(),
                notify.api_url,
                notify.title_prefix,
                token,
                user,
            )),
        ),
        _ => {
            warn!("[notify] configured but PUSHOVER_TOKEN or PUSHOVER_USER unset, logging only");
            ("log", Arc::new(LogNotifier))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-rotation-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    for credential in &config.credentials {
        info!(
            credential = credential.label(),
            key = %credential.hint(),
            "credential loaded"
        );
    }
    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        credentials = config.credentials.len(),
        models = ?config.rotation.models,
        "configuration loaded"
    );

    let client = reqwest::Client::new();
    let (channel, notifier) = build_notifier(&client, config.notify);
    info!(channel, "notifications configured");
    let manager = Manager::new(config.credentials, config.rotation.models)
        .context("failed to build rotation manager")?
        .with_notifier(notifier);

    let app_state = AppState {
        proxy: ProxyState {
            client,
            upstream_url: config.proxy.upstream_url,
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            request_deadline: Duration::from_secs(config.proxy.request_deadline_secs),
            manager: Arc::new(manager),
        },
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Manager health plus process uptime. 503 once every combination is
/// exhausted.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.proxy.manager.health();
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();

    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Per-credential, per-model usage snapshot.
async fn usage_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.proxy.manager.usage_stats())
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies everything else upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let method = proxy::method_label(request.method());
    let started = Instant::now();

    let response = proxy::proxy_request(&state.proxy, request, request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use key_rotation::Credential;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn test_manager(keys: &[&str], models: &[&str]) -> Arc<Manager> {
        let credentials = keys
            .iter()
            .enumerate()
            .map(|(i, key)| Credential::new(format!("key-{}", i + 1), *key))
            .collect();
        let models = models.iter().map(|m| m.to_string()).collect();
        Arc::new(Manager::new(credentials, models).unwrap())
    }

    fn test_app_state(upstream_url: &str, manager: Arc<Manager>) -> AppState {
        AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                upstream_url: upstream_url.to_string(),
                timeout: Duration::from_secs(5),
                request_deadline: Duration::from_secs(30),
                manager,
            },
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        }
    }

    /// What the mock upstream saw for each attempt.
    #[derive(Debug, Clone)]
    struct Seen {
        authorization: String,
        model: String,
        path: String,
    }

    /// Mock Gemini endpoint. `respond` maps (bearer key, model) to a status
    /// and body; every request is recorded.
    async fn start_mock_upstream<F>(respond: F) -> (String, Arc<Mutex<Vec<Seen>>>)
    where
        F: Fn(&str, &str) -> (StatusCode, String) + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        let app = axum::Router::new().fallback(move |request: Request<Body>| {
            let respond = respond.clone();
            let recorded = recorded.clone();
            async move {
                let authorization = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let path = request.uri().path().to_string();
                let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                    .await
                    .unwrap();
                let model = serde_json::from_slice::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v["model"].as_str().map(str::to_string))
                    .unwrap_or_default();
                let key = authorization.trim_start_matches("Bearer ").to_string();
                recorded.lock().unwrap().push(Seen {
                    authorization,
                    model: model.clone(),
                    path,
                });
                let (status, body) = respond(&key, &model);
                (status, [("content-type", "application/json")], body)
            }
        });
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{addr}"), seen)
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .header("content-type", "application/json")
            .header("authorization", "Bearer caller-token")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    const CHAT: &str = r#"{"model":"anything","messages":[{"role":"user","content":"hi"}]}"#;

    #[tokio::test]
    async fn forwards_with_selected_key_and_model() {
        let (url, seen) =
            start_mock_upstream(|_, _| (StatusCode::OK, r#"{"choices":[]}"#.into())).await;
        let manager = test_manager(&["AIza-one", "AIza-two"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state(&url, manager.clone()), 1000);

        let response = app.oneshot(chat_request(CHAT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["choices"], serde_json::json!([]));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].authorization, "Bearer AIza-one");
        assert_eq!(seen[0].model, "gemini-2.5-flash");
        assert_eq!(seen[0].path, "/v1/chat/completions");
        assert_eq!(manager.usage_stats().credentials[0].total_requests, 1);
    }

    #[tokio::test]
    async fn quota_error_rotates_to_next_key() {
        let (url, seen) = start_mock_upstream(|key, _| {
            if key == "AIza-one" {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#.into(),
                )
            } else {
                (StatusCode::OK, r#"{"ok":true}"#.into())
            }
        })
        .await;
        let manager = test_manager(&["AIza-one", "AIza-two"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state(&url, manager.clone()), 1000);

        let response = app.oneshot(chat_request(CHAT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let auths: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.authorization.clone())
            .collect();
        assert_eq!(auths, vec!["Bearer AIza-one", "Bearer AIza-two"]);
        assert_eq!(manager.health()["combinations_exhausted"], 1);
    }

    #[tokio::test]
    async fn exhausted_keys_downgrade_model() {
        let (url, seen) = start_mock_upstream(|_, model| {
            if model == "gemini-2.5-flash" {
                (StatusCode::TOO_MANY_REQUESTS, "quota exceeded".into())
            } else {
                (StatusCode::OK, "{}".into())
            }
        })
        .await;
        let manager = test_manager(
            &["AIza-one", "AIza-two"],
            &["gemini-2.5-flash", "gemini-2.0-flash"],
        );
        let app = build_router(test_app_state(&url, manager), 1000);

        let response = app.oneshot(chat_request(CHAT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let models: Vec<_> = seen.lock().unwrap().iter().map(|s| s.model.clone()).collect();
        assert_eq!(
            models,
            vec!["gemini-2.5-flash", "gemini-2.5-flash", "gemini-2.0-flash"]
        );
    }

    #[tokio::test]
    async fn client_error_is_passed_through_without_rotating_or_counting() {
        let (url, seen) = start_mock_upstream(|_, _| {
            (
                StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"bad messages","status":"INVALID_ARGUMENT"}}"#.into(),
            )
        })
        .await;
        let manager = test_manager(&["AIza-one", "AIza-two"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state(&url, manager.clone()), 1000);

        for _ in 0..2 {
            let response = app.clone().oneshot(chat_request(CHAT)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let auths: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.authorization.clone())
            .collect();
        assert_eq!(auths, vec!["Bearer AIza-one", "Bearer AIza-one"]);
        assert_eq!(manager.health()["combinations_exhausted"], 0);

        let usage = app
            .oneshot(Request::builder().uri("/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let usage = json_body(usage).await;
        assert_eq!(usage["credentials"][0]["total_requests"], 0);
        assert_eq!(usage["credentials"][1]["total_requests"], 0);
    }

    #[tokio::test]
    async fn invalid_key_rotates_to_working_key() {
        let (url, seen) = start_mock_upstream(|key, _| {
            if key == "AIza-revoked" {
                (
                    StatusCode::BAD_REQUEST,
                    r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#.into(),
                )
            } else {
                (StatusCode::OK, r#"{"choices":[]}"#.into())
            }
        })
        .await;
        let manager = test_manager(&["AIza-revoked", "AIza-good"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state(&url, manager.clone()), 1000);

        for _ in 0..2 {
            let response = app.clone().oneshot(chat_request(CHAT)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let auths: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.authorization.clone())
            .collect();
        assert_eq!(
            auths,
            vec!["Bearer AIza-revoked", "Bearer AIza-good", "Bearer AIza-good"]
        );
        assert!(manager.is_exhausted(key_rotation::Combination::new(0, 0)));
        assert_eq!(manager.usage_stats().credentials[1].total_requests, 2);
    }

    #[tokio::test]
    async fn unknown_model_downgrades_to_next_model() {
        let (url, seen) = start_mock_upstream(|_, model| {
            if model == "gemini-retired" {
                (
                    StatusCode::NOT_FOUND,
                    r#"{"error":{"code":404,"status":"NOT_FOUND"}}"#.into(),
                )
            } else {
                (StatusCode::OK, r#"{"choices":[]}"#.into())
            }
        })
        .await;
        let manager = test_manager(&["AIza-one"], &["gemini-retired", "gemini-2.0-flash"]);
        let app = build_router(test_app_state(&url, manager.clone()), 1000);

        let response = app.oneshot(chat_request(CHAT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let models: Vec<_> = seen.lock().unwrap().iter().map(|s| s.model.clone()).collect();
        assert_eq!(models, vec!["gemini-retired", "gemini-2.0-flash"]);
        assert_eq!(manager.health()["current"]["model"], "gemini-2.0-flash");
    }

    #[tokio::test]
    async fn deadline_while_backing_off_returns_503() {
        let (url, seen) =
            start_mock_upstream(|_, _| (StatusCode::INTERNAL_SERVER_ERROR, "boom".into())).await;
        // One combination: the first failure exhausts it and arms a 60s
        // backoff, which outlasts the deadline.
        let manager = test_manager(&["AIza-one"], &["gemini-2.5-flash"]);
        let mut state = test_app_state(&url, manager);
        state.proxy.request_deadline = Duration::from_millis(300);
        let app = build_router(state, 1000);

        let response = app.oneshot(chat_request(CHAT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("retry-after"));
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "rotation_backoff");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_json_body_rejected_with_400() {
        let manager = test_manager(&["AIza-one"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state("http://127.0.0.1:1", manager), 1000);

        let response = app.oneshot(chat_request("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["type"], "invalid_request");

        let manager = test_manager(&["AIza-one"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state("http://127.0.0.1:1", manager), 1000);
        let response = app.oneshot(chat_request("[1, 2]")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_body_forwarded_with_rotated_key() {
        let (url, seen) =
            start_mock_upstream(|_, _| (StatusCode::OK, r#"{"data":[]}"#.into())).await;
        let manager = test_manager(&["AIza-one"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state(&url, manager), 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].path, "/v1/models");
        assert_eq!(seen[0].authorization, "Bearer AIza-one");
        assert_eq!(seen[0].model, "");
    }

    #[tokio::test]
    async fn health_reports_pool_state_and_uptime() {
        let manager = test_manager(&["AIza-one", "AIza-two"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state("http://unused", manager.clone()), 1000);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["combinations_total"], 2);
        assert!(json["uptime_seconds"].is_u64());

        manager.report_quota_failure(manager.current_combination().combination);
        manager.report_quota_failure(manager.current_combination().combination);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn usage_endpoint_returns_snapshot_without_keys() {
        let manager = test_manager(&["AIza-secret-one"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state("http://unused", manager), 1000);

        let response = app
            .oneshot(Request::builder().uri("/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("gemini-2.5-flash"));
        assert!(text.contains("key-1"));
        assert!(!text.contains("AIza-secret-one"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let manager = test_manager(&["AIza-one"], &["gemini-2.5-flash"]);
        let app = build_router(test_app_state("http://unused", manager), 1000);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[test]
    fn notifier_falls_back_to_logs_without_pushover_credentials() {
        let notify = |user: Option<&str>| NotifyConfig {
            api_url: "https://api.pushover.net/1/messages.json".into(),
            title_prefix: "Gemini Proxy".into(),
            token: Some(common::Secret::new("po-token".to_string())),
            user: user.map(|u| common::Secret::new(u.to_string())),
        };
        let client = reqwest::Client::new();

        assert_eq!(build_notifier(&client, None).0, "log");
        assert_eq!(build_notifier(&client, Some(notify(None))).0, "log");
        assert_eq!(
            build_notifier(&client, Some(notify(Some("po-user")))).0,
            "pushover"
        );
    }
}
