//! 内置路由：健康检查、实例信息与指标

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::bootstrap::BootstrapState;
use crate::metrics::BootstrapMetrics;

/// 路由共享状态
#[derive(Clone)]
pub struct HttpState {
    pub service_name: String,
    pub instance_id: String,
    pub version: String,
    pub state: watch::Receiver<BootstrapState>,
    pub metrics: Arc<BootstrapMetrics>,
}

#[derive(Debug, Serialize)]
struct HealthBody<'a> {
    status: &'static str,
    service: &'a str,
    instance_id: &'a str,
}

#[derive(Debug, Serialize)]
struct InfoBody<'a> {
    service: &'a str,
    version: &'a str,
    instance_id: &'a str,
    state: BootstrapState,
}

/// 构建路由
///
/// `extra` 中的路由与内置路由合并，路径冲突时 axum 会 panic，调用方需避免
pub fn build_router(state: HttpState, health_check_path: &str, extra: Router) -> Router {
    Router::new()
        .route(health_check_path, get(health))
        .route("/actuator/info", get(info))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(extra)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<HttpState>) -> Response {
    let current = *state.state.borrow();
    let code = if current == BootstrapState::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthBody {
        status: current.health_status(),
        service: &state.service_name,
        instance_id: &state.instance_id,
    };
    (code, Json(body)).into_response()
}

async fn info(State(state): State<HttpState>) -> Response {
    let current = *state.state.borrow();
    Json(InfoBody {
        service: &state.service_name,
        version: &state.version,
        instance_id: &state.instance_id,
        state: current,
    })
    .into_response()
}

async fn metrics(State(state): State<HttpState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve(state: HttpState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state, "/actuator/health", Router::new());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn http_state(rx: watch::Receiver<BootstrapState>) -> HttpState {
        HttpState {
            service_name: "docgen-service".to_string(),
            instance_id: "docgen-service-1".to_string(),
            version: "0.1.0".to_string(),
            state: rx,
            metrics: Arc::new(BootstrapMetrics::new("docgen-service").unwrap()),
        }
    }

    #[tokio::test]
    async fn test_health_follows_state() -> Result<(), Box<dyn std::error::Error>> {
        let (tx, rx) = watch::channel(BootstrapState::Registering);
        let base = serve(http_state(rx)).await;
        let url = format!("{base}/actuator/health");

        let response = reqwest::get(&url).await?;
        assert_eq!(response.status(), 503);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["status"], "STARTING");
        assert_eq!(body["service"], "docgen-service");

        tx.send_replace(BootstrapState::Serving);
        let response = reqwest::get(&url).await?;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["status"], "UP");
        assert_eq!(body["instance_id"], "docgen-service-1");

        tx.send_replace(BootstrapState::ShuttingDown);
        let response = reqwest::get(&url).await?;
        assert_eq!(response.status(), 503);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["status"], "DOWN");

        Ok(())
    }

    #[tokio::test]
    async fn test_info_and_metrics() -> Result<(), Box<dyn std::error::Error>> {
        let (_tx, rx) = watch::channel(BootstrapState::Serving);
        let base = serve(http_state(rx)).await;

        let info: serde_json::Value = reqwest::get(format!("{base}/actuator/info"))
            .await?
            .json()
            .await?;
        assert_eq!(info["version"], "0.1.0");
        assert_eq!(info["state"], "SERVING");

        let text = reqwest::get(format!("{base}/metrics")).await?.text().await?;
        assert!(text.contains("dalvis_bootstrap_state"));

        Ok(())
    }

    #[tokio::test]
    async fn test_custom_health_path() -> Result<(), Box<dyn std::error::Error>> {
        let (_tx, rx) = watch::channel(BootstrapState::Serving);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = build_router(
            http_state(rx),
            "/healthz",
            Router::new().route("/ping", get(|| async { "pong" })),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        assert_eq!(reqwest::get(format!("http://{addr}/healthz")).await?.status(), 200);
        assert_eq!(reqwest::get(format!("http://{addr}/ping")).await?.text().await?, "pong");
        assert_eq!(
            reqwest::get(format!("http://{addr}/actuator/health")).await?.status(),
            404
        );
        Ok(())
    }
}
