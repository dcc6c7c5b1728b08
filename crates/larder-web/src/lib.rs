//! HTTP trigger surface for sync runs.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use larder_core::RunMode;
use larder_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "larder-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
struct SyncQuery {
    #[serde(default)]
    full_sync: bool,
    #[serde(default)]
    retry_rejected: bool,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    data: Option<WebhookData>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookData {
    #[serde(default)]
    id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhook/recipes/sync", post(trigger_sync_handler))
        .route("/sync/last", get(last_run_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "trigger surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Serves the trigger surface, with the cron job running alongside when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(SyncPipeline::from_config(&config)?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    serve(AppState::new(pipeline), config.web_port).await
}

/// Webhook payloads name the page that fired them under `data.id`.
fn triggering_page(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<WebhookBody>(body)
        .ok()?
        .data?
        .id
        .filter(|id| !id.trim().is_empty())
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    body: Bytes,
) -> Response {
    let mode = match RunMode::from_flags(query.full_sync, query.retry_rejected) {
        Ok(mode) => mode,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
                .into_response()
        }
    };
    if let Some(page_id) = triggering_page(&body) {
        info!(page_id = %page_id, "sync triggered by webhook");
    }

    let Some(permit) = state.pipeline.try_acquire() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "busy",
                "message": "a sync run is already in progress",
            })),
        )
            .into_response();
    };

    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(err) = pipeline.run_with(permit, mode).await {
            error!(mode = mode.label(), error = %err, "triggered sync failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "message": format!("{} sync started", mode.label()),
            "config": query,
        })),
    )
        .into_response()
}

async fn last_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.last_run().await {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use larder_adapters::{CatalogPage, CatalogSource, SourceError};
    use larder_core::SourceEntry;
    use larder_notion::{Block, DestinationError, DocumentStore, NewDocument, PropertyUpdate};
    use larder_sync::{CategoryRules, Categorizer, PipelineOptions, Transformer};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct EmptyCatalog;

    #[async_trait]
    impl CatalogSource for EmptyCatalog {
        async fn list(&self, _cursor: Option<&str>) -> Result<CatalogPage, SourceError> {
            Ok(CatalogPage::default())
        }

        async fn detail(&self, id: &str) -> Result<SourceEntry, SourceError> {
            Err(SourceError::HttpStatus {
                status: 404,
                url: format!("/detail/{id}"),
            })
        }

        async fn review_status(&self, _id: &str) -> Result<bool, SourceError> {
            Ok(false)
        }
    }

    struct NullStore;

    #[async_trait]
    impl DocumentStore for NullStore {
        async fn create(&self, _doc: &NewDocument) -> Result<String, DestinationError> {
            Ok("page-1".into())
        }

        async fn update_properties(
            &self,
            _id: &str,
            _update: &PropertyUpdate,
        ) -> Result<(), DestinationError> {
            Ok(())
        }

        async fn append_content(
            &self,
            _id: &str,
            _blocks: &[Block],
        ) -> Result<(), DestinationError> {
            Ok(())
        }

        async fn archive(&self, _id: &str) -> Result<(), DestinationError> {
            Ok(())
        }

        async fn upload_media_from_url(
            &self,
            _url: &str,
            _name: &str,
        ) -> Result<String, DestinationError> {
            Ok("fu-1".into())
        }
    }

    fn state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let rules = CategoryRules::from_yaml_str(include_str!("../../../rules/categories.yaml"))
            .unwrap();
        let pipeline = SyncPipeline::new(
            Arc::new(EmptyCatalog),
            Arc::new(NullStore),
            Transformer::new(Categorizer::new(rules)),
            PipelineOptions::new(dir.path().join("sync_status.json")),
        );
        (dir, AppState::new(Arc::new(pipeline)))
    }

    fn trigger(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let (_dir, state) = state();
        let resp = app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn trigger_starts_run_and_reports_it() {
        let (_dir, state) = state();
        let pipeline = Arc::clone(&state.pipeline);
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(trigger(
                "/webhook/recipes/sync?full_sync=true",
                r#"{"data":{"id":"page-42"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "started");
        assert_eq!(body["config"]["full_sync"], true);
        assert_eq!(body["config"]["retry_rejected"], false);

        let mut finished = None;
        for _ in 0..50 {
            if let Some(stats) = pipeline.last_run().await {
                finished = Some(stats);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stats = finished.expect("triggered run finished");
        assert_eq!(stats.mode, RunMode::Normal { full_sync: true });

        let resp = app
            .oneshot(Request::builder().uri("/sync/last").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["created"], 0);
    }

    #[tokio::test]
    async fn conflicting_flags_are_rejected() {
        let (_dir, state) = state();
        let resp = app(state)
            .oneshot(trigger(
                "/webhook/recipes/sync?full_sync=true&retry_rejected=true",
                "",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trigger_during_run_is_busy() {
        let (_dir, state) = state();
        let _permit = state.pipeline.try_acquire().unwrap();
        let resp = app(state)
            .oneshot(trigger("/webhook/recipes/sync", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["status"], "busy");
    }

    #[tokio::test]
    async fn last_run_is_empty_before_any_run() {
        let (_dir, state) = state();
        let resp = app(state)
            .oneshot(Request::builder().uri("/sync/last").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn webhook_body_page_id_is_optional() {
        assert_eq!(
            triggering_page(br#"{"data":{"id":"abc"}}"#),
            Some("abc".to_string())
        );
        assert_eq!(triggering_page(b"not json"), None);
        assert_eq!(triggering_page(b""), None);
        assert_eq!(triggering_page(br#"{"type":"page.created"}"#), None);
    }
}
