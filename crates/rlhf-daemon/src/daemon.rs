//! RLHF daemon: HTTP surface over the feedback pipeline

use std::time::Instant;

use anyhow::Result;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use rlhf_core::RlhfError;
use rlhf_train::{FeedbackAck, FeedbackSubmission, RlhfService, TrainingResult, TriggerSource};

use crate::config::Config;
use crate::metrics;
use crate::validation::{FeedbackRequest, PredictionRequest, ValidatedJson, ValidationError, DEFAULT_BODY_LIMIT};

/// Shared daemon state for API handlers
#[derive(Clone)]
pub struct DaemonState {
    pub service: RlhfService,
}

/// Main RLHF daemon
pub struct RlhfDaemon {
    config: Config,
    state: DaemonState,
    shutdown: tokio::sync::broadcast::Sender<()>,
}

impl RlhfDaemon {
    /// Build the pipeline service and optionally restore the newest checkpoint
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let service = RlhfService::builder(config.rlhf())
            .build(config.model.input_dim, config.model.action_space)?;

        if config.daemon.restore_checkpoint && config.checkpoint.enabled {
            match service.restore_latest().await {
                Ok(true) => info!("Restored policy from latest checkpoint"),
                Ok(false) => info!("No checkpoint found, starting from a fresh policy"),
                Err(e) => warn!("Failed to restore checkpoint, starting fresh: {}", e),
            }
        }

        tokio::spawn(metrics::record_events(service.subscribe()));

        Ok(Self {
            config,
            state: DaemonState { service },
            shutdown: shutdown_tx,
        })
    }

    /// Run the daemon main loop
    pub async fn run(&self) -> Result<()> {
        info!("RLHF Daemon running on {}", self.config.daemon.bind_address);

        self.state.service.start().await;

        let addr: std::net::SocketAddr = self.config.daemon.bind_address.parse()?;
        let app = create_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let mut shutdown_rx = self.shutdown.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down daemon...");

        let _ = self.shutdown.send(());

        // Lets a training cycle in flight finish
        self.state.service.stop().await;

        info!("Daemon shutdown complete");
        Ok(())
    }
}

/// Create the API router with state
fn create_router(state: DaemonState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/feedback", post(submit_feedback))
        .route("/api/v1/predictions", post(register_prediction))
        .route("/api/v1/training/trigger", post(trigger_training))
        .route_layer(middleware::from_fn(track_http))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(DEFAULT_BODY_LIMIT)),
        )
        .with_state(state)
}

/// Record request count and latency per matched route
async fn track_http(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |p| p.as_str().to_string());

    let response = next.run(request).await;

    metrics::record_http_request(
        &endpoint,
        &method,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Pipeline errors that are not the caller's fault
struct InternalError(RlhfError);

impl IntoResponse for InternalError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self.0);
        let body = serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
            "error_type": "internal_error"
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

fn error_response(e: RlhfError) -> Response {
    match e {
        RlhfError::InvalidFeedback(_) => ValidationError::from(e).into_response(),
        other => InternalError(other).into_response(),
    }
}

// API handlers

async fn health_check() -> &'static str {
    "OK"
}

async fn get_metrics(State(state): State<DaemonState>) -> impl IntoResponse {
    let stats = state.service.stats().await;
    metrics::set_pipeline_sizes(stats.feedback.count, stats.buffer_len);

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

async fn get_status(State(state): State<DaemonState>) -> Json<serde_json::Value> {
    let stats = state.service.stats().await;

    Json(serde_json::json!({
        "status": if stats.running { "running" } else { "stopped" },
        "version": env!("CARGO_PKG_VERSION"),
        "pipeline": stats,
    }))
}

async fn submit_feedback(
    State(state): State<DaemonState>,
    ValidatedJson(request): ValidatedJson<FeedbackRequest>,
) -> Result<Json<FeedbackAck>, Response> {
    let submission = FeedbackSubmission::try_from(request).map_err(error_response)?;
    let ack = state
        .service
        .submit_feedback(submission)
        .await
        .map_err(error_response)?;
    Ok(Json(ack))
}

async fn register_prediction(
    State(state): State<DaemonState>,
    ValidatedJson(request): ValidatedJson<PredictionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), Response> {
    let (prediction_id, context) = request.into_parts();
    state
        .service
        .register_prediction(prediction_id.clone(), context)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "success": true,
            "prediction_id": prediction_id,
        })),
    ))
}

async fn trigger_training(State(state): State<DaemonState>) -> Json<TrainingResult> {
    Json(state.service.trigger_training(TriggerSource::Manual).await)
}
