//! HTTP server for document ingestion and question answering.
//!
//! The content-generation service pushes documents here; dashboards ask
//! questions scoped to one organization.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use vassago_core::{DocumentId, Error, OrganizationId, Result};
use vassago_knowledge::{
    Answer, Deadline, DocumentState, IngestionPipeline, IngestionReport, RagPipeline, VectorStore,
};
use vassago_telemetry::PipelineMetrics;

use crate::api::{
    AnswerRequest, ApiError, DeleteResponse, ErrorResponse, IngestRequest, ServerStatus,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Enable CORS.
    pub cors: bool,
    /// Deadline applied to each ingestion and answer request.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cors: true,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Creates a new server config builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    addr: Option<SocketAddr>,
    cors: Option<bool>,
    request_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    /// Sets the listen address.
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Sets whether CORS is enabled.
    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors = Some(enabled);
        self
    }

    /// Sets the per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds the server config.
    pub fn build(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            addr: self.addr.unwrap_or(defaults.addr),
            cors: self.cors.unwrap_or(defaults.cors),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
        }
    }
}

/// Shared application state.
pub struct AppState {
    /// Ingestion pipeline.
    pub ingestion: Arc<IngestionPipeline>,
    /// Retrieval and answer pipeline.
    pub rag: Arc<RagPipeline>,
    /// Pipeline counters, shared with both pipelines.
    pub metrics: Arc<PipelineMetrics>,
    /// Server configuration.
    pub config: ServerConfig,
    /// Server start time.
    pub start_time: Instant,
}

impl AppState {
    /// Creates app state around already-built pipelines.
    pub fn new(
        config: ServerConfig,
        ingestion: Arc<IngestionPipeline>,
        rag: Arc<RagPipeline>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            ingestion,
            rag,
            metrics,
            config,
            start_time: Instant::now(),
        }
    }

    fn store(&self) -> &Arc<dyn VectorStore> {
        self.ingestion.store()
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.request_timeout)
    }
}

/// The HTTP server.
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Server {
    /// Creates a new server.
    pub fn new(state: AppState) -> Self {
        Self {
            config: state.config.clone(),
            state: Arc::new(state),
        }
    }

    /// Creates the router.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            // Health endpoints
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/api/status", get(server_status))
            // Knowledge endpoints
            .route("/v1/documents", post(ingest_document))
            .route(
                "/v1/organizations/:organization/documents/:document",
                delete(delete_document),
            )
            .route("/v1/answer", post(answer))
            .with_state(self.state.clone());

        router = router.layer(TraceLayer::new_for_http());

        if self.config.cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Runs the server until Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already-bound listener until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve<F>(self, listener: tokio::net::TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Starting Vassago server");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down gracefully"),
    }
}

// === Health Endpoints ===

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    match state.store().count().await {
        Ok(_) => (StatusCode::OK, "Ready").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            let body = ErrorResponse::new(e.to_string(), "upstream_unavailable").with_code(e.kind());
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn server_status(State(state): State<Arc<AppState>>) -> Json<ServerStatus> {
    let records = state.store().count().await.ok();

    Json(ServerStatus {
        status: "running".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        records,
        embedding_model: state.ingestion.embedder().model_name().to_string(),
        metrics: state.metrics.snapshot(),
    })
}

// === Knowledge Endpoints ===

async fn ingest_document(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> (StatusCode, Json<IngestionReport>) {
    let document = req.into_document();
    tracing::debug!(document = %document.id, organization = %document.organization(), "Ingest request");

    let report = state
        .ingestion
        .ingest_with_deadline(&document, state.deadline())
        .await;

    let status = match report.state {
        DocumentState::Complete => StatusCode::OK,
        DocumentState::PartiallyFailed { .. } => StatusCode::MULTI_STATUS,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(report))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path((organization, document)): Path<(String, String)>,
) -> std::result::Result<Json<DeleteResponse>, ApiError> {
    let deleted = state
        .ingestion
        .delete_document(&DocumentId::new(document), &OrganizationId::new(organization))
        .await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn answer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnswerRequest>,
) -> std::result::Result<Json<Answer>, ApiError> {
    let request_id = Uuid::new_v4();
    if req.query.trim().is_empty() {
        return Err(Error::invalid_config("query must not be empty").into());
    }

    tracing::debug!(request_id = %request_id, organization = %req.organization, "Answer request");
    let started = Instant::now();

    let answer = state
        .rag
        .answer_with_deadline(
            &req.query,
            &OrganizationId::new(req.organization),
            req.top_k,
            state.deadline(),
        )
        .await?;

    tracing::debug!(
        request_id = %request_id,
        sources = answer.sources.len(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Answer finished"
    );
    Ok(Json(answer))
}
