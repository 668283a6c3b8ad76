//! HTTP gateway for question answering.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service banner |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/query` | Answer a question from the knowledge base |
//!
//! # Error Contract
//!
//! Error responses carry a machine-readable code and message:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! | Status | Code | When |
//! |--------|------|------|
//! | 400 | `bad_request` | blank query or malformed body |
//! | 503 | `unavailable` | the vector store cannot be read |
//! | 500 | `internal` | any other pipeline failure |
//!
//! 503 and 500 bodies also carry an apology `answer` so chat clients can
//! show something. Internal error text is logged, never returned.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use knowledge_rag_core::error::RagError;

use crate::query::{QueryEngine, QueryRequest, QueryResponse};

const UNAVAILABLE_ANSWER: &str =
    "Sorry, the knowledge base is temporarily unavailable. Please try again later.";
const INTERNAL_ANSWER: &str =
    "Sorry, something went wrong while answering your question. Please try again later.";

#[derive(Clone)]
struct AppState {
    engine: Arc<QueryEngine>,
}

/// Build the application router. Exposed for tests and embedding.
pub fn router(engine: Arc<QueryEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/query", post(handle_query))
        .layer(cors)
        .with_state(AppState { engine })
}

/// Serve on `bind` until Ctrl-C.
pub async fn run_server(bind: &str, engine: Arc<QueryEngine>) -> anyhow::Result<()> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "server listening");
    println!("Knowledge base API listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<&'static str>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    answer: Option<&'static str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            answer: self.answer,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
        answer: None,
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::Retrieval(_) => {
                tracing::error!(error = %err, "retrieval failed");
                AppError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: "unavailable",
                    message: "knowledge base temporarily unavailable".into(),
                    answer: Some(UNAVAILABLE_ANSWER),
                }
            }
            other => {
                tracing::error!(error = %other, "query failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: "internal error".into(),
                    answer: Some(INTERNAL_ANSWER),
                }
            }
        }
    }
}

// ============ GET / and /health ============

#[derive(Serialize)]
struct RootResponse {
    message: &'static str,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Knowledge Base Q&A API",
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/query ============

async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    tracing::info!(
        query_chars = request.query.chars().count(),
        top_k = request.top_k,
        model = request.model.as_deref().unwrap_or(state.engine.default_model()),
        "query received"
    );
    let response = state.engine.answer(&request).await?;
    Ok(Json(response))
}
