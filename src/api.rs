//! REST endpoints over the marketplace facade.

use std::str::FromStr;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;
use uuid::Uuid;

use crate::error::{DatabaseError, Error, JobError, LedgerError, RegistryError, SubmitError};
use crate::market::{JobStatus, Marketplace, SubmitRequest};
use crate::registry::ProviderRegistration;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub market: Marketplace,
}

/// Build the Axum router with the marketplace REST routes.
pub fn api_routes(market: Marketplace) -> Router {
    let state = ApiState { market };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/providers", get(list_providers).post(register_provider))
        .route("/providers/{id}", get(get_provider))
        .route("/scoreboard", get(scoreboard))
        .route("/marketplace/status", get(marketplace_status))
        .route("/ledger/{identity}", get(ledger_statement))
        .layer(cors)
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// An error rendered as `{"error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({"error": self.message}))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        Self::internal(err)
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Database(e) => Self::internal(e),
            SubmitError::MarketplaceDisabled => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Database(e) => Self::internal(e),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Database(e) => Self::internal(e),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Job(JobError::NotFound { id }) => {
                Self::new(StatusCode::NOT_FOUND, format!("Job {id} not found"))
            }
            Error::Job(e @ JobError::InvalidTransition { .. }) => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            Error::Database(e) => e.into(),
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tundra",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.market.submit(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Some(JobStatus::from_str(s).map_err(ApiError::bad_request)?),
        _ => None,
    };
    let page = state.market.list(status, query.limit, query.offset).await?;
    Ok(Json(page))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = Uuid::parse_str(&id).map_err(|_| ApiError::bad_request("Invalid job ID"))?;
    let job = state.market.get(job_id).await?;
    Ok(Json(job))
}

async fn list_providers(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.market.providers().await?))
}

async fn get_provider(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.market.provider(&id).await? {
        Some(provider) => Ok(Json(provider)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Provider {id} not found"),
        )),
    }
}

async fn register_provider(
    State(state): State<ApiState>,
    Json(registration): Json<ProviderRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = state.market.register_provider(registration).await?;
    Ok(Json(provider))
}

async fn scoreboard(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.market.scoreboard().await?))
}

async fn marketplace_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.market.marketplace_status().await)
}

async fn ledger_statement(
    State(state): State<ApiState>,
    Path(identity): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.market.ledger().statement(&identity).await?))
}
