pub mod config;
pub mod types;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use credits_common::{
    ConsumeCreditsRequest, ConsumeResponse, GetUsageRequest, LedgerRequest, LedgerResponse, Plan,
    ResetJob, ResetSummary, UpgradePlanRequest, UpgradePlanResponse, UsageSnapshot,
};
use credits_ledger::{CreditsLedger, LedgerError, PaymentRecord};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, instrument, warn};

use types::{ErrorBody, HealthResponse};

const RETRY_LATER: &str = "credits service temporarily unavailable, please retry later";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<CreditsLedger>,
    admin_api_key: Arc<str>,
}

impl AppState {
    pub fn new(ledger: Arc<CreditsLedger>, admin_api_key: impl Into<Arc<str>>) -> Self {
        Self {
            ledger,
            admin_api_key: admin_api_key.into(),
        }
    }
}

/// API error response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                code: code.to_string(),
            },
        }
    }

    fn unauthorized(error: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
            }
            e if e.is_transient() => {
                error!("ledger operation failed: {}", e);
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE", RETRY_LATER)
            }
            e => {
                error!("ledger operation failed: {}", e);
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error",
                )
            }
        }
    }
}

// Malformed or incomplete bodies are validation failures
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", rejection.body_text())
    }
}

fn consume_rejection(rejection: JsonRejection) -> (StatusCode, ConsumeResponse) {
    (
        StatusCode::BAD_REQUEST,
        ConsumeResponse::error(rejection.body_text()),
    )
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Client-facing metering
        .route("/api/v1/usage", post(get_usage_handler))
        .route("/api/v1/accounts/:id/usage", get(account_usage_handler))
        .route("/api/v1/credits/consume", post(consume_handler))

        // Payment callback and audit
        .route("/api/v1/plans/upgrade", post(upgrade_handler))
        .route("/api/v1/accounts/:id/payments", get(payments_handler))

        // Scheduled maintenance
        .route("/api/v1/maintenance/reset-daily", post(reset_daily_handler))
        .route("/api/v1/maintenance/reset-monthly", post(reset_monthly_handler))

        // Tagged single-endpoint form of every operation
        .route("/api/v1/rpc", post(rpc_handler))

        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// Admin authentication for payment callbacks and maintenance triggers
fn authenticate_admin(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing API key"))?;

    if api_key != &*state.admin_api_key {
        return Err(ApiError::unauthorized("Invalid API key"));
    }
    Ok(())
}

// Operations shared by the REST routes and the rpc endpoint

async fn get_usage(state: &AppState, req: GetUsageRequest) -> Result<UsageSnapshot, ApiError> {
    let record = state
        .ledger
        .get_usage_for(&req.account_id, req.email.as_deref())
        .await?;
    Ok(record.to_snapshot())
}

async fn consume(state: &AppState, req: ConsumeCreditsRequest) -> (StatusCode, ConsumeResponse) {
    match state
        .ledger
        .consume_credits(&req.account_id, &req.tool_name, req.amount)
        .await
    {
        Ok(result) => (StatusCode::OK, result.into()),
        Err(LedgerError::Validation(message)) => {
            (StatusCode::BAD_REQUEST, ConsumeResponse::error(message))
        }
        Err(e) if e.is_transient() => {
            error!(account_id = %req.account_id, "consume failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, ConsumeResponse::error(RETRY_LATER))
        }
        Err(e) => {
            error!(account_id = %req.account_id, "consume failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, ConsumeResponse::error("internal error"))
        }
    }
}

async fn upgrade(state: &AppState, req: UpgradePlanRequest) -> Result<UpgradePlanResponse, ApiError> {
    let plan: Plan = match req.plan.parse() {
        Ok(plan) => plan,
        Err(e) => {
            warn!(account_id = %req.account_id, "upgrade rejected: {}", e);
            return Ok(UpgradePlanResponse { success: false });
        }
    };

    match state
        .ledger
        .upgrade_plan(&req.account_id, plan, &req.payment_reference)
        .await
    {
        Ok(outcome) => Ok(UpgradePlanResponse {
            success: outcome.is_success(),
        }),
        Err(LedgerError::Validation(message)) => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            message,
        )),
        Err(e) if e.is_transient() => {
            // Not applied; the payment gateway retries its callback
            error!(account_id = %req.account_id, "upgrade failed: {}", e);
            Ok(UpgradePlanResponse { success: false })
        }
        Err(e) => Err(e.into()),
    }
}

async fn reset(state: &AppState, job: ResetJob) -> Result<ResetSummary, ApiError> {
    let summary = match job {
        ResetJob::Daily => state.ledger.reset_daily().await?,
        ResetJob::Monthly => state.ledger.reset_monthly().await?,
    };
    Ok(summary)
}

// Handlers

#[instrument(skip(state))]
async fn get_usage_handler(
    State(state): State<AppState>,
    payload: Result<Json<GetUsageRequest>, JsonRejection>,
) -> Result<Json<UsageSnapshot>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(get_usage(&state, req).await?))
}

#[instrument(skip(state))]
async fn account_usage_handler(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<UsageSnapshot>, ApiError> {
    let req = GetUsageRequest {
        account_id,
        email: None,
    };
    Ok(Json(get_usage(&state, req).await?))
}

#[instrument(skip(state))]
async fn consume_handler(
    State(state): State<AppState>,
    payload: Result<Json<ConsumeCreditsRequest>, JsonRejection>,
) -> (StatusCode, Json<ConsumeResponse>) {
    let (status, response) = match payload {
        Ok(Json(req)) => consume(&state, req).await,
        Err(rejection) => consume_rejection(rejection),
    };
    (status, Json(response))
}

#[instrument(skip(state, headers))]
async fn upgrade_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<UpgradePlanRequest>, JsonRejection>,
) -> Result<Json<UpgradePlanResponse>, ApiError> {
    authenticate_admin(&headers, &state)?;
    let Json(req) = payload?;
    Ok(Json(upgrade(&state, req).await?))
}

#[instrument(skip(state, headers))]
async fn payments_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<PaymentRecord>>, ApiError> {
    authenticate_admin(&headers, &state)?;
    Ok(Json(state.ledger.payment_history(&account_id).await?))
}

#[instrument(skip(state, headers))]
async fn reset_daily_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetSummary>, ApiError> {
    authenticate_admin(&headers, &state)?;
    Ok(Json(reset(&state, ResetJob::Daily).await?))
}

#[instrument(skip(state, headers))]
async fn reset_monthly_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetSummary>, ApiError> {
    authenticate_admin(&headers, &state)?;
    Ok(Json(reset(&state, ResetJob::Monthly).await?))
}

#[instrument(skip(state, headers))]
async fn rpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LedgerRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    // Without a parsed op there is no response shape to pick
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let (status, response) = consume_rejection(rejection);
            return Ok((status, Json(LedgerResponse::Consume(response))).into_response());
        }
    };
    if req.requires_admin() {
        authenticate_admin(&headers, &state)?;
    }

    let response = match req {
        LedgerRequest::GetUsage(body) => LedgerResponse::Usage(get_usage(&state, body).await?),
        LedgerRequest::ConsumeCredits(body) => {
            let (status, response) = consume(&state, body).await;
            return Ok((status, Json(LedgerResponse::Consume(response))).into_response());
        }
        LedgerRequest::UpgradePlan(body) => LedgerResponse::Upgrade(upgrade(&state, body).await?),
        LedgerRequest::ResetDaily => LedgerResponse::Reset(reset(&state, ResetJob::Daily).await?),
        LedgerRequest::ResetMonthly => {
            LedgerResponse::Reset(reset(&state, ResetJob::Monthly).await?)
        }
    };
    Ok(Json(response).into_response())
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "credits-gateway".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests;
