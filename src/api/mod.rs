//! HTTP API for health checks, retries, withdrawals and multisig operations

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{MultisigProposal, NewProposal, PollingTask, WithdrawRequest};
use crate::multisig::MultisigTracker;
use crate::orchestrator::{CreateWithdrawRequest, Orchestrator};
use crate::polling::PollingQueue;
use crate::retry::{RetryCoordinator, RetryOutcome, RetryStatusView};
use crate::status::{EntityType, RetryStep};
use crate::store::{ProposalStats, Store, TaskStats};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub retry: Arc<RetryCoordinator>,
    pub queue: Arc<PollingQueue>,
    pub multisig: Arc<MultisigTracker>,
    /// Absent when running without chain connections
    pub chains: Option<Arc<ChainManager>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/v1/retry/:entity_type/:id/status", get(retry_status))
        .route("/v1/retry/:entity_type/:id", post(retry_entity))
        .route("/v1/withdrawals", post(create_withdrawal))
        .route("/v1/withdrawals/:id", get(get_withdrawal))
        .route("/v1/withdrawals/:id/cancel", post(cancel_withdrawal))
        .route("/v1/polling/tasks/:entity_type/:id", get(list_polling_tasks))
        .route("/v1/polling/tasks/:id/stop", post(stop_polling_task))
        .route("/v1/multisig/status", get(multisig_status))
        .route("/v1/multisig/proposals", post(create_proposal))
        .route("/v1/multisig/proposals/:id", get(get_proposal))
        .route("/v1/multisig/proposals/:id/sign", post(sign_proposal))
        .route("/v1/multisig/proposals/:id/execute", post(execute_proposal))
        .route("/v1/multisig/proposals/:id/reject", post(reject_proposal))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> OrchestratorResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::Internal(format!("cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| OrchestratorError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

impl OrchestratorError {
    fn status_code(&self) -> StatusCode {
        match self.root() {
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::InvalidState(_)
            | OrchestratorError::AlreadyExists(_)
            | OrchestratorError::AlreadyActive { .. }
            | OrchestratorError::AlreadySigned { .. }
            | OrchestratorError::AlreadyExecuted(_)
            | OrchestratorError::AlreadyRejected(_)
            | OrchestratorError::InsufficientSignatures { .. }
            | OrchestratorError::RetryExhausted { .. }
            | OrchestratorError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            OrchestratorError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            OrchestratorError::ExternalFailure { .. } | OrchestratorError::Chain { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, OrchestratorError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and chain connections
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = match &state.chains {
        Some(chains) => chains.health_check().await,
        None => Vec::new(),
    };
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);
    crate::metrics::record_health_check(db_ok && chains_ok);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(id, h)| ChainHealth {
                    chain_id: id,
                    healthy: h,
                })
                .collect(),
        }),
    )
}

/// Polling task and proposal counts
async fn get_stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    Ok(Json(StatsResponse {
        polling: state.queue.stats().await?,
        proposals: state.multisig.system_status().await?,
    }))
}

async fn retry_status(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, Uuid)>,
) -> ApiResult<RetryStatusView> {
    Ok(Json(state.retry.status(&entity_type, id).await?))
}

async fn retry_entity(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, Uuid)>,
    Json(body): Json<RetryBody>,
) -> ApiResult<RetryOutcome> {
    let outcome = state
        .retry
        .retry(&entity_type, id, body.from_step, body.force_restart)
        .await?;
    Ok(Json(outcome))
}

async fn create_withdrawal(
    State(state): State<AppState>,
    Json(body): Json<CreateWithdrawRequest>,
) -> Result<(StatusCode, Json<WithdrawRequest>), OrchestratorError> {
    let request = state.orchestrator.create_withdraw_request(body).await?;

    let orchestrator = state.orchestrator.clone();
    let id = request.id;
    tokio::spawn(async move {
        if let Err(e) = orchestrator.advance(id).await {
            error!(request_id = %id, "Withdraw pipeline stopped: {}", e);
        }
    });

    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_withdrawal(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<WithdrawalResponse> {
    let request = state.orchestrator.get_withdraw_request(id).await?;
    Ok(Json(WithdrawalResponse {
        can_cancel: request.can_cancel(),
        request,
    }))
}

async fn cancel_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> ApiResult<WithdrawRequest> {
    let reason = body.reason.unwrap_or_else(|| "cancelled by user".to_string());
    Ok(Json(state.orchestrator.cancel_withdraw_request(id, &reason).await?))
}

async fn list_polling_tasks(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, Uuid)>,
) -> ApiResult<Vec<PollingTask>> {
    let entity_type: EntityType = entity_type.parse()?;
    Ok(Json(state.queue.list_tasks_by_entity(entity_type, id).await?))
}

async fn stop_polling_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<PollingTask> {
    Ok(Json(state.queue.stop_task(id).await?))
}

async fn multisig_status(State(state): State<AppState>) -> ApiResult<ProposalStats> {
    Ok(Json(state.multisig.system_status().await?))
}

async fn create_proposal(
    State(state): State<AppState>,
    Json(body): Json<NewProposal>,
) -> Result<(StatusCode, Json<MultisigProposal>), OrchestratorError> {
    let proposal = state.multisig.create_proposal(body).await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

async fn get_proposal(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<MultisigProposal> {
    Ok(Json(state.multisig.get_proposal(id).await?))
}

async fn sign_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SignBody>,
) -> ApiResult<MultisigProposal> {
    Ok(Json(
        state
            .multisig
            .sign(id, &body.signer, body.chain_id, body.tx_hash)
            .await?,
    ))
}

async fn execute_proposal(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<MultisigProposal> {
    Ok(Json(state.multisig.execute(id).await?))
}

async fn reject_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> ApiResult<MultisigProposal> {
    Ok(Json(state.multisig.reject(id, &body.signer, body.reason).await?))
}

// Request types

#[derive(Deserialize)]
struct RetryBody {
    #[serde(default)]
    from_step: Option<RetryStep>,
    #[serde(default)]
    force_restart: bool,
}

#[derive(Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct SignBody {
    signer: String,
    chain_id: u64,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Deserialize)]
struct RejectBody {
    signer: String,
    #[serde(default)]
    reason: Option<String>,
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    polling: TaskStats,
    proposals: ProposalStats,
}

#[derive(Serialize)]
struct WithdrawalResponse {
    #[serde(flatten)]
    request: WithdrawRequest,
    can_cancel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockChainClient;
    use crate::config::MultisigConfig;
    use crate::models::Checkbook;
    use crate::orchestrator::testing::{harness, Harness, Mocks};
    use crate::status::CheckbookStatus;
    use axum::body::Body;
    use axum::http::Request;
    use ethers::types::U256;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app(h: &Harness) -> Router {
        let multisig = MultisigTracker::new(
            h.store.clone(),
            Arc::new(MockChainClient::new()),
            h.queue.clone(),
            MultisigConfig::default(),
            HashMap::new(),
            "0xexecutor",
        );
        router(AppState {
            store: h.store.clone(),
            orchestrator: h.orchestrator.clone(),
            retry: Arc::new(RetryCoordinator::for_orchestrator(h.orchestrator.clone())),
            queue: h.queue.clone(),
            multisig: Arc::new(multisig),
            chains: None,
        })
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let h = harness(Mocks::new());
        let (status, body) = call(app(&h), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app(&h), "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], true);
    }

    #[tokio::test]
    async fn errors_carry_code_and_status() {
        let h = harness(Mocks::new());

        let missing = format!("/v1/withdrawals/{}", Uuid::new_v4());
        let (status, body) = call(app(&h), "GET", &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let payload = json!({
            "owner": "0xowner",
            "beneficiary": "0xbeneficiary",
            "intent_type": "raw_token",
            "token": "0xtoken",
            "allocation_ids": [],
            "target_chain_id": 1,
            "worker_type": "direct_transfer"
        });
        let (status, body) = call(app(&h), "POST", "/v1/withdrawals", Some(payload)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "invalid_argument");

        let unknown = format!("/v1/retry/deposit/{}/status", Uuid::new_v4());
        let (status, _) = call(app(&h), "GET", &unknown, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn retry_endpoints() {
        let h = harness(Mocks::new());
        let mut checkbook = Checkbook::new("0xowner", 56, U256::from(10u64));
        checkbook.status = CheckbookStatus::WithCheckbook;
        h.store.insert_checkbook(&checkbook).await.unwrap();

        let uri = format!("/v1/retry/checkbook/{}/status", checkbook.id);
        let (status, body) = call(app(&h), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "with_checkbook");
        assert_eq!(body["can_retry"], false);
        assert!(body["retry_options"].is_null());

        let uri = format!("/v1/retry/checkbook/{}", checkbook.id);
        let (status, body) = call(app(&h), "POST", &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["retry_started"], false);

        let uri = format!("/v1/retry/checkbook/{}", checkbook.id);
        let (status, body) = call(app(&h), "POST", &uri, Some(json!({"force_restart": true}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn disabled_check_retry_is_501() {
        let h = harness(Mocks::new());
        let checkbook = Checkbook::new("0xowner", 56, U256::from(10u64));
        h.store.insert_checkbook(&checkbook).await.unwrap();
        let allocation = crate::models::Allocation::new(checkbook.id, 0, U256::from(10u64));
        h.store.insert_allocations(&[allocation.clone()]).await.unwrap();

        let uri = format!("/v1/retry/check/{}", allocation.id);
        let (status, body) = call(app(&h), "POST", &uri, Some(json!({"force_restart": true}))).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"]["code"], "not_implemented");
    }

    #[tokio::test]
    async fn multisig_and_stats() {
        let h = harness(Mocks::new());

        let uri = format!("/v1/multisig/proposals/{}/sign", Uuid::new_v4());
        let (status, body) = call(app(&h), "POST", &uri, Some(json!({"signer": "0xa", "chain_id": 56}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, body) = call(app(&h), "GET", "/v1/multisig/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending"], 0);

        let (status, body) = call(app(&h), "GET", "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["polling"]["pending"], 0);
    }

    #[tokio::test]
    async fn polling_tasks_by_entity() {
        let h = harness(Mocks::new());
        let uri = format!("/v1/polling/tasks/withdraw_request/{}", Uuid::new_v4());
        let (status, body) = call(app(&h), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let uri = format!("/v1/polling/tasks/{}/stop", Uuid::new_v4());
        let (status, _) = call(app(&h), "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
