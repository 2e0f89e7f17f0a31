//! HTTP clients for the proof generation service and the payout worker

use crate::collaborators::{
    PayoutError, PayoutOrder, PayoutReceipt, PayoutWorker, ProofGenerator, ProofOutput,
    ProofRequest,
};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

fn build_client(timeout_secs: u64) -> OrchestratorResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| OrchestratorError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Client for the zk proof generation service
pub struct HttpProofGenerator {
    client: Client,
    base_url: String,
}

impl HttpProofGenerator {
    pub fn new(endpoint: &str, timeout_secs: u64) -> OrchestratorResult<Self> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> OrchestratorResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| OrchestratorError::external("proof generator", e))?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| OrchestratorError::external("proof generator", e))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(OrchestratorError::external(
                "proof generator",
                format!("HTTP {}: {}", status.as_u16(), message),
            ))
        }
    }
}

#[async_trait]
impl ProofGenerator for HttpProofGenerator {
    async fn generate_proof(&self, request: ProofRequest) -> OrchestratorResult<ProofOutput> {
        debug!(entity_id = %request.entity_id, "Requesting proof for {}", request.entity_type);
        let path = match request.entity_type {
            crate::status::EntityType::Checkbook => "/api/v1/proofs/commitment",
            _ => "/api/v1/proofs/withdraw",
        };
        self.post(path, &request).await
    }
}

/// Client for the payout worker service
pub struct HttpPayoutWorker {
    client: Client,
    base_url: String,
}

impl HttpPayoutWorker {
    pub fn new(endpoint: &str, timeout_secs: u64) -> OrchestratorResult<Self> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PayoutWorker for HttpPayoutWorker {
    async fn execute(&self, order: PayoutOrder) -> Result<PayoutReceipt, PayoutError> {
        let url = format!("{}/api/v1/payouts", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&order)
            .send()
            .await
            .map_err(|e| PayoutError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| PayoutError::Retryable(format!("unreadable receipt: {}", e)));
        }

        let message = response.text().await.unwrap_or_default();
        match status {
            // The worker refuses the route itself; retrying the same order cannot help
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(PayoutError::RouteInvalid(message))
            }
            _ => Err(PayoutError::Retryable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                message
            ))),
        }
    }
}
