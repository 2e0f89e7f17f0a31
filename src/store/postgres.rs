//! PostgreSQL store

use super::{ProposalStats, Store, TaskStats};
use crate::config::DatabaseConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{
    parse_amount, Allocation, Checkbook, MultisigExecution, MultisigProposal, MultisigRejection,
    MultisigSignature, PollingTask, WithdrawRequest,
};
use crate::status::{CheckbookStatus, EntityType, ExecuteStatus, RequestStatus, TaskStatus, TaskType};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Store backed by a PostgreSQL pool
pub struct PgStore {
    pool: PgPool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn to_json<T: serde::Serialize>(value: &T) -> OrchestratorResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| OrchestratorError::Internal(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> OrchestratorResult<T> {
    serde_json::from_value(value).map_err(|e| OrchestratorError::Internal(e.to_string()))
}

fn opt_u64(row: &PgRow, column: &str) -> OrchestratorResult<Option<u64>> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as u64))
}

fn checkbook_from_row(row: &PgRow) -> OrchestratorResult<Checkbook> {
    Ok(Checkbook {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        amount: parse_amount(&row.try_get::<String, _>("amount")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        signature: row.try_get("signature")?,
        proof: row.try_get("proof")?,
        proved_at: row.try_get("proved_at")?,
        commitment: row.try_get("commitment")?,
        commitment_tx_hash: row.try_get("commitment_tx_hash")?,
        commitment_block: opt_u64(row, "commitment_block")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        last_error: row.try_get("last_error")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn allocation_from_row(row: &PgRow) -> OrchestratorResult<Allocation> {
    Ok(Allocation {
        id: row.try_get("id")?,
        checkbook_id: row.try_get("checkbook_id")?,
        seq: row.try_get::<i16, _>("seq")? as u8,
        amount: parse_amount(&row.try_get::<String, _>("amount")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        withdraw_request_id: row.try_get("withdraw_request_id")?,
        nullifier: row.try_get("nullifier")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Version-checked checkbook update, returning the stored row
async fn write_checkbook(conn: &mut PgConnection, checkbook: &Checkbook) -> OrchestratorResult<Checkbook> {
    let mut next = checkbook.clone();
    next.version += 1;
    next.updated_at = Utc::now();

    let result = sqlx::query(
        r#"
        UPDATE checkbooks
        SET status = $3, signature = $4, proof = $5, proved_at = $6, commitment = $7,
            commitment_tx_hash = $8, commitment_block = $9, retry_count = $10,
            last_error = $11, version = $12, updated_at = $13
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(next.id)
    .bind(checkbook.version)
    .bind(next.status.as_str())
    .bind(&next.signature)
    .bind(&next.proof)
    .bind(next.proved_at)
    .bind(&next.commitment)
    .bind(&next.commitment_tx_hash)
    .bind(next.commitment_block.map(|b| b as i64))
    .bind(next.retry_count as i32)
    .bind(&next.last_error)
    .bind(next.version)
    .bind(next.updated_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::concurrent("checkbook", checkbook.id));
    }
    Ok(next)
}

async fn write_allocations(conn: &mut PgConnection, allocations: &[Allocation]) -> OrchestratorResult<()> {
    for allocation in allocations {
        let result = sqlx::query(
            r#"
            INSERT INTO allocations
                (id, checkbook_id, seq, amount, status, withdraw_request_id, nullifier,
                 version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(allocation.id)
        .bind(allocation.checkbook_id)
        .bind(allocation.seq as i16)
        .bind(allocation.amount.to_string())
        .bind(allocation.status.as_str())
        .bind(allocation.withdraw_request_id)
        .bind(&allocation.nullifier)
        .bind(allocation.version)
        .bind(allocation.created_at)
        .bind(allocation.updated_at)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(OrchestratorError::AlreadyExists(format!(
                    "allocation seq {} of checkbook {}",
                    allocation.seq, allocation.checkbook_id
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn task_from_row(row: &PgRow) -> OrchestratorResult<PollingTask> {
    Ok(PollingTask {
        id: row.try_get("id")?,
        entity_type: row.try_get::<String, _>("entity_type")?.parse()?,
        entity_id: row.try_get("entity_id")?,
        task_type: row.try_get::<String, _>("task_type")?.parse()?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        tx_hash: row.try_get("tx_hash")?,
        target_status: row.try_get("target_status")?,
        current_status: row.try_get("current_status")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        query_error_count: row.try_get::<i32, _>("query_error_count")? as u32,
        poll_interval_secs: row.try_get::<i64, _>("poll_interval_secs")? as u64,
        next_poll_at: row.try_get("next_poll_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_error: row.try_get("last_error")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn proposal_from_row(row: &PgRow) -> OrchestratorResult<MultisigProposal> {
    Ok(MultisigProposal {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        action_type: row.try_get("action_type")?,
        request_id: row.try_get("request_id")?,
        source_tx_hash: row.try_get("source_tx_hash")?,
        multisig_address: row.try_get("multisig_address")?,
        target_contract: row.try_get("target_contract")?,
        value: parse_amount(&row.try_get::<String, _>("value")?)?,
        call_data: row.try_get("call_data")?,
        description: row.try_get("description")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        proposer: row.try_get("proposer")?,
        signature_count: row.try_get::<i32, _>("signature_count")? as u32,
        required_signatures: row.try_get::<i32, _>("required_signatures")? as u32,
        rejection_count: row.try_get::<i32, _>("rejection_count")? as u32,
        rejection_threshold: row.try_get::<i32, _>("rejection_threshold")? as u32,
        created_at: row.try_get("created_at")?,
        deadline: row.try_get("deadline")?,
        executed_at: row.try_get("executed_at")?,
        expired_at: row.try_get("expired_at")?,
        execute_tx_hash: row.try_get("execute_tx_hash")?,
        execute_block: opt_u64(row, "execute_block")?,
        execute_success: row.try_get("execute_success")?,
        return_data: row.try_get("return_data")?,
        error_reason: row.try_get("error_reason")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn signature_from_row(row: &PgRow) -> OrchestratorResult<MultisigSignature> {
    Ok(MultisigSignature {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        signer: row.try_get("signer")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        tx_hash: row.try_get("tx_hash")?,
        signed_at: row.try_get("signed_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> OrchestratorResult<MultisigExecution> {
    Ok(MultisigExecution {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        executor: row.try_get("executor")?,
        execute_tx_hash: row.try_get("execute_tx_hash")?,
        block_number: opt_u64(row, "block_number")?,
        gas_used: opt_u64(row, "gas_used")?,
        success: row.try_get("success")?,
        return_data: row.try_get("return_data")?,
        error_reason: row.try_get("error_reason")?,
        executed_at: row.try_get("executed_at")?,
    })
}

impl PgStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> OrchestratorResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS checkbooks (
                id UUID PRIMARY KEY,
                owner VARCHAR(66) NOT NULL,
                chain_id BIGINT NOT NULL,
                amount TEXT NOT NULL,
                status VARCHAR(32) NOT NULL,
                signature TEXT,
                proof TEXT,
                proved_at TIMESTAMPTZ,
                commitment VARCHAR(66),
                commitment_tx_hash VARCHAR(66),
                commitment_block BIGINT,
                retry_count INT NOT NULL DEFAULT 0,
                last_error TEXT,
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS allocations (
                id UUID PRIMARY KEY,
                checkbook_id UUID NOT NULL,
                seq SMALLINT NOT NULL,
                amount TEXT NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'idle',
                withdraw_request_id UUID,
                nullifier VARCHAR(66) UNIQUE,
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (checkbook_id, seq)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_allocations_request ON allocations (withdraw_request_id)",
            r#"
            CREATE TABLE IF NOT EXISTS withdraw_requests (
                id UUID PRIMARY KEY,
                status VARCHAR(32) NOT NULL,
                proof_status VARCHAR(16) NOT NULL,
                execute_status VARCHAR(16) NOT NULL,
                payout_status VARCHAR(16) NOT NULL,
                hook_status VARCHAR(16) NOT NULL,
                data JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_withdraw_stages ON withdraw_requests (execute_status, payout_status)",
            r#"
            CREATE TABLE IF NOT EXISTS polling_tasks (
                id UUID PRIMARY KEY,
                entity_type VARCHAR(32) NOT NULL,
                entity_id UUID NOT NULL,
                task_type VARCHAR(32) NOT NULL,
                chain_id BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                target_status VARCHAR(32) NOT NULL,
                current_status VARCHAR(32) NOT NULL,
                status VARCHAR(16) NOT NULL,
                retry_count INT NOT NULL DEFAULT 0,
                max_retries INT NOT NULL,
                query_error_count INT NOT NULL DEFAULT 0,
                poll_interval_secs BIGINT NOT NULL,
                next_poll_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                last_error TEXT,
                version BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_polling_one_active
            ON polling_tasks (entity_type, entity_id, task_type)
            WHERE status IN ('pending', 'in_progress')
            "#,
            "CREATE INDEX IF NOT EXISTS idx_polling_due ON polling_tasks (status, next_poll_at)",
            r#"
            CREATE TABLE IF NOT EXISTS multisig_proposals (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                action_type VARCHAR(64) NOT NULL,
                request_id UUID,
                source_tx_hash VARCHAR(66),
                multisig_address VARCHAR(66) NOT NULL,
                target_contract VARCHAR(66) NOT NULL,
                value TEXT NOT NULL,
                call_data TEXT NOT NULL,
                description TEXT NOT NULL,
                status VARCHAR(20) NOT NULL,
                proposer VARCHAR(66) NOT NULL,
                signature_count INT NOT NULL DEFAULT 0,
                required_signatures INT NOT NULL,
                rejection_count INT NOT NULL DEFAULT 0,
                rejection_threshold INT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deadline TIMESTAMPTZ NOT NULL,
                executed_at TIMESTAMPTZ,
                expired_at TIMESTAMPTZ,
                execute_tx_hash VARCHAR(66),
                execute_block BIGINT,
                execute_success BOOLEAN,
                return_data TEXT,
                error_reason TEXT,
                version BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS multisig_signatures (
                id UUID PRIMARY KEY,
                proposal_id UUID NOT NULL REFERENCES multisig_proposals (id),
                signer VARCHAR(66) NOT NULL,
                chain_id BIGINT NOT NULL,
                tx_hash VARCHAR(66),
                signed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (proposal_id, signer)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS multisig_rejections (
                proposal_id UUID NOT NULL REFERENCES multisig_proposals (id),
                signer VARCHAR(66) NOT NULL,
                reason TEXT,
                rejected_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (proposal_id, signer)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS multisig_executions (
                id UUID PRIMARY KEY,
                proposal_id UUID NOT NULL REFERENCES multisig_proposals (id),
                executor VARCHAR(66) NOT NULL,
                execute_tx_hash VARCHAR(66) NOT NULL UNIQUE,
                block_number BIGINT,
                gas_used BIGINT,
                success BOOLEAN NOT NULL,
                return_data TEXT,
                error_reason TEXT,
                executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_checkbook(&self, checkbook: &Checkbook) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkbooks
                (id, owner, chain_id, amount, status, signature, proof, proved_at, commitment,
                 commitment_tx_hash, commitment_block, retry_count, last_error, version,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(checkbook.id)
        .bind(&checkbook.owner)
        .bind(checkbook.chain_id as i64)
        .bind(checkbook.amount.to_string())
        .bind(checkbook.status.as_str())
        .bind(&checkbook.signature)
        .bind(&checkbook.proof)
        .bind(checkbook.proved_at)
        .bind(&checkbook.commitment)
        .bind(&checkbook.commitment_tx_hash)
        .bind(checkbook.commitment_block.map(|b| b as i64))
        .bind(checkbook.retry_count as i32)
        .bind(&checkbook.last_error)
        .bind(checkbook.version)
        .bind(checkbook.created_at)
        .bind(checkbook.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_checkbook(&self, id: Uuid) -> OrchestratorResult<Option<Checkbook>> {
        let row = sqlx::query("SELECT * FROM checkbooks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(checkbook_from_row).transpose()
    }

    async fn update_checkbook(&self, checkbook: &mut Checkbook) -> OrchestratorResult<()> {
        let mut conn = self.pool.acquire().await?;
        *checkbook = write_checkbook(&mut conn, checkbook).await?;
        Ok(())
    }

    async fn sign_checkbook(
        &self,
        checkbook: &mut Checkbook,
        allocations: &[Allocation],
    ) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        let next = write_checkbook(&mut tx, checkbook).await?;
        write_allocations(&mut tx, allocations).await?;
        tx.commit().await?;
        *checkbook = next;
        Ok(())
    }

    async fn list_untracked_commitments(&self, limit: usize) -> OrchestratorResult<Vec<Checkbook>> {
        let rows = sqlx::query(
            r#"
            SELECT c.* FROM checkbooks c
            WHERE c.status = $1
              AND NOT EXISTS (
                  SELECT 1 FROM polling_tasks t
                  WHERE t.entity_type = $2 AND t.entity_id = c.id AND t.task_type = $3
                    AND t.status IN ($4, $5)
              )
            ORDER BY c.updated_at
            LIMIT $6
            "#,
        )
        .bind(CheckbookStatus::CommitmentPending.as_str())
        .bind(EntityType::Checkbook.as_str())
        .bind(TaskType::CommitmentConfirmation.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::InProgress.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(checkbook_from_row).collect()
    }

    async fn insert_allocations(&self, allocations: &[Allocation]) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        write_allocations(&mut tx, allocations).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_allocations(&self, ids: &[Uuid]) -> OrchestratorResult<Vec<Allocation>> {
        let rows = sqlx::query("SELECT * FROM allocations WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn list_allocations(&self, checkbook_id: Uuid) -> OrchestratorResult<Vec<Allocation>> {
        let rows = sqlx::query("SELECT * FROM allocations WHERE checkbook_id = $1 ORDER BY seq")
            .bind(checkbook_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn claim_allocations(&self, ids: &[Uuid], request_id: Uuid) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET status = 'pending', withdraw_request_id = $2, version = version + 1, updated_at = NOW()
            WHERE id = ANY($1) AND status = 'idle' AND withdraw_request_id IS NULL
            "#,
        )
        .bind(ids)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != ids.len() as u64 {
            tx.rollback().await?;
            debug!(
                "Allocation claim for request {} matched {} of {} rows",
                request_id,
                result.rows_affected(),
                ids.len()
            );
            return Err(OrchestratorError::concurrent("allocation", request_id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn release_allocations(&self, request_id: Uuid) -> OrchestratorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET status = 'idle', withdraw_request_id = NULL, version = version + 1, updated_at = NOW()
            WHERE withdraw_request_id = $1 AND status = 'pending'
            "#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn consume_allocations(&self, request_id: Uuid) -> OrchestratorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET status = 'used', version = version + 1, updated_at = NOW()
            WHERE withdraw_request_id = $1 AND status = 'pending'
            "#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_withdraw_request(&self, request: &WithdrawRequest) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO withdraw_requests
                (id, status, proof_status, execute_status, payout_status, hook_status, data,
                 version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(request.proof_status.as_str())
        .bind(request.execute_status.as_str())
        .bind(request.payout_status.as_str())
        .bind(request.hook_status.as_str())
        .bind(to_json(request)?)
        .bind(request.version)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_withdraw_request(&self, id: Uuid) -> OrchestratorResult<Option<WithdrawRequest>> {
        let row = sqlx::query("SELECT data FROM withdraw_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| from_json(r.try_get("data")?)).transpose()
    }

    async fn update_withdraw_request(&self, request: &mut WithdrawRequest) -> OrchestratorResult<()> {
        let mut next = request.clone();
        next.version += 1;
        next.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE withdraw_requests
            SET status = $3, proof_status = $4, execute_status = $5, payout_status = $6,
                hook_status = $7, data = $8, version = $9, updated_at = $10
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(next.id)
        .bind(request.version)
        .bind(next.status.as_str())
        .bind(next.proof_status.as_str())
        .bind(next.execute_status.as_str())
        .bind(next.payout_status.as_str())
        .bind(next.hook_status.as_str())
        .bind(to_json(&next)?)
        .bind(next.version)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::concurrent("withdraw request", request.id));
        }
        *request = next;
        Ok(())
    }

    async fn list_stale_proofs(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<Vec<WithdrawRequest>> {
        let rows = sqlx::query(
            "SELECT data FROM withdraw_requests WHERE proof_status = 'in_progress' AND updated_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| from_json(r.try_get("data")?))
            .collect()
    }

    async fn list_awaiting_payout(&self, limit: usize) -> OrchestratorResult<Vec<WithdrawRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM withdraw_requests
            WHERE execute_status = 'success' AND payout_status = 'pending' AND status <> 'cancelled'
            ORDER BY updated_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| from_json(r.try_get("data")?))
            .collect()
    }

    async fn list_untracked_executes(&self, limit: usize) -> OrchestratorResult<Vec<WithdrawRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT w.data FROM withdraw_requests w
            WHERE w.execute_status = $1 AND w.status <> $2
              AND NOT EXISTS (
                  SELECT 1 FROM polling_tasks t
                  WHERE t.entity_type = $3 AND t.entity_id = w.id AND t.task_type = $4
                    AND t.status IN ($5, $6)
              )
            ORDER BY w.updated_at
            LIMIT $7
            "#,
        )
        .bind(ExecuteStatus::Submitted.as_str())
        .bind(RequestStatus::Cancelled.as_str())
        .bind(EntityType::WithdrawRequest.as_str())
        .bind(TaskType::WithdrawExecute.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::InProgress.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| from_json(r.try_get("data")?))
            .collect()
    }

    async fn insert_task(&self, task: &PollingTask) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO polling_tasks
                (id, entity_type, entity_id, task_type, chain_id, tx_hash, target_status,
                 current_status, status, retry_count, max_retries, query_error_count,
                 poll_interval_secs, next_poll_at, started_at, completed_at, last_error,
                 version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20)
            "#,
        )
        .bind(task.id)
        .bind(task.entity_type.as_str())
        .bind(task.entity_id)
        .bind(task.task_type.as_str())
        .bind(task.chain_id as i64)
        .bind(&task.tx_hash)
        .bind(&task.target_status)
        .bind(&task.current_status)
        .bind(task.status.as_str())
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.query_error_count as i32)
        .bind(task.poll_interval_secs as i64)
        .bind(task.next_poll_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.last_error)
        .bind(task.version)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(OrchestratorError::AlreadyActive {
                entity_type: task.entity_type.to_string(),
                entity_id: task.entity_id.to_string(),
                task_type: task.task_type.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, id: Uuid) -> OrchestratorResult<Option<PollingTask>> {
        let row = sqlx::query("SELECT * FROM polling_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> OrchestratorResult<Vec<PollingTask>> {
        let rows = sqlx::query(
            r#"
            UPDATE polling_tasks
            SET status = 'in_progress', started_at = $1, next_poll_at = $2,
                version = version + 1, updated_at = $1
            WHERE id IN (
                SELECT id FROM polling_tasks
                WHERE status IN ('pending', 'in_progress') AND next_poll_at <= $1
                ORDER BY next_poll_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn update_task(&self, task: &mut PollingTask) -> OrchestratorResult<()> {
        let mut next = task.clone();
        next.version += 1;
        next.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE polling_tasks
            SET status = $3, retry_count = $4, query_error_count = $5, next_poll_at = $6,
                started_at = $7, completed_at = $8, last_error = $9, version = $10,
                updated_at = $11
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(next.id)
        .bind(task.version)
        .bind(next.status.as_str())
        .bind(next.retry_count as i32)
        .bind(next.query_error_count as i32)
        .bind(next.next_poll_at)
        .bind(next.started_at)
        .bind(next.completed_at)
        .bind(&next.last_error)
        .bind(next.version)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::concurrent("polling task", task.id));
        }
        *task = next;
        Ok(())
    }

    async fn list_tasks_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> OrchestratorResult<Vec<PollingTask>> {
        let rows = sqlx::query(
            "SELECT * FROM polling_tasks WHERE entity_type = $1 AND entity_id = $2 ORDER BY created_at",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn cancel_tasks_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        reason: &str,
    ) -> OrchestratorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE polling_tasks
            SET status = 'cancelled', completed_at = NOW(), last_error = $3,
                version = version + 1, updated_at = NOW()
            WHERE entity_type = $1 AND entity_id = $2 AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn task_stats(&self) -> OrchestratorResult<TaskStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'in_progress') as in_progress,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled
            FROM polling_tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskStats {
            pending: row.try_get::<i64, _>("pending")? as u64,
            in_progress: row.try_get::<i64, _>("in_progress")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            cancelled: row.try_get::<i64, _>("cancelled")? as u64,
        })
    }

    async fn insert_proposal(&self, proposal: &MultisigProposal) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO multisig_proposals
                (id, chain_id, action_type, request_id, source_tx_hash, multisig_address,
                 target_contract, value, call_data, description, status, proposer,
                 signature_count, required_signatures, rejection_count, rejection_threshold,
                 created_at, deadline, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20)
            "#,
        )
        .bind(proposal.id)
        .bind(proposal.chain_id as i64)
        .bind(&proposal.action_type)
        .bind(proposal.request_id)
        .bind(&proposal.source_tx_hash)
        .bind(&proposal.multisig_address)
        .bind(&proposal.target_contract)
        .bind(proposal.value.to_string())
        .bind(&proposal.call_data)
        .bind(&proposal.description)
        .bind(proposal.status.as_str())
        .bind(&proposal.proposer)
        .bind(proposal.signature_count as i32)
        .bind(proposal.required_signatures as i32)
        .bind(proposal.rejection_count as i32)
        .bind(proposal.rejection_threshold as i32)
        .bind(proposal.created_at)
        .bind(proposal.deadline)
        .bind(proposal.version)
        .bind(proposal.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_proposal(&self, id: Uuid) -> OrchestratorResult<Option<MultisigProposal>> {
        let row = sqlx::query("SELECT * FROM multisig_proposals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(proposal_from_row).transpose()
    }

    async fn update_proposal(&self, proposal: &mut MultisigProposal) -> OrchestratorResult<()> {
        let mut next = proposal.clone();
        next.version += 1;
        next.updated_at = Utc::now();

        // Counts are owned by add_signature/add_rejection and never written here
        let result = sqlx::query(
            r#"
            UPDATE multisig_proposals
            SET status = $3, executed_at = $4, expired_at = $5, execute_tx_hash = $6,
                execute_block = $7, execute_success = $8, return_data = $9, error_reason = $10,
                version = $11, updated_at = $12
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(next.id)
        .bind(proposal.version)
        .bind(next.status.as_str())
        .bind(next.executed_at)
        .bind(next.expired_at)
        .bind(&next.execute_tx_hash)
        .bind(next.execute_block.map(|b| b as i64))
        .bind(next.execute_success)
        .bind(&next.return_data)
        .bind(&next.error_reason)
        .bind(next.version)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::concurrent("proposal", proposal.id));
        }
        *proposal = next;
        Ok(())
    }

    async fn add_signature(&self, signature: &MultisigSignature) -> OrchestratorResult<MultisigProposal> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent signers on the same proposal
        let locked = sqlx::query("SELECT id FROM multisig_proposals WHERE id = $1 FOR UPDATE")
            .bind(signature.proposal_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(OrchestratorError::not_found("proposal", signature.proposal_id));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO multisig_signatures (id, proposal_id, signer, chain_id, tx_hash, signed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(signature.id)
        .bind(signature.proposal_id)
        .bind(&signature.signer)
        .bind(signature.chain_id as i64)
        .bind(&signature.tx_hash)
        .bind(signature.signed_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(OrchestratorError::AlreadySigned {
                    proposal_id: signature.proposal_id.to_string(),
                    signer: signature.signer.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let row = sqlx::query(
            r#"
            UPDATE multisig_proposals
            SET signature_count = (SELECT COUNT(*) FROM multisig_signatures WHERE proposal_id = $1),
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(signature.proposal_id)
        .fetch_one(&mut *tx)
        .await?;

        let proposal = proposal_from_row(&row)?;
        tx.commit().await?;
        Ok(proposal)
    }

    async fn list_signatures(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigSignature>> {
        let rows = sqlx::query(
            "SELECT * FROM multisig_signatures WHERE proposal_id = $1 ORDER BY signed_at",
        )
        .bind(proposal_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(signature_from_row).collect()
    }

    async fn add_rejection(&self, rejection: &MultisigRejection) -> OrchestratorResult<MultisigProposal> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query("SELECT id FROM multisig_proposals WHERE id = $1 FOR UPDATE")
            .bind(rejection.proposal_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(OrchestratorError::not_found("proposal", rejection.proposal_id));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO multisig_rejections (proposal_id, signer, reason, rejected_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(rejection.proposal_id)
        .bind(&rejection.signer)
        .bind(&rejection.reason)
        .bind(rejection.rejected_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(OrchestratorError::AlreadyExists(format!(
                    "rejection by {} on proposal {}",
                    rejection.signer, rejection.proposal_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let row = sqlx::query(
            r#"
            UPDATE multisig_proposals
            SET rejection_count = (SELECT COUNT(*) FROM multisig_rejections WHERE proposal_id = $1),
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(rejection.proposal_id)
        .fetch_one(&mut *tx)
        .await?;

        let proposal = proposal_from_row(&row)?;
        tx.commit().await?;
        Ok(proposal)
    }

    async fn insert_execution(&self, execution: &MultisigExecution) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO multisig_executions
                (id, proposal_id, executor, execute_tx_hash, block_number, gas_used, success,
                 return_data, error_reason, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (execute_tx_hash) DO NOTHING
            "#,
        )
        .bind(execution.id)
        .bind(execution.proposal_id)
        .bind(&execution.executor)
        .bind(&execution.execute_tx_hash)
        .bind(execution.block_number.map(|b| b as i64))
        .bind(execution.gas_used.map(|g| g as i64))
        .bind(execution.success)
        .bind(&execution.return_data)
        .bind(&execution.error_reason)
        .bind(execution.executed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_executions(&self, proposal_id: Uuid) -> OrchestratorResult<Vec<MultisigExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM multisig_executions WHERE proposal_id = $1 ORDER BY executed_at",
        )
        .bind(proposal_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn expire_overdue_proposals(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            UPDATE multisig_proposals
            SET status = 'expired', expired_at = $1, version = version + 1, updated_at = $1
            WHERE status IN ('pending', 'execution_failed') AND deadline < $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map_err(Into::into))
            .collect()
    }

    async fn proposal_stats(&self) -> OrchestratorResult<ProposalStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'executing') as executing,
                COUNT(*) FILTER (WHERE status = 'execution_failed') as execution_failed,
                COUNT(*) FILTER (WHERE status = 'executed') as executed,
                COUNT(*) FILTER (WHERE status = 'rejected') as rejected,
                COUNT(*) FILTER (WHERE status = 'expired') as expired
            FROM multisig_proposals
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ProposalStats {
            pending: row.try_get::<i64, _>("pending")? as u64,
            executing: row.try_get::<i64, _>("executing")? as u64,
            execution_failed: row.try_get::<i64, _>("execution_failed")? as u64,
            executed: row.try_get::<i64, _>("executed")? as u64,
            rejected: row.try_get::<i64, _>("rejected")? as u64,
            expired: row.try_get::<i64, _>("expired")? as u64,
        })
    }
}
