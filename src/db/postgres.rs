//! Postgres-backed execution store.
//!
//! Schema management is external; the store expects the tables
//! `workflow_executions` and `node_executions` with the columns bound in
//! [`insert_execution`]/[`insert_node`] (JSONB payloads, TIMESTAMPTZ
//! timestamps, FLOAT8 durations) and the operational indexes
//! `(user_id, status)`, `(workflow_id, status)`,
//! `(workflow_execution_id, execution_order)` and `(broker_task_id)`.
//!
//! Status changes run as read-check-write inside a transaction with
//! `SELECT ... FOR UPDATE`, so concurrent writers serialize per row and
//! observers only ever see transitions the table allows. Log appends use
//! the JSONB concatenation operator and never rewrite existing entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

use crate::error::EngineError;
use crate::workflow::spec::{NodeType, WorkflowSpec};

use super::models::{
    ExecutionPatch, ExecutionStatus, LogEntry, NodeExecutionRecord, NodePatch, NodeStatus,
    WorkflowExecutionRecord,
};
use super::{ExecutionFilter, ExecutionStore, Page};

pub async fn create_pool(database_url: &str) -> Result<PgPool, EngineError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    log::info!("database pool created");
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound)?;
        execution_from_row(&row)
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create_execution(
        &self,
        execution: WorkflowExecutionRecord,
        nodes: Vec<NodeExecutionRecord>,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        insert_execution(&mut tx, &execution).await?;
        for node in &nodes {
            insert_node(&mut tx, node).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let record = self.fetch_execution(execution_id).await?;
        if record.user_id != user_id {
            return Err(EngineError::NotFound);
        }
        Ok(record)
    }

    async fn list_executions(
        &self,
        user_id: Uuid,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<(Vec<WorkflowExecutionRecord>, u64), EngineError> {
        let mut count_query: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT COUNT(*) FROM workflow_executions WHERE user_id = ");
        count_query.push_bind(user_id);
        if let Some(workflow_id) = filter.workflow_id {
            count_query.push(" AND workflow_id = ");
            count_query.push_bind(workflow_id);
        }
        if let Some(status) = filter.status {
            count_query.push(" AND status = ");
            count_query.push_bind(status.as_str());
        }
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut query: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM workflow_executions WHERE user_id = ");
        query.push_bind(user_id);
        if let Some(workflow_id) = filter.workflow_id {
            query.push(" AND workflow_id = ");
            query.push_bind(workflow_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }
        query.push(" ORDER BY created_at DESC LIMIT ");
        query.push_bind(page.limit as i64);
        query.push(" OFFSET ");
        query.push_bind(page.offset as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(execution_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((items, total.max(0) as u64))
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        expected: &[ExecutionStatus],
        next: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(EngineError::NotFound)?;
        let mut record = execution_from_row(&row)?;

        let current = record.status;
        if !expected.contains(&current) || !current.can_transition_to(next) {
            return Err(EngineError::illegal_transition(
                "execution",
                current.as_str(),
                next.as_str(),
            ));
        }

        record.status = next;
        patch.apply(&mut record);
        update_execution_row(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn patch_execution(
        &self,
        execution_id: Uuid,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1 FOR UPDATE")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(EngineError::NotFound)?;
        let mut record = execution_from_row(&row)?;

        patch.apply(&mut record);
        update_execution_row(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        entry: LogEntry,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET execution_log = execution_log || $2::jsonb, updated_at = now() \
             WHERE id = $1",
        )
        .bind(execution_id)
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn list_nodes(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, EngineError> {
        self.get_execution(execution_id, user_id).await?;

        let rows = sqlx::query(
            "SELECT * FROM node_executions \
             WHERE workflow_execution_id = $1 \
             ORDER BY execution_order, node_id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    async fn get_node(
        &self,
        node_execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM node_executions WHERE id = $1")
            .bind(node_execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound)?;
        let record = node_from_row(&row)?;
        if record.user_id != user_id {
            return Err(EngineError::NotFound);
        }
        Ok(record)
    }

    async fn find_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let row = sqlx::query(
            "SELECT * FROM node_executions \
             WHERE workflow_execution_id = $1 AND node_id = $2",
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::NotFound)?;
        node_from_row(&row)
    }

    async fn transition_node(
        &self,
        node_execution_id: Uuid,
        expected: &[NodeStatus],
        next: NodeStatus,
        patch: NodePatch,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM node_executions WHERE id = $1 FOR UPDATE")
            .bind(node_execution_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(EngineError::NotFound)?;
        let mut record = node_from_row(&row)?;

        let current = record.status;
        if !expected.contains(&current) || !current.can_transition_to(next) {
            return Err(EngineError::illegal_transition(
                "node",
                current.as_str(),
                next.as_str(),
            ));
        }

        record.status = next;
        patch.apply(&mut record);
        update_node_row(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn patch_node(
        &self,
        node_execution_id: Uuid,
        patch: NodePatch,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM node_executions WHERE id = $1 FOR UPDATE")
            .bind(node_execution_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(EngineError::NotFound)?;
        let mut record = node_from_row(&row)?;

        patch.apply(&mut record);
        update_node_row(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn append_node_log(
        &self,
        node_execution_id: Uuid,
        entry: LogEntry,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE node_executions \
             SET execution_log = execution_log || $2::jsonb, updated_at = now() \
             WHERE id = $1",
        )
        .bind(node_execution_id)
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound);
        }
        Ok(())
    }

    async fn cancel_pending_nodes(&self, execution_id: Uuid) -> Result<u64, EngineError> {
        let entry = LogEntry::info("Node execution cancelled");
        let result = sqlx::query(
            "UPDATE node_executions \
             SET status = 'cancelled', \
                 completed_at = now(), \
                 duration_seconds = CASE \
                     WHEN started_at IS NOT NULL \
                     THEN EXTRACT(EPOCH FROM (now() - started_at))::float8 \
                 END, \
                 execution_log = execution_log || $2::jsonb, \
                 updated_at = now() \
             WHERE workflow_execution_id = $1 \
               AND status IN ('pending', 'running')",
        )
        .bind(execution_id)
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_nodes_for_retry(&self, execution_id: Uuid) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;

        let retried = sqlx::query(
            "UPDATE node_executions \
             SET status = 'pending', \
                 retry_count = retry_count + 1, \
                 started_at = NULL, completed_at = NULL, duration_seconds = NULL, \
                 error_message = NULL, error_details = '{}'::jsonb, error_stack = NULL, \
                 execution_log = execution_log || \
                     jsonb_build_array(jsonb_build_object( \
                         'timestamp', to_char(now() AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"'), \
                         'level', 'info', \
                         'message', 'Node execution retry #' || (retry_count + 1)::text)), \
                 updated_at = now() \
             WHERE workflow_execution_id = $1 AND status = 'failed'",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        let rearmed = sqlx::query(
            "UPDATE node_executions \
             SET status = 'pending', \
                 started_at = NULL, completed_at = NULL, duration_seconds = NULL, \
                 error_message = NULL, error_details = '{}'::jsonb, error_stack = NULL, \
                 updated_at = now() \
             WHERE workflow_execution_id = $1 AND status = 'cancelled'",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(retried.rows_affected() + rearmed.rows_affected())
    }

    async fn delete_executions_before(
        &self,
        status: ExecutionStatus,
        cutoff: DateTime<Utc>,
        only_exhausted: bool,
    ) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;

        let mut doomed: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT id FROM workflow_executions WHERE status = ");
        doomed.push_bind(status.as_str());
        doomed.push(" AND completed_at < ");
        doomed.push_bind(cutoff);
        if only_exhausted {
            doomed.push(" AND retry_count >= max_retries");
        }
        let ids: Vec<Uuid> = doomed
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        sqlx::query("DELETE FROM node_executions WHERE workflow_execution_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM workflow_executions WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn delete_orphaned_nodes(&self) -> Result<u64, EngineError> {
        let result = sqlx::query(
            "DELETE FROM node_executions \
             WHERE workflow_execution_id NOT IN (SELECT id FROM workflow_executions)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_execution(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &WorkflowExecutionRecord,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO workflow_executions ( \
             id, workflow_id, user_id, status, workflow_spec, \
             started_at, completed_at, duration_seconds, \
             input_data, output_data, context, \
             total_nodes, completed_nodes, failed_nodes, \
             error_message, error_details, execution_log, \
             retry_count, max_retries, priority, scheduled_at, broker_task_id, \
             created_at, updated_at \
         ) VALUES ( \
             $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24 \
         )",
    )
    .bind(record.id)
    .bind(record.workflow_id)
    .bind(record.user_id)
    .bind(record.status.as_str())
    .bind(Json(&record.workflow_spec))
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_seconds)
    .bind(&record.input_data)
    .bind(&record.output_data)
    .bind(&record.context)
    .bind(record.total_nodes as i32)
    .bind(record.completed_nodes as i32)
    .bind(record.failed_nodes as i32)
    .bind(&record.error_message)
    .bind(&record.error_details)
    .bind(Json(&record.execution_log))
    .bind(record.retry_count as i32)
    .bind(record.max_retries as i32)
    .bind(record.priority as i32)
    .bind(record.scheduled_at)
    .bind(&record.broker_task_id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_execution_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &WorkflowExecutionRecord,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE workflow_executions SET \
             status = $2, started_at = $3, completed_at = $4, duration_seconds = $5, \
             input_data = $6, output_data = $7, context = $8, \
             total_nodes = $9, completed_nodes = $10, failed_nodes = $11, \
             error_message = $12, error_details = $13, \
             retry_count = $14, max_retries = $15, priority = $16, \
             scheduled_at = $17, broker_task_id = $18, updated_at = $19 \
         WHERE id = $1",
    )
    .bind(record.id)
    .bind(record.status.as_str())
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_seconds)
    .bind(&record.input_data)
    .bind(&record.output_data)
    .bind(&record.context)
    .bind(record.total_nodes as i32)
    .bind(record.completed_nodes as i32)
    .bind(record.failed_nodes as i32)
    .bind(&record.error_message)
    .bind(&record.error_details)
    .bind(record.retry_count as i32)
    .bind(record.max_retries as i32)
    .bind(record.priority as i32)
    .bind(record.scheduled_at)
    .bind(&record.broker_task_id)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_node(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &NodeExecutionRecord,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO node_executions ( \
             id, workflow_execution_id, agent_id, user_id, \
             node_id, node_name, node_type, status, \
             started_at, completed_at, duration_seconds, \
             input_data, output_data, \
             agent_response, tokens_used, model_used, tools_called, tool_results, \
             error_message, error_details, error_stack, \
             retry_count, max_retries, execution_order, \
             parent_node_ids, child_node_ids, execution_log, broker_task_id, \
             created_at, updated_at \
         ) VALUES ( \
             $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
             $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30 \
         )",
    )
    .bind(record.id)
    .bind(record.workflow_execution_id)
    .bind(record.agent_id)
    .bind(record.user_id)
    .bind(&record.node_id)
    .bind(&record.node_name)
    .bind(record.node_type.as_str())
    .bind(record.status.as_str())
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_seconds)
    .bind(&record.input_data)
    .bind(&record.output_data)
    .bind(&record.agent_response)
    .bind(record.tokens_used.map(|v| v as i32))
    .bind(&record.model_used)
    .bind(Json(&record.tools_called))
    .bind(&record.tool_results)
    .bind(&record.error_message)
    .bind(&record.error_details)
    .bind(&record.error_stack)
    .bind(record.retry_count as i32)
    .bind(record.max_retries as i32)
    .bind(record.execution_order as i32)
    .bind(Json(&record.parent_node_ids))
    .bind(Json(&record.child_node_ids))
    .bind(Json(&record.execution_log))
    .bind(&record.broker_task_id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_node_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &NodeExecutionRecord,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE node_executions SET \
             status = $2, started_at = $3, completed_at = $4, duration_seconds = $5, \
             input_data = $6, output_data = $7, \
             agent_response = $8, tokens_used = $9, model_used = $10, \
             tools_called = $11, tool_results = $12, \
             error_message = $13, error_details = $14, error_stack = $15, \
             retry_count = $16, broker_task_id = $17, updated_at = $18 \
         WHERE id = $1",
    )
    .bind(record.id)
    .bind(record.status.as_str())
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_seconds)
    .bind(&record.input_data)
    .bind(&record.output_data)
    .bind(&record.agent_response)
    .bind(record.tokens_used.map(|v| v as i32))
    .bind(&record.model_used)
    .bind(Json(&record.tools_called))
    .bind(&record.tool_results)
    .bind(&record.error_message)
    .bind(&record.error_details)
    .bind(&record.error_stack)
    .bind(record.retry_count as i32)
    .bind(&record.broker_task_id)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecutionRecord, EngineError> {
    let status_raw: String = row.try_get("status")?;
    let status = ExecutionStatus::parse(&status_raw)
        .ok_or_else(|| EngineError::Store(format!("unknown execution status: {status_raw}")))?;

    Ok(WorkflowExecutionRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        user_id: row.try_get("user_id")?,
        status,
        workflow_spec: row.try_get::<Json<WorkflowSpec>, _>("workflow_spec")?.0,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        input_data: row.try_get("input_data")?,
        output_data: row.try_get("output_data")?,
        context: row.try_get("context")?,
        total_nodes: row.try_get::<i32, _>("total_nodes")?.max(0) as u32,
        completed_nodes: row.try_get::<i32, _>("completed_nodes")?.max(0) as u32,
        failed_nodes: row.try_get::<i32, _>("failed_nodes")?.max(0) as u32,
        error_message: row.try_get("error_message")?,
        error_details: row.try_get("error_details")?,
        execution_log: row.try_get::<Json<Vec<LogEntry>>, _>("execution_log")?.0,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        max_retries: row.try_get::<i32, _>("max_retries")?.max(0) as u32,
        priority: row.try_get::<i32, _>("priority")?.clamp(0, 10) as u8,
        scheduled_at: row.try_get("scheduled_at")?,
        broker_task_id: row.try_get("broker_task_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn node_from_row(row: &PgRow) -> Result<NodeExecutionRecord, EngineError> {
    let status_raw: String = row.try_get("status")?;
    let status = NodeStatus::parse(&status_raw)
        .ok_or_else(|| EngineError::Store(format!("unknown node status: {status_raw}")))?;

    let node_type_raw: String = row.try_get("node_type")?;
    let node_type = parse_node_type(&node_type_raw)
        .ok_or_else(|| EngineError::Store(format!("unknown node type: {node_type_raw}")))?;

    Ok(NodeExecutionRecord {
        id: row.try_get("id")?,
        workflow_execution_id: row.try_get("workflow_execution_id")?,
        agent_id: row.try_get("agent_id")?,
        user_id: row.try_get("user_id")?,
        node_id: row.try_get("node_id")?,
        node_name: row.try_get("node_name")?,
        node_type,
        status,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        input_data: row.try_get("input_data")?,
        output_data: row.try_get("output_data")?,
        agent_response: row.try_get("agent_response")?,
        tokens_used: row
            .try_get::<Option<i32>, _>("tokens_used")?
            .map(|v| v.max(0) as u32),
        model_used: row.try_get("model_used")?,
        tools_called: row.try_get::<Json<Vec<String>>, _>("tools_called")?.0,
        tool_results: row.try_get("tool_results")?,
        error_message: row.try_get("error_message")?,
        error_details: row.try_get("error_details")?,
        error_stack: row.try_get("error_stack")?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        max_retries: row.try_get::<i32, _>("max_retries")?.max(0) as u32,
        execution_order: row.try_get::<i32, _>("execution_order")?.max(0) as u32,
        parent_node_ids: row.try_get::<Json<Vec<String>>, _>("parent_node_ids")?.0,
        child_node_ids: row.try_get::<Json<Vec<String>>, _>("child_node_ids")?.0,
        execution_log: row.try_get::<Json<Vec<LogEntry>>, _>("execution_log")?.0,
        broker_task_id: row.try_get("broker_task_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_node_type(value: &str) -> Option<NodeType> {
    match value {
        "agent" => Some(NodeType::Agent),
        "trigger" => Some(NodeType::Trigger),
        "action" => Some(NodeType::Action),
        "logic" => Some(NodeType::Logic),
        "integration" => Some(NodeType::Integration),
        _ => None,
    }
}
