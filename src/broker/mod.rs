pub mod cleanup;
pub mod queue;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Logical queue a job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    WorkflowExecution,
    NodeExecution,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::WorkflowExecution,
        JobKind::NodeExecution,
        JobKind::Cleanup,
    ];

    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::WorkflowExecution => "workflow_execution",
            JobKind::NodeExecution => "node_execution",
            JobKind::Cleanup => "cleanup",
        }
    }

    /// Transport-level redelivery budget per job kind.
    pub fn max_deliveries(&self) -> u32 {
        match self {
            JobKind::WorkflowExecution => 2,
            JobKind::NodeExecution => 3,
            JobKind::Cleanup => 3,
        }
    }

    /// Initial delay before a redelivery.
    pub fn retry_delay(&self) -> Duration {
        match self {
            JobKind::WorkflowExecution => Duration::from_secs(120),
            JobKind::NodeExecution => Duration::from_secs(30),
            JobKind::Cleanup => Duration::from_secs(60),
        }
    }
}

/// Periodic maintenance task payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTask {
    /// Delete completed/failed executions past their retention windows.
    ExpiredExecutions,
    /// Delete node records whose parent execution is gone.
    OrphanedNodes,
}

/// Work unit payload.
///
/// Execution payloads carry only ids: everything needed to resume lives
/// in the store, so a redelivered job can always be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    RunWorkflow {
        execution_id: Uuid,
        user_id: Uuid,
    },
    RetryNode {
        node_execution_id: Uuid,
        user_id: Uuid,
    },
    Cleanup {
        task: CleanupTask,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::RunWorkflow { .. } => JobKind::WorkflowExecution,
            JobPayload::RetryNode { .. } => JobKind::NodeExecution,
            JobPayload::Cleanup { .. } => JobKind::Cleanup,
        }
    }
}

/// A job as carried by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    /// 0..=10; higher is served first within a queue.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries already attempted for this job.
    pub delivery_count: u32,
}

impl Job {
    pub fn new(payload: JobPayload, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority: priority.min(10),
            enqueued_at: Utc::now(),
            delivery_count: 0,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

pub const DEFAULT_PRIORITY: u8 = 5;

/// Enqueue-side capability the service and executor depend on.
///
/// Consumption is broker-specific; see
/// [`InProcessBroker::consume`](queue::InProcessBroker::consume).
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Queue a job, optionally not before `scheduled_at`. Returns the
    /// broker task id recorded on the parent row.
    async fn enqueue(
        &self,
        payload: JobPayload,
        priority: u8,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<String, EngineError>;

    /// Re-queue a job after a transient failure, delayed by `delay`.
    async fn schedule_retry(
        &self,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<String, EngineError>;
}
