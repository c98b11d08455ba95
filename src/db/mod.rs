pub mod memory;
pub mod models;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use self::models::{
    ExecutionPatch, ExecutionStatus, LogEntry, NodeExecutionRecord, NodePatch, NodeStatus,
    WorkflowExecutionRecord,
};

/// Optional filters for execution list queries.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

/// Pagination window for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Persistence boundary for execution state.
///
/// The store is the single source of truth: all concurrent writers
/// serialize through it, and status changes go through the conditional
/// `transition_*` operations so an observer only ever sees transitions
/// the table allows. Read operations take a `user_id` and answer
/// [`EngineError::NotFound`] for records owned by someone else.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert the parent record and all of its node records in one
    /// transaction. Nothing is persisted if any insert fails.
    async fn create_execution(
        &self,
        execution: WorkflowExecutionRecord,
        nodes: Vec<NodeExecutionRecord>,
    ) -> Result<(), EngineError>;

    async fn get_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError>;

    /// Filtered list, newest first. Returns the page plus the total count
    /// of matching records.
    async fn list_executions(
        &self,
        user_id: Uuid,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<(Vec<WorkflowExecutionRecord>, u64), EngineError>;

    /// Conditionally move an execution to `next`, applying `patch` in the
    /// same write. Fails with `IllegalTransition` when the current status
    /// is not in `expected` or the transition table forbids the move.
    async fn transition_execution(
        &self,
        execution_id: Uuid,
        expected: &[ExecutionStatus],
        next: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecutionRecord, EngineError>;

    /// Apply a patch without changing status.
    async fn patch_execution(
        &self,
        execution_id: Uuid,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecutionRecord, EngineError>;

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        entry: LogEntry,
    ) -> Result<(), EngineError>;

    /// All node records of an execution, ordered by execution order.
    async fn list_nodes(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, EngineError>;

    async fn get_node(
        &self,
        node_execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<NodeExecutionRecord, EngineError>;

    /// Look up a node record by its spec-level node id.
    async fn find_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<NodeExecutionRecord, EngineError>;

    async fn transition_node(
        &self,
        node_execution_id: Uuid,
        expected: &[NodeStatus],
        next: NodeStatus,
        patch: NodePatch,
    ) -> Result<NodeExecutionRecord, EngineError>;

    async fn patch_node(
        &self,
        node_execution_id: Uuid,
        patch: NodePatch,
    ) -> Result<NodeExecutionRecord, EngineError>;

    async fn append_node_log(
        &self,
        node_execution_id: Uuid,
        entry: LogEntry,
    ) -> Result<(), EngineError>;

    /// Move every non-terminal node of an execution to `cancelled`,
    /// writing a log entry on each. Returns the number of nodes touched.
    async fn cancel_pending_nodes(&self, execution_id: Uuid) -> Result<u64, EngineError>;

    /// Re-arm child nodes for a workflow retry: failed nodes go back to
    /// pending with `retry_count` bumped; nodes cancelled by the failure
    /// path go back to pending untouched. Completed nodes are left alone.
    async fn reset_nodes_for_retry(&self, execution_id: Uuid) -> Result<u64, EngineError>;

    /// Retention sweep: delete executions in `status` whose terminal
    /// timestamp precedes `cutoff`, cascading to their nodes. When
    /// `only_exhausted` is set, failed executions are kept while they
    /// still have retry budget.
    async fn delete_executions_before(
        &self,
        status: ExecutionStatus,
        cutoff: DateTime<Utc>,
        only_exhausted: bool,
    ) -> Result<u64, EngineError>;

    /// Delete node records whose parent execution no longer exists.
    async fn delete_orphaned_nodes(&self) -> Result<u64, EngineError>;
}
