use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::EngineError;

use super::models::{
    ExecutionPatch, ExecutionStatus, LogEntry, NodeExecutionRecord, NodePatch, NodeStatus,
    WorkflowExecutionRecord,
};
use super::{ExecutionFilter, ExecutionStore, Page};

/// In-memory execution store.
///
/// Backs tests and single-process deployments without a database. The
/// same conditional-transition discipline as the Postgres store applies:
/// a mutation holds the record's map entry for its whole read-check-write
/// cycle, so transitions are linearizable per record.
#[derive(Default)]
pub struct MemoryStore {
    executions: DashMap<Uuid, WorkflowExecutionRecord>,
    nodes: DashMap<Uuid, NodeExecutionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_execution(&self, execution_id: Uuid) -> Result<WorkflowExecutionRecord, EngineError> {
        self.executions
            .get(&execution_id)
            .map(|e| e.clone())
            .ok_or(EngineError::NotFound)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(
        &self,
        execution: WorkflowExecutionRecord,
        nodes: Vec<NodeExecutionRecord>,
    ) -> Result<(), EngineError> {
        let execution_id = execution.id;
        self.executions.insert(execution_id, execution);
        for node in nodes {
            self.nodes.insert(node.id, node);
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let record = self.require_execution(execution_id)?;
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
        let mut matching: Vec<WorkflowExecutionRecord> = self
            .executions
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.user_id == user_id
                    && filter
                        .workflow_id
                        .map_or(true, |id| record.workflow_id == id)
                    && filter.status.map_or(true, |s| record.status == s)
            })
            .map(|entry| entry.value().clone())
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as u64;

        let items = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();

        Ok((items, total))
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        expected: &[ExecutionStatus],
        next: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let mut entry = self
            .executions
            .get_mut(&execution_id)
            .ok_or(EngineError::NotFound)?;

        let current = entry.status;
        if !expected.contains(&current) || !current.can_transition_to(next) {
            return Err(EngineError::illegal_transition(
                "execution",
                current.as_str(),
                next.as_str(),
            ));
        }

        entry.status = next;
        patch.apply(entry.value_mut());
        Ok(entry.clone())
    }

    async fn patch_execution(
        &self,
        execution_id: Uuid,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let mut entry = self
            .executions
            .get_mut(&execution_id)
            .ok_or(EngineError::NotFound)?;
        patch.apply(entry.value_mut());
        Ok(entry.clone())
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        entry: LogEntry,
    ) -> Result<(), EngineError> {
        let mut record = self
            .executions
            .get_mut(&execution_id)
            .ok_or(EngineError::NotFound)?;
        record.add_log_entry(entry);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_nodes(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, EngineError> {
        // Ownership is checked on the parent so an empty node set is
        // distinguishable from a foreign execution.
        self.get_execution(execution_id, user_id).await?;

        let mut nodes: Vec<NodeExecutionRecord> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().workflow_execution_id == execution_id)
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| {
            a.execution_order
                .cmp(&b.execution_order)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        Ok(nodes)
    }

    async fn get_node(
        &self,
        node_execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let record = self
            .nodes
            .get(&node_execution_id)
            .map(|n| n.clone())
            .ok_or(EngineError::NotFound)?;
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
        self.nodes
            .iter()
            .find(|entry| {
                let node = entry.value();
                node.workflow_execution_id == execution_id && node.node_id == node_id
            })
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::NotFound)
    }

    async fn transition_node(
        &self,
        node_execution_id: Uuid,
        expected: &[NodeStatus],
        next: NodeStatus,
        patch: NodePatch,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let mut entry = self
            .nodes
            .get_mut(&node_execution_id)
            .ok_or(EngineError::NotFound)?;

        let current = entry.status;
        if !expected.contains(&current) || !current.can_transition_to(next) {
            return Err(EngineError::illegal_transition(
                "node",
                current.as_str(),
                next.as_str(),
            ));
        }

        entry.status = next;
        patch.apply(entry.value_mut());
        Ok(entry.clone())
    }

    async fn patch_node(
        &self,
        node_execution_id: Uuid,
        patch: NodePatch,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let mut entry = self
            .nodes
            .get_mut(&node_execution_id)
            .ok_or(EngineError::NotFound)?;
        patch.apply(entry.value_mut());
        Ok(entry.clone())
    }

    async fn append_node_log(
        &self,
        node_execution_id: Uuid,
        entry: LogEntry,
    ) -> Result<(), EngineError> {
        let mut record = self
            .nodes
            .get_mut(&node_execution_id)
            .ok_or(EngineError::NotFound)?;
        record.add_log_entry(entry);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_pending_nodes(&self, execution_id: Uuid) -> Result<u64, EngineError> {
        let mut cancelled = 0;
        for mut entry in self.nodes.iter_mut() {
            let node = entry.value_mut();
            if node.workflow_execution_id == execution_id && !node.status.is_terminal() {
                node.status = NodeStatus::Cancelled;
                node.completed_at = Some(Utc::now());
                node.calculate_duration();
                node.add_log_entry(LogEntry::info("Node execution cancelled"));
                node.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn reset_nodes_for_retry(&self, execution_id: Uuid) -> Result<u64, EngineError> {
        let mut reset = 0;
        for mut entry in self.nodes.iter_mut() {
            let node = entry.value_mut();
            if node.workflow_execution_id != execution_id {
                continue;
            }
            match node.status {
                NodeStatus::Failed => {
                    node.retry_count += 1;
                    node.add_log_entry(LogEntry::info(format!(
                        "Node execution retry #{}",
                        node.retry_count
                    )));
                }
                NodeStatus::Cancelled => {}
                _ => continue,
            }
            node.status = NodeStatus::Pending;
            node.started_at = None;
            node.completed_at = None;
            node.duration_seconds = None;
            node.error_message = None;
            node.error_details = super::models::empty_object();
            node.error_stack = None;
            node.updated_at = Utc::now();
            reset += 1;
        }
        Ok(reset)
    }

    async fn delete_executions_before(
        &self,
        status: ExecutionStatus,
        cutoff: DateTime<Utc>,
        only_exhausted: bool,
    ) -> Result<u64, EngineError> {
        let doomed: Vec<Uuid> = self
            .executions
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.status == status
                    && record.completed_at.map_or(false, |t| t < cutoff)
                    && (!only_exhausted || record.retry_count >= record.max_retries)
            })
            .map(|entry| *entry.key())
            .collect();

        for execution_id in &doomed {
            self.executions.remove(execution_id);
            self.nodes
                .retain(|_, node| node.workflow_execution_id != *execution_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_orphaned_nodes(&self) -> Result<u64, EngineError> {
        let before = self.nodes.len();
        self.nodes
            .retain(|_, node| self.executions.contains_key(&node.workflow_execution_id));
        Ok((before - self.nodes.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::spec::{NodeType, WorkflowSpec};

    async fn seed(store: &MemoryStore, user_id: Uuid) -> (Uuid, Uuid) {
        let execution =
            WorkflowExecutionRecord::new(Uuid::new_v4(), user_id, WorkflowSpec::default());
        let execution_id = execution.id;
        let node = NodeExecutionRecord::new(execution_id, user_id, "a", "Node a", NodeType::Action, 0);
        let node_id = node.id;

        store
            .create_execution(execution, vec![node])
            .await
            .unwrap();
        (execution_id, node_id)
    }

    #[tokio::test]
    async fn ownership_mismatch_reads_as_not_found() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let (execution_id, node_id) = seed(&store, owner).await;

        assert!(store.get_execution(execution_id, owner).await.is_ok());
        assert!(matches!(
            store.get_execution(execution_id, stranger).await,
            Err(EngineError::NotFound)
        ));
        assert!(matches!(
            store.get_node(node_id, stranger).await,
            Err(EngineError::NotFound)
        ));
    }

    #[tokio::test]
    async fn transition_enforces_table_and_expected_set() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let (execution_id, _) = seed(&store, user).await;

        let patch = ExecutionPatch {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let record = store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                patch,
            )
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.started_at.is_some());

        // Second dispatch of the same execution must be rejected.
        let err = store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                ExecutionPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();

        for _ in 0..3 {
            let record = WorkflowExecutionRecord::new(workflow_id, user, WorkflowSpec::default());
            store.create_execution(record, Vec::new()).await.unwrap();
        }
        let other = WorkflowExecutionRecord::new(Uuid::new_v4(), user, WorkflowSpec::default());
        store.create_execution(other, Vec::new()).await.unwrap();

        let filter = ExecutionFilter {
            workflow_id: Some(workflow_id),
            status: None,
        };
        let (items, total) = store
            .list_executions(user, &filter, Page { limit: 2, offset: 0 })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(items.len(), 2);

        let (rest, _) = store
            .list_executions(user, &filter, Page { limit: 2, offset: 2 })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn cancel_pending_nodes_skips_terminal_ones() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let execution =
            WorkflowExecutionRecord::new(Uuid::new_v4(), user, WorkflowSpec::default());
        let execution_id = execution.id;

        let mut done = NodeExecutionRecord::new(execution_id, user, "a", "a", NodeType::Action, 0);
        done.status = NodeStatus::Completed;
        let waiting = NodeExecutionRecord::new(execution_id, user, "b", "b", NodeType::Action, 1);

        store
            .create_execution(execution, vec![done, waiting])
            .await
            .unwrap();

        let touched = store.cancel_pending_nodes(execution_id).await.unwrap();
        assert_eq!(touched, 1);

        let nodes = store.list_nodes(execution_id, user).await.unwrap();
        assert_eq!(nodes[0].status, NodeStatus::Completed);
        assert_eq!(nodes[1].status, NodeStatus::Cancelled);
        assert_eq!(nodes[1].execution_log.len(), 1);
    }

    #[tokio::test]
    async fn retention_sweep_deletes_old_terminal_executions() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();

        let mut old = WorkflowExecutionRecord::new(Uuid::new_v4(), user, WorkflowSpec::default());
        old.status = ExecutionStatus::Completed;
        old.completed_at = Some(Utc::now() - chrono::Duration::days(60));
        let old_id = old.id;
        let orphan_node = NodeExecutionRecord::new(old_id, user, "a", "a", NodeType::Action, 0);

        let mut fresh = WorkflowExecutionRecord::new(Uuid::new_v4(), user, WorkflowSpec::default());
        fresh.status = ExecutionStatus::Completed;
        fresh.completed_at = Some(Utc::now());

        store
            .create_execution(old, vec![orphan_node])
            .await
            .unwrap();
        store.create_execution(fresh, Vec::new()).await.unwrap();

        let deleted = store
            .delete_executions_before(
                ExecutionStatus::Completed,
                Utc::now() - chrono::Duration::days(30),
                false,
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(matches!(
            store.get_execution(old_id, user).await,
            Err(EngineError::NotFound)
        ));
        // Cascade removed the child rows too.
        assert_eq!(store.delete_orphaned_nodes().await.unwrap(), 0);
    }
}
