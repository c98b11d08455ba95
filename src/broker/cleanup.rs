use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::db::models::ExecutionStatus;
use crate::db::ExecutionStore;
use crate::error::EngineError;

use super::{CleanupTask, JobPayload, TaskBroker, DEFAULT_PRIORITY};

/// Retention windows for terminal executions.
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub completed_days: i64,
    pub failed_days: i64,
}

/// Result of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub completed_deleted: u64,
    pub failed_deleted: u64,
    pub orphans_deleted: u64,
}

impl CleanupStats {
    pub fn total_deleted(&self) -> u64 {
        self.completed_deleted + self.failed_deleted + self.orphans_deleted
    }
}

/// Run one maintenance task against the store.
pub async fn run_task(
    store: &dyn ExecutionStore,
    task: CleanupTask,
    retention: &RetentionConfig,
) -> Result<CleanupStats, EngineError> {
    let mut stats = CleanupStats::default();
    match task {
        CleanupTask::ExpiredExecutions => {
            let completed_cutoff = Utc::now() - chrono::Duration::days(retention.completed_days);
            stats.completed_deleted = store
                .delete_executions_before(ExecutionStatus::Completed, completed_cutoff, false)
                .await?;

            // Failed executions are kept while they still have retry
            // budget, so an operator can revive them.
            let failed_cutoff = Utc::now() - chrono::Duration::days(retention.failed_days);
            stats.failed_deleted = store
                .delete_executions_before(ExecutionStatus::Failed, failed_cutoff, true)
                .await?;
        }
        CleanupTask::OrphanedNodes => {
            stats.orphans_deleted = store.delete_orphaned_nodes().await?;
        }
    }
    Ok(stats)
}

/// Enqueue the maintenance jobs on a fixed interval.
///
/// Ticks that pile up while the process is busy or asleep are skipped,
/// not replayed.
pub fn spawn_scheduler(
    broker: Arc<dyn TaskBroker>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of `interval` fires immediately; swallow it so
        // the first sweep happens one full period after startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for task in [CleanupTask::ExpiredExecutions, CleanupTask::OrphanedNodes] {
                if let Err(err) = broker
                    .enqueue(JobPayload::Cleanup { task }, DEFAULT_PRIORITY, None)
                    .await
                {
                    log::error!("failed to schedule cleanup {task:?}: {err}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::models::{NodeExecutionRecord, WorkflowExecutionRecord};
    use crate::workflow::spec::{NodeType, WorkflowSpec};
    use uuid::Uuid;

    #[tokio::test]
    async fn expired_sweep_respects_retry_budget_for_failed() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        let mut exhausted =
            WorkflowExecutionRecord::new(Uuid::new_v4(), user_id, WorkflowSpec::default());
        exhausted.status = ExecutionStatus::Failed;
        exhausted.completed_at = Some(Utc::now() - chrono::Duration::days(10));
        exhausted.retry_count = 3;

        let mut retriable =
            WorkflowExecutionRecord::new(Uuid::new_v4(), user_id, WorkflowSpec::default());
        retriable.status = ExecutionStatus::Failed;
        retriable.completed_at = Some(Utc::now() - chrono::Duration::days(10));
        retriable.retry_count = 0;
        let retriable_id = retriable.id;

        store.create_execution(exhausted, Vec::new()).await.unwrap();
        store.create_execution(retriable, Vec::new()).await.unwrap();

        let retention = RetentionConfig {
            completed_days: 30,
            failed_days: 7,
        };
        let stats = run_task(&store, CleanupTask::ExpiredExecutions, &retention)
            .await
            .unwrap();

        assert_eq!(stats.failed_deleted, 1);
        assert!(store.get_execution(retriable_id, user_id).await.is_ok());
    }

    #[tokio::test]
    async fn orphan_sweep_deletes_parentless_nodes() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        let execution =
            WorkflowExecutionRecord::new(Uuid::new_v4(), user_id, WorkflowSpec::default());
        let kept =
            NodeExecutionRecord::new(execution.id, user_id, "a", "a", NodeType::Action, 0);
        store
            .create_execution(execution, vec![kept])
            .await
            .unwrap();

        // A node pointing at an execution that was deleted out from
        // under it.
        let orphan =
            NodeExecutionRecord::new(Uuid::new_v4(), user_id, "b", "b", NodeType::Action, 0);
        store
            .create_execution(
                WorkflowExecutionRecord::new(Uuid::new_v4(), user_id, WorkflowSpec::default()),
                vec![orphan],
            )
            .await
            .unwrap();

        let retention = RetentionConfig {
            completed_days: 30,
            failed_days: 7,
        };
        let stats = run_task(&store, CleanupTask::OrphanedNodes, &retention)
            .await
            .unwrap();
        assert_eq!(stats.orphans_deleted, 1);
    }
}
