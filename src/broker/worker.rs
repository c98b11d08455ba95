use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::models::{ExecutionPatch, ExecutionStatus, LogEntry};
use crate::db::ExecutionStore;
use crate::error::EngineError;
use crate::workflow::executor::WorkflowExecutor;

use super::cleanup::{self, RetentionConfig};
use super::queue::InProcessBroker;
use super::{Job, JobPayload};

/// Worker-pool tuning, derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub hard_timeout: Duration,
    pub soft_timeout: Duration,
    pub retention: RetentionConfig,
}

impl WorkerConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers,
            hard_timeout: config.hard_timeout,
            soft_timeout: config.soft_timeout,
            retention: RetentionConfig {
                completed_days: config.retention_completed_days,
                failed_days: config.retention_failed_days,
            },
        }
    }
}

/// Pool of N independent workers, each consuming one job at a time.
///
/// Acknowledgement is late: a delivery is settled only after the job
/// reached a terminal outcome. Transient failures are nacked back to the
/// queue until the delivery budget runs out, at which point the parent
/// execution is failed with the exhaustion recorded.
pub struct WorkerPool {
    broker: Arc<InProcessBroker>,
    executor: Arc<WorkflowExecutor>,
    store: Arc<dyn ExecutionStore>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<InProcessBroker>,
        executor: Arc<WorkflowExecutor>,
        store: Arc<dyn ExecutionStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            executor,
            store,
            config,
        }
    }

    /// Spawn the worker tasks. Handles run until aborted.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|index| {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    pool.worker_loop(index).await;
                })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        log::info!("worker {index} started");
        loop {
            let delivery = self.broker.consume().await;
            let job = delivery.job().clone();
            log::info!(
                "worker {index} picked job {} from {}",
                job.id,
                job.kind().queue_name()
            );

            // The job runs in its own task so a panic is contained and
            // surfaces as a redelivery instead of killing the worker.
            let pool = Arc::clone(&self);
            let job_for_task = job.clone();
            let outcome = tokio::spawn(async move { pool.handle(job_for_task).await }).await;

            match outcome {
                Ok(Ok(())) => delivery.ack(),
                Ok(Err(err)) if err.is_retryable() => {
                    log::warn!("job {} failed transiently: {err}", job.id);
                    if let Err(exhausted) = delivery.nack() {
                        log::error!("job {} gave up: {exhausted}", job.id);
                        self.record_exhaustion(&job, &exhausted).await;
                    }
                }
                Ok(Err(err)) => {
                    // Semantic failure; the executor has already settled
                    // the records. Redelivery could not change the result.
                    log::warn!("job {} failed: {err}", job.id);
                    delivery.ack();
                }
                Err(join_err) => {
                    log::error!("job {} panicked: {join_err}", job.id);
                    if let Err(exhausted) = delivery.nack() {
                        let err = EngineError::UpstreamFailure(join_err.to_string());
                        self.record_exhaustion(&job, &err).await;
                        log::error!("job {} gave up: {exhausted}", job.id);
                    }
                }
            }
        }
    }

    async fn handle(&self, job: Job) -> Result<(), EngineError> {
        let hard = self.config.hard_timeout;
        match tokio::time::timeout(hard, self.dispatch(job)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                seconds: hard.as_secs(),
            }),
        }
    }

    async fn dispatch(&self, job: Job) -> Result<(), EngineError> {
        match job.payload {
            JobPayload::RunWorkflow {
                execution_id,
                user_id,
            } => self.run_workflow(execution_id, user_id).await,
            JobPayload::RetryNode {
                node_execution_id,
                user_id,
            } => {
                self.executor.retry_node(node_execution_id, user_id).await?;
                Ok(())
            }
            JobPayload::Cleanup { task } => {
                let stats =
                    cleanup::run_task(self.store.as_ref(), task, &self.config.retention).await?;
                log::info!("cleanup {task:?} removed {} records", stats.total_deleted());
                Ok(())
            }
        }
    }

    /// Drive one execution with the soft-timeout guard.
    ///
    /// When the soft limit fires the run future is dropped at its next
    /// suspension point and the executor aborts the execution, cancelling
    /// whatever had not finished. The job is then settled; the hard
    /// timeout only matters if even the abort hangs.
    async fn run_workflow(&self, execution_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        enum RunOutcome {
            Finished(Result<(), EngineError>),
            SoftTimeout,
        }

        let outcome = {
            let run = self.executor.run(execution_id, user_id);
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => RunOutcome::Finished(result.map(|_| ())),
                _ = tokio::time::sleep(self.config.soft_timeout) => RunOutcome::SoftTimeout,
            }
        };

        match outcome {
            RunOutcome::Finished(result) => result,
            RunOutcome::SoftTimeout => {
                log::warn!(
                    "execution {execution_id} hit the soft timeout ({}s); aborting",
                    self.config.soft_timeout.as_secs()
                );
                self.executor
                    .abort(
                        execution_id,
                        user_id,
                        format!(
                            "execution aborted after soft timeout of {}s",
                            self.config.soft_timeout.as_secs()
                        ),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// The delivery budget ran out; surface that on the parent record.
    async fn record_exhaustion(&self, job: &Job, err: &EngineError) {
        let JobPayload::RunWorkflow { execution_id, .. } = &job.payload else {
            return;
        };

        let result = self
            .store
            .transition_execution(
                *execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Failed,
                ExecutionPatch {
                    completed_at: Some(chrono::Utc::now()),
                    error_message: Some(err.to_string()),
                    ..Default::default()
                },
            )
            .await;

        match result {
            Ok(_) => {
                let _ = self
                    .store
                    .append_execution_log(
                        *execution_id,
                        LogEntry::error(format!("Workflow execution gave up: {err}")),
                    )
                    .await;
                let _ = self.store.cancel_pending_nodes(*execution_id).await;
            }
            Err(EngineError::IllegalTransition { .. }) | Err(EngineError::NotFound) => {
                // Already terminal or gone; nothing to record.
            }
            Err(other) => {
                log::error!("failed to record exhaustion for {execution_id}: {other}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TaskBroker;
    use crate::db::memory::MemoryStore;
    use crate::db::models::{NodeStatus, WorkflowExecutionRecord};
    use crate::eventbus::EventBus;
    use crate::workflow::executor::ExecutorConfig;
    use crate::workflow::invoker::{EchoInvoker, HandlerRegistry};
    use crate::workflow::retry::RetryPolicy;
    use crate::workflow::spec::{EdgeSpec, NodeSpec, NodeType, WorkflowSpec};
    use serde_json::Value;

    fn spec(nodes: &[(&str, NodeType)], edges: &[(&str, &str)]) -> WorkflowSpec {
        WorkflowSpec {
            nodes: nodes
                .iter()
                .map(|(id, node_type)| NodeSpec {
                    id: id.to_string(),
                    node_type: *node_type,
                    name: None,
                    agent_id: None,
                    data: Value::Null,
                })
                .collect(),
            connections: edges
                .iter()
                .map(|(source, target)| EdgeSpec {
                    source: source.to_string(),
                    target: target.to_string(),
                })
                .collect(),
            settings: serde_json::Map::new(),
        }
    }

    fn harness() -> (
        Arc<MemoryStore>,
        Arc<InProcessBroker>,
        Arc<WorkerPool>,
        Uuid,
    ) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(64));
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            bus,
            Arc::new(EchoInvoker),
            Arc::new(HandlerRegistry::new()),
            ExecutorConfig {
                level_fanout: None,
                retry: RetryPolicy::immediate(),
            },
        ));
        let broker = Arc::new(InProcessBroker::new());
        let config = WorkerConfig {
            workers: 2,
            hard_timeout: Duration::from_secs(3600),
            soft_timeout: Duration::from_secs(3300),
            retention: RetentionConfig {
                completed_days: 30,
                failed_days: 7,
            },
        };
        let pool = Arc::new(WorkerPool::new(
            broker.clone(),
            executor,
            store.clone(),
            config,
        ));
        let user_id = Uuid::new_v4();
        (store, broker, pool, user_id)
    }

    async fn seed_execution(
        store: &MemoryStore,
        user_id: Uuid,
        workflow: WorkflowSpec,
    ) -> Uuid {
        use crate::db::models::NodeExecutionRecord;
        use crate::workflow::graph::DagResolver;

        let resolver = DagResolver::build(&workflow.nodes, &workflow.connections).unwrap();
        let levels = resolver.levels().unwrap();

        let execution = WorkflowExecutionRecord::new(Uuid::new_v4(), user_id, workflow.clone());
        let execution_id = execution.id;

        let mut nodes = Vec::new();
        for (level_idx, level) in levels.iter().enumerate() {
            for node_id in level {
                let node_spec = workflow.node(node_id).unwrap();
                let mut node = NodeExecutionRecord::new(
                    execution_id,
                    user_id,
                    node_id.clone(),
                    node_spec.display_name(),
                    node_spec.node_type,
                    level_idx as u32,
                );
                node.parent_node_ids = resolver.parents(node_id);
                node.child_node_ids = resolver.children(node_id);
                nodes.push(node);
            }
        }

        store.create_execution(execution, nodes).await.unwrap();
        execution_id
    }

    #[tokio::test]
    async fn worker_runs_enqueued_execution_to_completion() {
        let (store, broker, pool, user_id) = harness();
        let execution_id = seed_execution(
            &store,
            user_id,
            spec(
                &[("a", NodeType::Trigger), ("b", NodeType::Agent)],
                &[("a", "b")],
            ),
        )
        .await;

        broker
            .enqueue(
                JobPayload::RunWorkflow {
                    execution_id,
                    user_id,
                },
                5,
                None,
            )
            .await
            .unwrap();

        let handles = pool.spawn();

        // Wait for the worker to drain the job.
        let mut settled = false;
        for _ in 0..100 {
            let record = store.get_execution(execution_id, user_id).await.unwrap();
            if record.status.is_terminal() {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.abort();
        }

        assert!(settled, "execution never reached a terminal state");
        let record = store.get_execution(execution_id, user_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.completed_nodes, 2);

        let nodes = store.list_nodes(execution_id, user_id).await.unwrap();
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Completed));
    }

    #[tokio::test]
    async fn duplicate_dispatch_is_acked_without_damage() {
        let (store, broker, pool, user_id) = harness();
        let execution_id = seed_execution(
            &store,
            user_id,
            spec(&[("only", NodeType::Action)], &[]),
        )
        .await;

        let payload = JobPayload::RunWorkflow {
            execution_id,
            user_id,
        };
        broker.enqueue(payload.clone(), 5, None).await.unwrap();
        broker.enqueue(payload, 5, None).await.unwrap();

        let handles = pool.spawn();
        for _ in 0..100 {
            if broker.depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give the second delivery time to settle.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for handle in handles {
            handle.abort();
        }

        let record = store.get_execution(execution_id, user_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.completed_nodes, 1);
        assert_eq!(broker.depth(), 0);
    }
}
