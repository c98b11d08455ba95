use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::{JobPayload, TaskBroker};
use crate::config::EngineConfig;
use crate::db::models::{
    empty_object, ExecutionPatch, LogEntry, NodeExecutionRecord, WorkflowExecutionRecord,
};
use crate::db::{ExecutionFilter, ExecutionStore, Page};
use crate::error::EngineError;
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::graph::DagResolver;
use crate::workflow::spec::WorkflowSpec;

/// Caller-supplied parameters for a new execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInput {
    pub input_data: Option<Value>,
    pub context: Option<Value>,
    pub priority: Option<u8>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

/// Transport-agnostic operations over executions.
///
/// Validation and record materialization live here; the executor drives
/// state, and the optional broker decouples triggering from running.
/// With no broker configured, runs are spawned inline on the current
/// runtime.
pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<WorkflowExecutor>,
    broker: Option<Arc<dyn TaskBroker>>,
    default_max_retries: u32,
}

impl ExecutionService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        executor: Arc<WorkflowExecutor>,
        broker: Option<Arc<dyn TaskBroker>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            broker,
            default_max_retries: config.default_max_retries,
        }
    }

    /// Validate a workflow graph and materialize its execution records.
    ///
    /// Graph-structural failures (including cycles) are reported here and
    /// nothing is persisted. On success the execution is handed to the
    /// broker, or spawned inline when no broker is configured.
    pub async fn create_execution(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        spec: &WorkflowSpec,
        input: ExecutionInput,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let report = spec.validate()?;
        let resolver = DagResolver::build(&spec.nodes, &spec.connections)?;
        let levels = resolver.levels()?;

        let mut execution = WorkflowExecutionRecord::new(workflow_id, user_id, spec.clone());
        execution.input_data = input.input_data.unwrap_or_else(empty_object);
        execution.context = input.context.unwrap_or_else(empty_object);
        execution.priority = input.priority.unwrap_or(0).min(10);
        execution.scheduled_at = input.scheduled_at;
        execution.max_retries = input.max_retries.unwrap_or(self.default_max_retries);
        let execution_id = execution.id;
        let priority = execution.priority;
        let scheduled_at = execution.scheduled_at;

        let mut nodes = Vec::with_capacity(spec.node_count());
        for (level_idx, level) in levels.iter().enumerate() {
            for node_id in level {
                let node_spec = spec
                    .node(node_id)
                    .ok_or_else(|| EngineError::InvalidGraph(format!("unknown node {node_id}")))?;

                let mut node = NodeExecutionRecord::new(
                    execution_id,
                    user_id,
                    node_id.clone(),
                    node_spec.display_name(),
                    node_spec.node_type,
                    level_idx as u32,
                );
                node.agent_id = node_spec.agent_id;
                node.parent_node_ids = resolver.parents(node_id);
                node.child_node_ids = resolver.children(node_id);
                node.max_retries = execution.max_retries;
                nodes.push(node);
            }
        }

        self.store.create_execution(execution, nodes).await?;

        let _ = self
            .store
            .append_execution_log(execution_id, LogEntry::info("Workflow execution created"))
            .await;
        if !report.disconnected.is_empty() {
            let _ = self
                .store
                .append_execution_log(
                    execution_id,
                    LogEntry::new(
                        crate::db::models::LogLevel::Warning,
                        format!("Disconnected nodes in workflow: {:?}", report.disconnected),
                    ),
                )
                .await;
        }

        self.dispatch(execution_id, user_id, priority, scheduled_at)
            .await?;

        self.store.get_execution(execution_id, user_id).await
    }

    /// Hand an execution to the broker, or run it inline when no broker
    /// is configured.
    async fn dispatch(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
        priority: u8,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        match &self.broker {
            Some(broker) => {
                let task_id = broker
                    .enqueue(
                        JobPayload::RunWorkflow {
                            execution_id,
                            user_id,
                        },
                        priority,
                        scheduled_at,
                    )
                    .await?;
                self.store
                    .patch_execution(
                        execution_id,
                        ExecutionPatch {
                            broker_task_id: Some(task_id),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            None => {
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    if let Err(err) = executor.run(execution_id, user_id).await {
                        log::error!("inline execution {execution_id} failed: {err}");
                    }
                });
            }
        }
        Ok(())
    }

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        self.store.get_execution(execution_id, user_id).await
    }

    pub async fn list_executions(
        &self,
        user_id: Uuid,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<(Vec<WorkflowExecutionRecord>, u64), EngineError> {
        self.store.list_executions(user_id, filter, page).await
    }

    pub async fn list_nodes(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, EngineError> {
        self.store.list_nodes(execution_id, user_id).await
    }

    pub async fn get_node(
        &self,
        node_execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<NodeExecutionRecord, EngineError> {
        self.store.get_node(node_execution_id, user_id).await
    }

    pub async fn get_logs(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<LogEntry>, EngineError> {
        let record = self.store.get_execution(execution_id, user_id).await?;
        Ok(record.execution_log)
    }

    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        self.executor.cancel(execution_id, user_id).await
    }

    /// Re-arm a failed execution and dispatch it like a fresh one.
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let record = self.executor.prepare_retry(execution_id, user_id).await?;
        self.dispatch(execution_id, user_id, record.priority, None)
            .await?;
        self.store.get_execution(execution_id, user_id).await
    }

    /// Retry one failed node, via the broker's node queue when available.
    pub async fn retry_node(
        &self,
        node_execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), EngineError> {
        match &self.broker {
            Some(broker) => {
                // Eligibility is still checked here so the API answers
                // synchronously; the worker re-checks on delivery.
                let node = self.store.get_node(node_execution_id, user_id).await?;
                if !node.can_retry() {
                    return Err(EngineError::illegal_transition(
                        "node",
                        node.status.as_str(),
                        "pending",
                    ));
                }
                broker
                    .enqueue(
                        JobPayload::RetryNode {
                            node_execution_id,
                            user_id,
                        },
                        crate::broker::DEFAULT_PRIORITY,
                        None,
                    )
                    .await?;
                Ok(())
            }
            None => {
                self.executor.retry_node(node_execution_id, user_id).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::models::{ExecutionStatus, NodeStatus};
    use crate::eventbus::EventBus;
    use crate::workflow::executor::ExecutorConfig;
    use crate::workflow::invoker::{EchoInvoker, HandlerRegistry};
    use crate::workflow::retry::RetryPolicy;
    use crate::workflow::spec::{EdgeSpec, NodeSpec, NodeType};

    fn service() -> (Arc<MemoryStore>, ExecutionService) {
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
        let service = ExecutionService::new(store.clone(), executor, None, &EngineConfig::default());
        (store, service)
    }

    fn node(id: &str, node_type: NodeType) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type,
            name: None,
            agent_id: None,
            data: Value::Null,
        }
    }

    fn edge(source: &str, target: &str) -> EdgeSpec {
        EdgeSpec {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn create_materializes_one_record_per_node() {
        let (store, service) = service();
        let user_id = Uuid::new_v4();
        let spec = WorkflowSpec {
            nodes: vec![
                node("a", NodeType::Trigger),
                node("b", NodeType::Agent),
                node("c", NodeType::Action),
            ],
            connections: vec![edge("a", "b"), edge("b", "c")],
            settings: serde_json::Map::new(),
        };

        let record = service
            .create_execution(Uuid::new_v4(), user_id, &spec, ExecutionInput::default())
            .await
            .unwrap();

        assert_eq!(record.total_nodes, 3);
        assert_eq!(record.max_retries, 3);

        let nodes = store.list_nodes(record.id, user_id).await.unwrap();
        assert_eq!(nodes.len(), 3);

        let node_ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(node_ids, vec!["a", "b", "c"]);
        assert_eq!(nodes[0].execution_order, 0);
        assert_eq!(nodes[2].execution_order, 2);
        assert_eq!(nodes[1].parent_node_ids, vec!["a"]);
        assert_eq!(nodes[1].child_node_ids, vec!["c"]);

        // Level index strictly exceeds that of every parent.
        for node in &nodes {
            for parent_id in &node.parent_node_ids {
                let parent = nodes.iter().find(|n| &n.node_id == parent_id).unwrap();
                assert!(node.execution_order > parent.execution_order);
            }
        }
    }

    #[tokio::test]
    async fn cycle_persists_nothing() {
        let (store, service) = service();
        let user_id = Uuid::new_v4();
        let spec = WorkflowSpec {
            nodes: vec![node("a", NodeType::Action), node("b", NodeType::Action)],
            connections: vec![edge("a", "b"), edge("b", "a")],
            settings: serde_json::Map::new(),
        };

        let err = service
            .create_execution(Uuid::new_v4(), user_id, &spec, ExecutionInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));

        let (items, total) = store
            .list_executions(user_id, &ExecutionFilter::default(), Page::default())
            .await
            .unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn inline_dispatch_completes_the_run() {
        let (store, service) = service();
        let user_id = Uuid::new_v4();
        let spec = WorkflowSpec {
            nodes: vec![node("only", NodeType::Agent)],
            connections: Vec::new(),
            settings: serde_json::Map::new(),
        };

        let record = service
            .create_execution(Uuid::new_v4(), user_id, &spec, ExecutionInput::default())
            .await
            .unwrap();

        let mut status = record.status;
        for _ in 0..100 {
            status = store
                .get_execution(record.id, user_id)
                .await
                .unwrap()
                .status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, ExecutionStatus::Completed);

        let nodes = store.list_nodes(record.id, user_id).await.unwrap();
        assert_eq!(nodes[0].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn priority_is_clamped_and_input_recorded() {
        let (_store, service) = service();
        let user_id = Uuid::new_v4();
        let spec = WorkflowSpec {
            nodes: vec![node("only", NodeType::Action)],
            connections: Vec::new(),
            settings: serde_json::Map::new(),
        };

        let record = service
            .create_execution(
                Uuid::new_v4(),
                user_id,
                &spec,
                ExecutionInput {
                    input_data: Some(serde_json::json!({"q": "hello"})),
                    priority: Some(42),
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(record.priority, 10);
        assert_eq!(record.max_retries, 1);
        assert_eq!(record.input_data["q"], "hello");
    }
}
