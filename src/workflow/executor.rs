use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::db::models::{
    ExecutionPatch, ExecutionStatus, LogEntry, NodeExecutionRecord, NodePatch, NodeStatus,
    WorkflowExecutionRecord,
};
use crate::db::ExecutionStore;
use crate::error::EngineError;
use crate::eventbus::events::ExecutionEvent;
use crate::eventbus::EventBus;

use super::graph::DagResolver;
use super::invoker::{AgentInvocation, AgentInvoker, HandlerRegistry};
use super::retry::{classify, RetryDecision, RetryPolicy};
use super::spec::{NodeSpec, NodeType};

/// Executor tuning knobs, usually derived from
/// [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Cap on concurrently running nodes within one level. `None`
    /// dispatches the whole level at once.
    pub level_fanout: Option<usize>,
    /// Backoff between node retry attempts.
    pub retry: RetryPolicy,
}

/// Summary of a finished run, handed back to the caller or the broker
/// worker.
#[derive(Debug, Clone)]
pub struct TerminalReport {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub duration_seconds: Option<f64>,
}

impl TerminalReport {
    fn from_record(record: &WorkflowExecutionRecord) -> Self {
        Self {
            execution_id: record.id,
            status: record.status,
            completed_nodes: record.completed_nodes,
            failed_nodes: record.failed_nodes,
            duration_seconds: record.duration_seconds,
        }
    }
}

#[derive(Debug)]
struct NodeOutcome {
    node_id: String,
    status: NodeStatus,
    error: Option<String>,
}

/// Drives a workflow execution from `pending` to a terminal state.
///
/// Levels come from the resolver, never from persisted order: the graph
/// snapshot on the execution record is re-planned on every run so a
/// worker restart needs nothing beyond the store. All nodes of a level
/// are dispatched concurrently and the level closes only when each of
/// them is terminal.
pub struct WorkflowExecutor {
    store: Arc<dyn ExecutionStore>,
    bus: Arc<EventBus>,
    invoker: Arc<dyn AgentInvoker>,
    handlers: Arc<HandlerRegistry>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        bus: Arc<EventBus>,
        invoker: Arc<dyn AgentInvoker>,
        handlers: Arc<HandlerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            invoker,
            handlers,
            config,
        }
    }

    /// Run a pending execution to completion.
    ///
    /// A second dispatch of the same execution (lost broker ack, operator
    /// retry of a live job) fails the `pending -> running` step with
    /// `IllegalTransition` and leaves the first run untouched.
    pub async fn run(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<TerminalReport, EngineError> {
        self.store.get_execution(execution_id, user_id).await?;

        let execution = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                ExecutionPatch {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        let _ = self
            .store
            .append_execution_log(execution_id, LogEntry::info("Workflow execution started"))
            .await;
        self.publish_progress(&execution, None);

        match self.drive(&execution, user_id).await {
            Ok(report) => Ok(report),
            Err(err) => {
                log::error!("execution {execution_id} aborted: {err}");
                let _ = self
                    .fail_execution(execution_id, user_id, err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        execution: &WorkflowExecutionRecord,
        user_id: Uuid,
    ) -> Result<TerminalReport, EngineError> {
        let resolver = DagResolver::build(
            &execution.workflow_spec.nodes,
            &execution.workflow_spec.connections,
        )?;
        let levels = resolver.levels()?;

        for (level_idx, level) in levels.iter().enumerate() {
            // Cooperative cancellation: the parent status is re-read at
            // every level barrier.
            let current = self.store.get_execution(execution.id, user_id).await?;
            if current.status == ExecutionStatus::Cancelled {
                log::info!(
                    "execution {} cancelled before level {}",
                    execution.id,
                    level_idx
                );
                return Ok(TerminalReport::from_record(&current));
            }

            let _ = self
                .store
                .append_execution_log(
                    execution.id,
                    LogEntry::info(format!(
                        "Executing level {}/{} with {} nodes",
                        level_idx + 1,
                        levels.len(),
                        level.len()
                    )),
                )
                .await;

            let outcomes = self.run_level(&current, level).await;

            let updated = self.refresh_counters(execution.id, user_id).await?;

            if outcomes.iter().any(|o| o.status == NodeStatus::Failed) {
                let first_error = outcomes
                    .iter()
                    .find(|o| o.status == NodeStatus::Failed)
                    .and_then(|o| o.error.clone())
                    .unwrap_or_else(|| "node execution failed".to_string());
                return self.fail_execution(execution.id, user_id, first_error).await;
            }

            let current_node = outcomes
                .iter()
                .rev()
                .find(|o| o.status == NodeStatus::Completed)
                .map(|o| o.node_id.clone());
            self.publish_progress(&updated, current_node);
        }

        self.finish_completed(execution.id, user_id).await
    }

    /// Dispatch every node of a level concurrently and wait for all of
    /// them to reach a terminal node status.
    async fn run_level(
        &self,
        execution: &WorkflowExecutionRecord,
        level: &[String],
    ) -> Vec<NodeOutcome> {
        let semaphore = self
            .config
            .level_fanout
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut handles = Vec::with_capacity(level.len());
        for node_id in level {
            let store = self.store.clone();
            let bus = self.bus.clone();
            let invoker = self.invoker.clone();
            let handlers = self.handlers.clone();
            let policy = self.config.retry.clone();
            let semaphore = semaphore.clone();
            let execution_id = execution.id;
            let context = execution.context.clone();
            let node_spec = execution.workflow_spec.node(node_id).cloned();
            let node_id_owned = node_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = match &semaphore {
                    Some(s) => s.acquire().await.ok(),
                    None => None,
                };
                process_node(
                    store,
                    bus,
                    invoker,
                    handlers,
                    policy,
                    execution_id,
                    context,
                    node_spec,
                    node_id_owned,
                )
                .await
            });
            handles.push((node_id.clone(), handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (node_id, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    log::error!("node {node_id} task panicked: {join_err}");
                    let error = format!("node task panicked: {join_err}");
                    let _ = self
                        .mark_node_failed_after_panic(execution.id, &node_id, &error)
                        .await;
                    outcomes.push(NodeOutcome {
                        node_id,
                        status: NodeStatus::Failed,
                        error: Some(error),
                    });
                }
            }
        }
        outcomes
    }

    /// Cancel a pending or running execution.
    ///
    /// Terminal executions answer `IllegalTransition` and are left
    /// untouched. In-flight nodes finish on their own; pending ones are
    /// cancelled here and the level loop stops at its next barrier.
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let execution = self.store.get_execution(execution_id, user_id).await?;

        let completed_at = Utc::now();
        let record = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Cancelled,
                ExecutionPatch {
                    completed_at: Some(completed_at),
                    duration_seconds: execution
                        .started_at
                        .map(|started| duration_seconds(started, completed_at)),
                    ..Default::default()
                },
            )
            .await?;

        let _ = self
            .store
            .append_execution_log(
                execution_id,
                LogEntry::info("Workflow execution cancelled by user"),
            )
            .await;
        self.store.cancel_pending_nodes(execution_id).await?;
        self.publish_progress(&record, None);

        Ok(record)
    }

    /// Re-arm a failed execution and run it again.
    pub async fn retry_workflow(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<TerminalReport, EngineError> {
        self.prepare_retry(execution_id, user_id).await?;
        self.run(execution_id, user_id).await
    }

    /// Reset a failed execution to `pending` without running it, so the
    /// caller can hand it to the broker instead.
    ///
    /// The retry bumps `retry_count`, clears error fields and re-arms
    /// failed and auto-cancelled child nodes; the execution log is
    /// preserved.
    pub async fn prepare_retry(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let execution = self.store.get_execution(execution_id, user_id).await?;

        if execution.status != ExecutionStatus::Failed {
            return Err(EngineError::illegal_transition(
                "execution",
                execution.status.as_str(),
                ExecutionStatus::Pending.as_str(),
            ));
        }
        if execution.retry_count >= execution.max_retries {
            return Err(EngineError::RetryExhausted {
                attempts: execution.retry_count,
            });
        }

        let record = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Failed],
                ExecutionStatus::Pending,
                ExecutionPatch {
                    retry_count: Some(execution.retry_count + 1),
                    clear_error: true,
                    ..Default::default()
                },
            )
            .await?;
        let _ = self
            .store
            .append_execution_log(
                execution_id,
                LogEntry::info(format!(
                    "Workflow execution retry #{}",
                    record.retry_count
                )),
            )
            .await;

        self.store.reset_nodes_for_retry(execution_id).await?;
        self.refresh_counters(execution_id, user_id).await
    }

    /// Retry a single failed node and reconcile the parent's counters.
    pub async fn retry_node(
        &self,
        node_execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<NodeExecutionRecord, EngineError> {
        let node = self.store.get_node(node_execution_id, user_id).await?;

        if node.status != NodeStatus::Failed {
            return Err(EngineError::illegal_transition(
                "node",
                node.status.as_str(),
                NodeStatus::Pending.as_str(),
            ));
        }
        if !node.can_retry() {
            return Err(EngineError::RetryExhausted {
                attempts: node.retry_count,
            });
        }

        let execution = self
            .store
            .get_execution(node.workflow_execution_id, user_id)
            .await?;

        self.store
            .transition_node(
                node_execution_id,
                &[NodeStatus::Failed],
                NodeStatus::Pending,
                NodePatch {
                    retry_count: Some(node.retry_count + 1),
                    clear_error: true,
                    ..Default::default()
                },
            )
            .await?;
        let _ = self
            .store
            .append_node_log(
                node_execution_id,
                LogEntry::info(format!("Node execution retry #{}", node.retry_count + 1)),
            )
            .await;

        let node_spec = execution.workflow_spec.node(&node.node_id).cloned();
        process_node(
            self.store.clone(),
            self.bus.clone(),
            self.invoker.clone(),
            self.handlers.clone(),
            self.config.retry.clone(),
            execution.id,
            execution.context.clone(),
            node_spec,
            node.node_id.clone(),
        )
        .await;

        self.refresh_counters(execution.id, user_id).await?;
        self.store.get_node(node_execution_id, user_id).await
    }

    /// Graceful abort used by the worker's soft timeout: the parent is
    /// failed with the given reason and unfinished nodes are cancelled.
    pub async fn abort(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<TerminalReport, EngineError> {
        self.fail_execution(execution_id, user_id, reason.into())
            .await
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
        error: String,
    ) -> Result<TerminalReport, EngineError> {
        let execution = self.store.get_execution(execution_id, user_id).await?;
        if execution.status.is_terminal() {
            return Ok(TerminalReport::from_record(&execution));
        }

        let completed_at = Utc::now();
        let record = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Failed,
                ExecutionPatch {
                    completed_at: Some(completed_at),
                    duration_seconds: execution
                        .started_at
                        .map(|started| duration_seconds(started, completed_at)),
                    error_message: Some(error.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let _ = self
            .store
            .append_execution_log(
                execution_id,
                LogEntry::error(format!("Workflow execution failed: {error}")),
            )
            .await;
        self.store.cancel_pending_nodes(execution_id).await?;
        self.publish_progress(&record, None);

        log::warn!("execution {execution_id} failed: {error}");
        Ok(TerminalReport::from_record(&record))
    }

    async fn finish_completed(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<TerminalReport, EngineError> {
        let execution = self.store.get_execution(execution_id, user_id).await?;
        let completed_at = Utc::now();

        let record = match self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Completed,
                ExecutionPatch {
                    completed_at: Some(completed_at),
                    duration_seconds: execution
                        .started_at
                        .map(|started| duration_seconds(started, completed_at)),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(record) => record,
            Err(EngineError::IllegalTransition { .. }) => {
                // A cancel can race the final level; the cancel wins.
                let current = self.store.get_execution(execution_id, user_id).await?;
                if current.status == ExecutionStatus::Cancelled {
                    return Ok(TerminalReport::from_record(&current));
                }
                return Err(EngineError::illegal_transition(
                    "execution",
                    current.status.as_str(),
                    ExecutionStatus::Completed.as_str(),
                ));
            }
            Err(err) => return Err(err),
        };

        let _ = self
            .store
            .append_execution_log(
                execution_id,
                LogEntry::info("Workflow execution completed successfully"),
            )
            .await;

        self.bus.publish(&ExecutionEvent::ExecutionUpdate {
            execution_id,
            status: record.status,
            progress_percentage: 100.0,
            completed_nodes: record.completed_nodes,
            total_nodes: record.total_nodes,
            current_node: None,
        });

        log::info!(
            "execution {execution_id} completed in {:?}s",
            record.duration_seconds
        );
        Ok(TerminalReport::from_record(&record))
    }

    /// Reconcile parent counters from the child records.
    async fn refresh_counters(
        &self,
        execution_id: Uuid,
        user_id: Uuid,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let nodes = self.store.list_nodes(execution_id, user_id).await?;
        let completed = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .count() as u32;
        let failed = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .count() as u32;

        self.store
            .patch_execution(
                execution_id,
                ExecutionPatch {
                    completed_nodes: Some(completed),
                    failed_nodes: Some(failed),
                    ..Default::default()
                },
            )
            .await
    }

    async fn mark_node_failed_after_panic(
        &self,
        execution_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let node = self.store.find_node(execution_id, node_id).await?;
        if node.status.is_terminal() {
            return Ok(());
        }
        let patch = NodePatch {
            completed_at: Some(Utc::now()),
            error_message: Some(error.to_string()),
            ..Default::default()
        };
        self.store
            .transition_node(node.id, &[NodeStatus::Running], NodeStatus::Failed, patch)
            .await?;
        Ok(())
    }

    fn publish_progress(&self, record: &WorkflowExecutionRecord, current_node: Option<String>) {
        self.bus.publish(&ExecutionEvent::ExecutionUpdate {
            execution_id: record.id,
            status: record.status,
            progress_percentage: record.progress_percentage(),
            completed_nodes: record.completed_nodes,
            total_nodes: record.total_nodes,
            current_node,
        });
    }
}

/// Execute one node to a terminal status, retrying in place while the
/// record's budget and the error class allow it.
#[allow(clippy::too_many_arguments)]
async fn process_node(
    store: Arc<dyn ExecutionStore>,
    bus: Arc<EventBus>,
    invoker: Arc<dyn AgentInvoker>,
    handlers: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    execution_id: Uuid,
    context: Value,
    node_spec: Option<NodeSpec>,
    node_id: String,
) -> NodeOutcome {
    let record = match store.find_node(execution_id, &node_id).await {
        Ok(record) => record,
        Err(err) => {
            return NodeOutcome {
                node_id,
                status: NodeStatus::Failed,
                error: Some(err.to_string()),
            }
        }
    };

    // Terminal nodes are left alone; a redelivered or retried run simply
    // skips over them.
    if record.status.is_terminal() {
        return NodeOutcome {
            node_id,
            status: record.status,
            error: record.error_message,
        };
    }

    let input = match compose_input(&store, execution_id, &record).await {
        Ok(input) => input,
        Err(err) => {
            return NodeOutcome {
                node_id,
                status: NodeStatus::Failed,
                error: Some(err.to_string()),
            }
        }
    };

    let mut node = record;
    loop {
        let started_at = Utc::now();
        node = match store
            .transition_node(
                node.id,
                &[NodeStatus::Pending],
                NodeStatus::Running,
                NodePatch {
                    started_at: Some(started_at),
                    input_data: Some(input.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(node) => node,
            Err(err) => {
                // Typically a concurrent cancel; report whatever state
                // the record is in now.
                let status = store
                    .find_node(execution_id, &node_id)
                    .await
                    .map(|n| n.status)
                    .unwrap_or(NodeStatus::Failed);
                return NodeOutcome {
                    node_id,
                    status,
                    error: Some(err.to_string()),
                };
            }
        };

        let _ = store
            .append_node_log(node.id, LogEntry::info("Node execution started"))
            .await;
        publish_node_update(&bus, &node, Some("Node execution started".to_string()));

        let result = match &node_spec {
            Some(spec) if spec.node_type == NodeType::Agent => {
                invoker.invoke(spec, &input, &context).await
            }
            Some(spec) => handlers
                .handler_for(spec.node_type)
                .handle(spec, &input, &context)
                .await
                .map(|output| AgentInvocation {
                    output_data: output,
                    agent_response: None,
                    tokens_used: None,
                    model_used: None,
                    tools_called: Vec::new(),
                    tool_results: json!({}),
                }),
            None => Err(EngineError::InvalidGraph(format!(
                "node {node_id} is missing from the workflow spec"
            ))),
        };

        match result {
            Ok(invocation) => {
                let completed_at = Utc::now();
                let patch = NodePatch {
                    completed_at: Some(completed_at),
                    duration_seconds: Some(duration_seconds(started_at, completed_at)),
                    output_data: Some(invocation.output_data),
                    agent_response: invocation.agent_response,
                    tokens_used: invocation.tokens_used,
                    model_used: invocation.model_used,
                    tools_called: Some(invocation.tools_called),
                    tool_results: Some(invocation.tool_results),
                    ..Default::default()
                };

                match store
                    .transition_node(node.id, &[NodeStatus::Running], NodeStatus::Completed, patch)
                    .await
                {
                    Ok(completed) => {
                        let _ = store
                            .append_node_log(
                                completed.id,
                                LogEntry::info("Node execution completed"),
                            )
                            .await;
                        publish_node_update(
                            &bus,
                            &completed,
                            Some("Node execution completed".to_string()),
                        );
                        return NodeOutcome {
                            node_id,
                            status: NodeStatus::Completed,
                            error: None,
                        };
                    }
                    Err(err) => {
                        return NodeOutcome {
                            node_id,
                            status: NodeStatus::Failed,
                            error: Some(err.to_string()),
                        }
                    }
                }
            }
            Err(err) => {
                let completed_at = Utc::now();
                let patch = NodePatch {
                    completed_at: Some(completed_at),
                    duration_seconds: Some(duration_seconds(started_at, completed_at)),
                    error_message: Some(err.to_string()),
                    error_details: Some(json!({
                        "error": err.to_string(),
                        "retryable": err.is_retryable(),
                    })),
                    ..Default::default()
                };

                let failed = match store
                    .transition_node(node.id, &[NodeStatus::Running], NodeStatus::Failed, patch)
                    .await
                {
                    Ok(failed) => failed,
                    Err(transition_err) => {
                        return NodeOutcome {
                            node_id,
                            status: NodeStatus::Failed,
                            error: Some(transition_err.to_string()),
                        }
                    }
                };
                let _ = store
                    .append_node_log(
                        failed.id,
                        LogEntry::error(format!("Node execution failed: {err}")),
                    )
                    .await;

                match classify(&policy, &err, failed.retry_count, failed.max_retries) {
                    RetryDecision::Retry { delay, attempt } => {
                        log::warn!(
                            "node {node_id} attempt {attempt} failed: {err}; retrying in {delay:?}"
                        );
                        node = match store
                            .transition_node(
                                failed.id,
                                &[NodeStatus::Failed],
                                NodeStatus::Pending,
                                NodePatch {
                                    retry_count: Some(attempt),
                                    clear_error: true,
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            Ok(node) => node,
                            Err(transition_err) => {
                                return NodeOutcome {
                                    node_id,
                                    status: NodeStatus::Failed,
                                    error: Some(transition_err.to_string()),
                                }
                            }
                        };
                        let _ = store
                            .append_node_log(
                                node.id,
                                LogEntry::info(format!("Node execution retry #{attempt}")),
                            )
                            .await;
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                    RetryDecision::Fatal | RetryDecision::Exhausted { .. } => {
                        publish_node_update(&bus, &failed, Some(err.to_string()));
                        return NodeOutcome {
                            node_id,
                            status: NodeStatus::Failed,
                            error: Some(err.to_string()),
                        };
                    }
                }
            }
        }
    }
}

/// Input for a node: a map from each parent node id to that parent's
/// output. Skipped parents contribute an empty object.
async fn compose_input(
    store: &Arc<dyn ExecutionStore>,
    execution_id: Uuid,
    node: &NodeExecutionRecord,
) -> Result<Value, EngineError> {
    let mut input = Map::new();
    for parent_id in &node.parent_node_ids {
        let parent = store.find_node(execution_id, parent_id).await?;
        let value = match parent.status {
            NodeStatus::Skipped => Value::Object(Map::new()),
            _ => parent.output_data,
        };
        input.insert(parent_id.clone(), value);
    }
    Ok(Value::Object(input))
}

fn publish_node_update(bus: &EventBus, node: &NodeExecutionRecord, message: Option<String>) {
    bus.publish(&ExecutionEvent::NodeUpdate {
        execution_id: node.workflow_execution_id,
        node_execution_id: node.id,
        node_id: node.node_id.clone(),
        node_name: node.node_name.clone(),
        status: node.status,
        message,
    });
}

fn duration_seconds(started: DateTime<Utc>, completed: DateTime<Utc>) -> f64 {
    (completed - started).num_milliseconds() as f64 / 1000.0
}
