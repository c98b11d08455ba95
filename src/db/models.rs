use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::spec::{NodeType, WorkflowSpec};

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Transition table for workflow executions. `failed -> pending` is the
    /// retry path and must bump `retry_count`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Reserved: no executor rule currently produces it, but the state is
    /// accepted as terminal so external writers stay representable.
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NodeStatus::Pending),
            "running" => Some(NodeStatus::Running),
            "completed" => Some(NodeStatus::Completed),
            "failed" => Some(NodeStatus::Failed),
            "skipped" => Some(NodeStatus::Skipped),
            "cancelled" => Some(NodeStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One entry in an append-only execution log.
///
/// Entries are never reordered or deleted; extra structured fields are
/// flattened into the serialized object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Durable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub status: ExecutionStatus,
    /// Snapshot of the submitted graph; the executor re-derives levels
    /// from it so a worker can resume from the store alone.
    pub workflow_spec: WorkflowSpec,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub input_data: Value,
    pub output_data: Value,
    pub context: Value,
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub error_message: Option<String>,
    pub error_details: Value,
    pub execution_log: Vec<LogEntry>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub broker_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecutionRecord {
    pub fn new(workflow_id: Uuid, user_id: Uuid, spec: WorkflowSpec) -> Self {
        let now = Utc::now();
        let total_nodes = spec.node_count() as u32;
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            user_id,
            status: ExecutionStatus::Pending,
            workflow_spec: spec,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            input_data: empty_object(),
            output_data: empty_object(),
            context: empty_object(),
            total_nodes,
            completed_nodes: 0,
            failed_nodes: 0,
            error_message: None,
            error_details: empty_object(),
            execution_log: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            priority: 0,
            scheduled_at: None,
            broker_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.status == ExecutionStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_nodes == 0 {
            return 0.0;
        }
        (self.completed_nodes as f64 / self.total_nodes as f64) * 100.0
    }

    pub fn add_log_entry(&mut self, entry: LogEntry) {
        self.execution_log.push(entry);
    }

    pub fn calculate_duration(&mut self) {
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            self.duration_seconds = Some((completed - started).num_milliseconds() as f64 / 1000.0);
        }
    }
}

/// Durable record of one node within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub user_id: Uuid,
    /// Node id from the workflow definition.
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub input_data: Value,
    pub output_data: Value,
    pub agent_response: Option<String>,
    pub tokens_used: Option<u32>,
    pub model_used: Option<String>,
    pub tools_called: Vec<String>,
    pub tool_results: Value,
    pub error_message: Option<String>,
    pub error_details: Value,
    pub error_stack: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Level index assigned by the resolver; strictly greater than the
    /// order of every parent.
    pub execution_order: u32,
    pub parent_node_ids: Vec<String>,
    pub child_node_ids: Vec<String>,
    pub execution_log: Vec<LogEntry>,
    pub broker_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecutionRecord {
    pub fn new(
        workflow_execution_id: Uuid,
        user_id: Uuid,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        node_type: NodeType,
        execution_order: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_execution_id,
            agent_id: None,
            user_id,
            node_id: node_id.into(),
            node_name: node_name.into(),
            node_type,
            status: NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            input_data: empty_object(),
            output_data: empty_object(),
            agent_response: None,
            tokens_used: None,
            model_used: None,
            tools_called: Vec::new(),
            tool_results: empty_object(),
            error_message: None,
            error_details: empty_object(),
            error_stack: None,
            retry_count: 0,
            max_retries: 3,
            execution_order,
            parent_node_ids: Vec::new(),
            child_node_ids: Vec::new(),
            execution_log: Vec::new(),
            broker_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.status == NodeStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn add_log_entry(&mut self, entry: LogEntry) {
        self.execution_log.push(entry);
    }

    pub fn calculate_duration(&mut self) {
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            self.duration_seconds = Some((completed - started).num_milliseconds() as f64 / 1000.0);
        }
    }
}

/// Field updates applied together with (or independently of) a workflow
/// status transition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub output_data: Option<Value>,
    pub completed_nodes: Option<u32>,
    pub failed_nodes: Option<u32>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    /// Reset error fields to their empty defaults (the retry path).
    pub clear_error: bool,
    pub retry_count: Option<u32>,
    pub broker_task_id: Option<String>,
}

impl ExecutionPatch {
    pub fn apply(&self, record: &mut WorkflowExecutionRecord) {
        if let Some(v) = self.started_at {
            record.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            record.completed_at = Some(v);
        }
        if let Some(v) = self.duration_seconds {
            record.duration_seconds = Some(v);
        }
        if let Some(v) = &self.output_data {
            record.output_data = v.clone();
        }
        if let Some(v) = self.completed_nodes {
            record.completed_nodes = v;
        }
        if let Some(v) = self.failed_nodes {
            record.failed_nodes = v;
        }
        if self.clear_error {
            record.error_message = None;
            record.error_details = empty_object();
        }
        if let Some(v) = &self.error_message {
            record.error_message = Some(v.clone());
        }
        if let Some(v) = &self.error_details {
            record.error_details = v.clone();
        }
        if let Some(v) = self.retry_count {
            record.retry_count = v;
        }
        if let Some(v) = &self.broker_task_id {
            record.broker_task_id = Some(v.clone());
        }
        record.updated_at = Utc::now();
    }
}

/// Field updates for a node execution record.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub agent_response: Option<String>,
    pub tokens_used: Option<u32>,
    pub model_used: Option<String>,
    pub tools_called: Option<Vec<String>>,
    pub tool_results: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub error_stack: Option<String>,
    pub clear_error: bool,
    pub retry_count: Option<u32>,
    pub broker_task_id: Option<String>,
}

impl NodePatch {
    pub fn apply(&self, record: &mut NodeExecutionRecord) {
        if let Some(v) = self.started_at {
            record.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            record.completed_at = Some(v);
        }
        if let Some(v) = self.duration_seconds {
            record.duration_seconds = Some(v);
        }
        if let Some(v) = &self.input_data {
            record.input_data = v.clone();
        }
        if let Some(v) = &self.output_data {
            record.output_data = v.clone();
        }
        if let Some(v) = &self.agent_response {
            record.agent_response = Some(v.clone());
        }
        if let Some(v) = self.tokens_used {
            record.tokens_used = Some(v);
        }
        if let Some(v) = &self.model_used {
            record.model_used = Some(v.clone());
        }
        if let Some(v) = &self.tools_called {
            record.tools_called = v.clone();
        }
        if let Some(v) = &self.tool_results {
            record.tool_results = v.clone();
        }
        if self.clear_error {
            record.error_message = None;
            record.error_details = empty_object();
            record.error_stack = None;
        }
        if let Some(v) = &self.error_message {
            record.error_message = Some(v.clone());
        }
        if let Some(v) = &self.error_details {
            record.error_details = v.clone();
        }
        if let Some(v) = &self.error_stack {
            record.error_stack = Some(v.clone());
        }
        if let Some(v) = self.retry_count {
            record.retry_count = v;
        }
        if let Some(v) = &self.broker_task_id {
            record.broker_task_id = Some(v.clone());
        }
        record.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_transition_table() {
        use ExecutionStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn node_transition_table() {
        use NodeStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn progress_percentage_handles_empty_workflow() {
        let mut record =
            WorkflowExecutionRecord::new(Uuid::new_v4(), Uuid::new_v4(), WorkflowSpec::default());
        assert_eq!(record.progress_percentage(), 0.0);

        record.total_nodes = 4;
        record.completed_nodes = 1;
        assert!((record.progress_percentage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_eligibility() {
        let mut record =
            WorkflowExecutionRecord::new(Uuid::new_v4(), Uuid::new_v4(), WorkflowSpec::default());
        assert!(!record.can_retry());

        record.status = ExecutionStatus::Failed;
        assert!(record.can_retry());

        record.retry_count = record.max_retries;
        assert!(!record.can_retry());
    }

    #[test]
    fn log_entry_serializes_flattened_fields() {
        let entry = LogEntry::info("node completed")
            .with_field("node_id", Value::String("summarize".into()));
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["level"], "info");
        assert_eq!(json["message"], "node completed");
        assert_eq!(json["node_id"], "summarize");
    }

    #[test]
    fn patch_clear_error_resets_fields() {
        let mut record =
            WorkflowExecutionRecord::new(Uuid::new_v4(), Uuid::new_v4(), WorkflowSpec::default());
        record.error_message = Some("boom".into());
        record.error_details = serde_json::json!({"node": "b"});

        let patch = ExecutionPatch {
            clear_error: true,
            retry_count: Some(1),
            ..Default::default()
        };
        patch.apply(&mut record);

        assert!(record.error_message.is_none());
        assert_eq!(record.error_details, empty_object());
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn duration_is_computed_from_timestamps() {
        let mut record = NodeExecutionRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "a",
            "Node a",
            NodeType::Action,
            0,
        );
        let started = Utc::now();
        record.started_at = Some(started);
        record.completed_at = Some(started + chrono::Duration::milliseconds(1500));
        record.calculate_duration();
        assert_eq!(record.duration_seconds, Some(1.5));
    }
}
