use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::models::{ExecutionStatus, NodeStatus};

/// Events published by the executor and service layers for real-time
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Workflow-level status or progress change.
    ExecutionUpdate {
        execution_id: Uuid,
        status: ExecutionStatus,
        progress_percentage: f64,
        completed_nodes: u32,
        total_nodes: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_node: Option<String>,
    },

    /// Node-level status change.
    NodeUpdate {
        execution_id: Uuid,
        node_execution_id: Uuid,
        node_id: String,
        node_name: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Workflow CRUD event relayed for `workflow:<id>` subscribers.
    WorkflowUpdate {
        workflow_id: Uuid,
        action: String,
        data: Value,
    },
}

impl ExecutionEvent {
    /// Room this event fans out to.
    pub fn room(&self) -> String {
        match self {
            ExecutionEvent::ExecutionUpdate { execution_id, .. }
            | ExecutionEvent::NodeUpdate { execution_id, .. } => execution_room(*execution_id),
            ExecutionEvent::WorkflowUpdate { workflow_id, .. } => workflow_room(*workflow_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionUpdate { .. } => "execution_update",
            ExecutionEvent::NodeUpdate { .. } => "node_update",
            ExecutionEvent::WorkflowUpdate { .. } => "workflow_update",
        }
    }

    /// Event subtype carried in the envelope.
    pub fn subtype(&self) -> String {
        match self {
            ExecutionEvent::ExecutionUpdate { .. } | ExecutionEvent::NodeUpdate { .. } => {
                "status_changed".to_string()
            }
            ExecutionEvent::WorkflowUpdate { action, .. } => action.clone(),
        }
    }

    /// Whether the event closes its execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionUpdate { status, .. } if status.is_terminal()
        )
    }

    /// Wire envelope sent to subscribers:
    /// `{type, event, data, timestamp}` with a UTC ISO-8601 timestamp.
    pub fn to_message(&self) -> Value {
        let data = match self {
            ExecutionEvent::WorkflowUpdate { data, .. } => data.clone(),
            other => match serde_json::to_value(other) {
                Ok(Value::Object(mut map)) => {
                    map.remove("type");
                    Value::Object(map)
                }
                _ => Value::Null,
            },
        };

        json!({
            "type": self.kind(),
            "event": self.subtype(),
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

pub fn execution_room(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

pub fn workflow_room(workflow_id: Uuid) -> String {
    format!("workflow:{workflow_id}")
}

pub fn user_room(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_update_envelope_shape() {
        let execution_id = Uuid::new_v4();
        let event = ExecutionEvent::ExecutionUpdate {
            execution_id,
            status: ExecutionStatus::Running,
            progress_percentage: 33.3,
            completed_nodes: 1,
            total_nodes: 3,
            current_node: Some("a".to_string()),
        };

        assert_eq!(event.room(), format!("execution:{execution_id}"));
        assert!(!event.is_terminal());

        let message = event.to_message();
        assert_eq!(message["type"], "execution_update");
        assert_eq!(message["event"], "status_changed");
        assert_eq!(message["data"]["status"], "running");
        assert_eq!(message["data"]["completed_nodes"], 1);
        assert_eq!(message["data"]["current_node"], "a");
        assert!(message["data"].get("type").is_none());
        assert!(message["timestamp"].is_string());
    }

    #[test]
    fn terminal_detection() {
        let event = ExecutionEvent::ExecutionUpdate {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Completed,
            progress_percentage: 100.0,
            completed_nodes: 3,
            total_nodes: 3,
            current_node: None,
        };
        assert!(event.is_terminal());

        let node_event = ExecutionEvent::NodeUpdate {
            execution_id: Uuid::new_v4(),
            node_execution_id: Uuid::new_v4(),
            node_id: "a".to_string(),
            node_name: "Node a".to_string(),
            status: NodeStatus::Completed,
            message: None,
        };
        assert!(!node_event.is_terminal());
    }

    #[test]
    fn workflow_update_carries_action_as_subtype() {
        let workflow_id = Uuid::new_v4();
        let event = ExecutionEvent::WorkflowUpdate {
            workflow_id,
            action: "published".to_string(),
            data: json!({"workflow_id": workflow_id}),
        };

        let message = event.to_message();
        assert_eq!(message["type"], "workflow_update");
        assert_eq!(message["event"], "published");
        assert_eq!(event.room(), format!("workflow:{workflow_id}"));
    }
}
