use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::EngineError;

use super::spec::{NodeSpec, NodeType};

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub output_data: Value,
    pub agent_response: Option<String>,
    pub tokens_used: Option<u32>,
    pub model_used: Option<String>,
    pub tools_called: Vec<String>,
    pub tool_results: Value,
}

/// Opaque capability performing an agent node's computation.
///
/// The engine never inspects agent configuration; it hands the node spec,
/// the composed parent inputs, and the shared workflow context to the
/// invoker and records whatever comes back.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        node: &NodeSpec,
        input: &Value,
        context: &Value,
    ) -> Result<AgentInvocation, EngineError>;
}

/// Deterministic null invoker.
///
/// Echoes its input back as output. Sufficient to exercise every executor
/// invariant in tests and offline deployments.
#[derive(Debug, Default, Clone)]
pub struct EchoInvoker;

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(
        &self,
        node: &NodeSpec,
        input: &Value,
        context: &Value,
    ) -> Result<AgentInvocation, EngineError> {
        Ok(AgentInvocation {
            output_data: json!({
                "status": "completed",
                "node_id": node.id,
                "input_data": input,
                "context": context,
            }),
            agent_response: Some(format!("echo: {}", node.display_name())),
            tokens_used: Some(0),
            model_used: Some("echo".to_string()),
            tools_called: Vec::new(),
            tool_results: json!({}),
        })
    }
}

/// Handler for non-agent node types.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(
        &self,
        node: &NodeSpec,
        input: &Value,
        context: &Value,
    ) -> Result<Value, EngineError>;
}

/// The identity handler: passes composed input through unchanged.
#[derive(Debug, Default, Clone)]
pub struct IdentityHandler;

#[async_trait]
impl NodeHandler for IdentityHandler {
    async fn handle(
        &self,
        _node: &NodeSpec,
        input: &Value,
        _context: &Value,
    ) -> Result<Value, EngineError> {
        Ok(json!({
            "status": "completed",
            "input": input,
        }))
    }
}

/// Registry binding node types to handlers.
///
/// Ships with the identity handler for every non-agent type; deployments
/// register richer handlers per type.
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
    fallback: Arc<dyn NodeHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(IdentityHandler),
        }
    }

    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type, handler);
    }

    pub fn handler_for(&self, node_type: NodeType) -> Arc<dyn NodeHandler> {
        self.handlers
            .get(&node_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
