pub mod executor;
pub mod graph;
pub mod invoker;
pub mod retry;
pub mod spec;

// Core exports
pub use executor::{ExecutorConfig, TerminalReport, WorkflowExecutor};
pub use graph::{DagResolver, GraphError};
pub use invoker::{AgentInvocation, AgentInvoker, EchoInvoker, HandlerRegistry, NodeHandler};
pub use retry::{RetryDecision, RetryPolicy};
pub use spec::{EdgeSpec, NodeSpec, NodeType, WorkflowSpec};
