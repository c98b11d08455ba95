use thiserror::Error;

use crate::workflow::graph::GraphError;

/// Unified error type for the orchestration core.
///
/// Every fallible operation in the engine funnels into this taxonomy so the
/// API layer can map errors to status codes and the retry classifier can
/// decide whether an attempt is worth repeating.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural problem in the submitted graph (duplicate node id,
    /// unknown edge endpoint, self-loop, multi-edge).
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),

    /// Topological validation failed; carries the residual set of nodes
    /// that never reached in-degree zero.
    #[error("cycle detected in workflow graph; unprocessed nodes: {unprocessed:?}")]
    CycleDetected { unprocessed: Vec<String> },

    /// A status change was attempted that the transition table forbids.
    #[error("illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Record missing or owned by another user. Callers cannot tell the
    /// two cases apart.
    #[error("not found")]
    NotFound,

    /// The retry budget for a node, execution, or broker job is consumed.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// Enqueue or acknowledge failed at the task broker.
    #[error("task broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The agent invoker reported an error for a node.
    #[error("agent invocation failed: {0}")]
    UpstreamFailure(String),

    /// A hard or soft execution timeout fired.
    #[error("execution timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The parent execution was cancelled while work was in flight.
    #[error("execution cancelled")]
    Cancelled,

    /// The execution store failed (connection loss, serialization, ...).
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Whether an operation that failed with this error may be retried.
    ///
    /// Transient external failures (upstream agents, broker, store,
    /// timeouts) are retryable; structural and permission-shaped errors
    /// are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamFailure(_)
                | EngineError::BrokerUnavailable(_)
                | EngineError::Timeout { .. }
                | EngineError::Store(_)
        )
    }

    pub fn illegal_transition(entity: &'static str, from: impl Into<String>, to: impl Into<String>) -> Self {
        EngineError::IllegalTransition {
            entity,
            from: from.into(),
            to: to.into(),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected { unprocessed } => EngineError::CycleDetected { unprocessed },
            other => EngineError::InvalidGraph(other.to_string()),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound,
            other => EngineError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(EngineError::UpstreamFailure("connection reset".into()).is_retryable());
        assert!(EngineError::Timeout { seconds: 30 }.is_retryable());
        assert!(EngineError::BrokerUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn structural_errors_are_fatal() {
        assert!(!EngineError::InvalidGraph("dangling edge".into()).is_retryable());
        assert!(!EngineError::NotFound.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::illegal_transition("execution", "completed", "running").is_retryable());
    }
}
