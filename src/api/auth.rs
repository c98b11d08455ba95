use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::EngineError;
use crate::workflow::spec::WorkflowSpec;

/// Authentication seam.
///
/// Token issuance lives in an external service; the engine only needs to
/// resolve a bearer token to a principal. `None` means the token is
/// missing, expired or unknown.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Uuid>;
}

/// Static token table for tests and single-box deployments.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: DashMap<String, Uuid>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: Uuid) {
        self.tokens.insert(token.into(), user_id);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Uuid> {
        self.tokens.get(token).map(|entry| *entry.value())
    }
}

/// Workflow lookup seam.
///
/// Workflow CRUD is owned by the outer application; the execution API
/// only needs to resolve `workflow_id -> spec` under the caller's
/// ownership. A missing or foreign workflow reads as
/// [`EngineError::NotFound`].
#[async_trait]
pub trait WorkflowProvider: Send + Sync {
    async fn get(&self, workflow_id: Uuid, user_id: Uuid) -> Result<WorkflowSpec, EngineError>;
}

/// In-memory workflow registry for tests and the reference deployment.
#[derive(Default)]
pub struct MemoryWorkflowProvider {
    workflows: DashMap<Uuid, (Uuid, WorkflowSpec)>,
}

impl MemoryWorkflowProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow_id: Uuid, owner: Uuid, spec: WorkflowSpec) {
        self.workflows.insert(workflow_id, (owner, spec));
    }
}

#[async_trait]
impl WorkflowProvider for MemoryWorkflowProvider {
    async fn get(&self, workflow_id: Uuid, user_id: Uuid) -> Result<WorkflowSpec, EngineError> {
        match self.workflows.get(&workflow_id) {
            Some(entry) if entry.value().0 == user_id => Ok(entry.value().1.clone()),
            _ => Err(EngineError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_resolves_known_tokens() {
        let verifier = StaticTokenVerifier::new();
        let user_id = Uuid::new_v4();
        verifier.insert("secret", user_id);

        assert_eq!(verifier.verify("secret").await, Some(user_id));
        assert_eq!(verifier.verify("wrong").await, None);
    }

    #[tokio::test]
    async fn provider_masks_foreign_workflows() {
        let provider = MemoryWorkflowProvider::new();
        let owner = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();
        provider.insert(workflow_id, owner, WorkflowSpec::default());

        assert!(provider.get(workflow_id, owner).await.is_ok());
        assert!(matches!(
            provider.get(workflow_id, Uuid::new_v4()).await,
            Err(EngineError::NotFound)
        ));
    }
}
