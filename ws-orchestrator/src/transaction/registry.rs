use super::{
    CreateDataBucket, CreateHelmRelease, CreateIngestionPipeline, CreateMasterCredential,
    CreateOpenSearch, CreateRoleBinding, CreateServiceAccountRoles, CreateWorkspaceKeyId,
    EnsureCredentialOnboarded, EnsureDiscoveryFinished, EnsureJobsFinished, EnsureJobsRunning,
    EnsureWorkspacePodsRunning, Transaction, TransactionId,
};
use crate::error::{OrchestratorError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Maps each [`TransactionId`] to its implementation. Built once at startup.
#[derive(Clone, Default)]
pub struct TransactionRegistry {
    transactions: BTreeMap<TransactionId, Arc<dyn Transaction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in transaction
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(CreateServiceAccountRoles))
            .with(Arc::new(CreateWorkspaceKeyId))
            .with(Arc::new(CreateDataBucket))
            .with(Arc::new(CreateOpenSearch))
            .with(Arc::new(CreateIngestionPipeline))
            .with(Arc::new(CreateHelmRelease))
            .with(Arc::new(CreateRoleBinding))
            .with(Arc::new(EnsureWorkspacePodsRunning))
            .with(Arc::new(CreateMasterCredential))
            .with(Arc::new(EnsureCredentialOnboarded))
            .with(Arc::new(EnsureDiscoveryFinished))
            .with(Arc::new(EnsureJobsRunning))
            .with(Arc::new(EnsureJobsFinished))
    }

    pub fn with(mut self, transaction: Arc<dyn Transaction>) -> Self {
        self.register(transaction);
        self
    }

    /// Register an implementation, replacing any previous one with the same id
    pub fn register(&mut self, transaction: Arc<dyn Transaction>) {
        self.transactions.insert(transaction.id(), transaction);
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    pub fn get(&self, id: TransactionId) -> Result<Arc<dyn Transaction>> {
        self.transactions.get(&id).cloned().ok_or_else(|| {
            OrchestratorError::Configuration(format!("transaction {} is not registered", id))
        })
    }

    /// Check that every requirement is registered and the graph is acyclic
    pub fn validate(&self) -> Result<()> {
        for (id, transaction) in &self.transactions {
            for requirement in transaction.requirements() {
                if !self.contains(*requirement) {
                    return Err(OrchestratorError::Configuration(format!(
                        "transaction {} requires unregistered transaction {}",
                        id, requirement
                    )));
                }
            }
        }

        let all: BTreeSet<TransactionId> = self.transactions.keys().copied().collect();
        self.dependency_order(&all)?;

        Ok(())
    }

    /// Order `ids` so that every transaction comes after its (transitive)
    /// requirements. Ties are broken by id order.
    pub fn dependency_order(&self, ids: &BTreeSet<TransactionId>) -> Result<Vec<TransactionId>> {
        let mut visited = BTreeSet::new();
        let mut on_path = Vec::new();
        let mut order = Vec::with_capacity(ids.len());

        for id in ids {
            self.visit(*id, ids, &mut visited, &mut on_path, &mut order)?;
        }

        Ok(order)
    }

    fn visit(
        &self,
        id: TransactionId,
        wanted: &BTreeSet<TransactionId>,
        visited: &mut BTreeSet<TransactionId>,
        on_path: &mut Vec<TransactionId>,
        order: &mut Vec<TransactionId>,
    ) -> Result<()> {
        if visited.contains(&id) {
            return Ok(());
        }
        if on_path.contains(&id) {
            let cycle: Vec<&str> = on_path
                .iter()
                .skip_while(|step| **step != id)
                .map(|step| step.as_str())
                .collect();
            return Err(OrchestratorError::Configuration(format!(
                "transaction dependency cycle: {} -> {}",
                cycle.join(" -> "),
                id
            )));
        }

        on_path.push(id);
        for requirement in self.get(id)?.requirements() {
            self.visit(*requirement, wanted, visited, on_path, order)?;
        }
        on_path.pop();

        visited.insert(id);
        if wanted.contains(&id) {
            order.push(id);
        }

        Ok(())
    }

    /// Whether `dependent` needs `target` directly or through other requirements
    pub fn requires_transitively(&self, dependent: TransactionId, target: TransactionId) -> bool {
        let mut stack = vec![dependent];
        let mut seen = BTreeSet::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(transaction) = self.transactions.get(&current) else {
                continue;
            };
            for requirement in transaction.requirements() {
                if *requirement == target {
                    return true;
                }
                stack.push(*requirement);
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Outcome, TransactionContext};
    use crate::workspace::Workspace;
    use async_trait::async_trait;

    struct Declared(TransactionId, &'static [TransactionId]);

    #[async_trait]
    impl Transaction for Declared {
        fn id(&self) -> TransactionId {
            self.0
        }

        fn requirements(&self) -> &'static [TransactionId] {
            self.1
        }

        async fn apply(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
            Outcome::Done
        }

        async fn rollback(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
            Outcome::Done
        }
    }

    #[test]
    fn test_standard_registry_is_complete_and_acyclic() {
        let registry = TransactionRegistry::standard();
        for id in TransactionId::ALL {
            assert!(registry.contains(id), "{} missing", id);
        }
        registry.validate().expect("standard registry should validate");
    }

    #[test]
    fn test_dependency_order_puts_requirements_first() {
        let registry = TransactionRegistry::standard();
        let ids: BTreeSet<_> = TransactionId::ALL.into_iter().collect();
        let order = registry.dependency_order(&ids).unwrap();

        assert_eq!(order.len(), ids.len());
        for (position, id) in order.iter().enumerate() {
            for requirement in registry.get(*id).unwrap().requirements() {
                let required_at = order.iter().position(|x| x == requirement).unwrap();
                assert!(required_at < position, "{} ordered before {}", id, requirement);
            }
        }
    }

    #[test]
    fn test_dependency_order_of_subset_skips_unwanted() {
        let registry = TransactionRegistry::standard();
        let ids: BTreeSet<_> = [
            TransactionId::EnsureWorkspacePodsRunning,
            TransactionId::CreateServiceAccountRoles,
        ]
        .into_iter()
        .collect();

        let order = registry.dependency_order(&ids).unwrap();
        assert_eq!(
            order,
            vec![
                TransactionId::CreateServiceAccountRoles,
                TransactionId::EnsureWorkspacePodsRunning
            ]
        );
    }

    #[test]
    fn test_cycle_is_a_configuration_error() {
        let registry = TransactionRegistry::new()
            .with(Arc::new(Declared(
                TransactionId::CreateOpenSearch,
                &[TransactionId::CreateIngestionPipeline],
            )))
            .with(Arc::new(Declared(
                TransactionId::CreateIngestionPipeline,
                &[TransactionId::CreateOpenSearch],
            )));

        match registry.validate() {
            Err(OrchestratorError::Configuration(msg)) => assert!(msg.contains("cycle")),
            other => panic!("expected cycle error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_self_requirement_is_a_cycle() {
        let registry = TransactionRegistry::new().with(Arc::new(Declared(
            TransactionId::CreateRoleBinding,
            &[TransactionId::CreateRoleBinding],
        )));

        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_unregistered_requirement_is_rejected() {
        let registry = TransactionRegistry::new().with(Arc::new(Declared(
            TransactionId::CreateDataBucket,
            &[TransactionId::CreateServiceAccountRoles],
        )));

        assert!(matches!(
            registry.validate(),
            Err(OrchestratorError::Configuration(_))
        ));
        assert!(registry.get(TransactionId::CreateServiceAccountRoles).is_err());
    }

    #[test]
    fn test_requires_transitively() {
        let registry = TransactionRegistry::standard();
        assert!(registry.requires_transitively(
            TransactionId::EnsureJobsRunning,
            TransactionId::CreateServiceAccountRoles
        ));
        assert!(!registry.requires_transitively(
            TransactionId::CreateServiceAccountRoles,
            TransactionId::EnsureJobsRunning
        ));
        assert!(!registry.requires_transitively(
            TransactionId::CreateRoleBinding,
            TransactionId::CreateOpenSearch
        ));
    }
}
