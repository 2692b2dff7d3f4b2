//! Workspace states and the transactions each one requires.

use crate::error::{OrchestratorError, Result};
use crate::transaction::{TransactionId, TransactionRegistry};
use crate::workspace::{Workspace, WorkspaceStatus};
use std::collections::BTreeSet;

const RESERVING: &[TransactionId] = &[
    TransactionId::CreateServiceAccountRoles,
    TransactionId::CreateWorkspaceKeyId,
    TransactionId::CreateDataBucket,
    TransactionId::CreateOpenSearch,
    TransactionId::CreateIngestionPipeline,
];

const PROVISIONING: &[TransactionId] = &[
    TransactionId::CreateHelmRelease,
    TransactionId::CreateRoleBinding,
    TransactionId::EnsureWorkspacePodsRunning,
];

const ONBOARDING: &[TransactionId] = &[
    TransactionId::CreateMasterCredential,
    TransactionId::EnsureCredentialOnboarded,
    TransactionId::EnsureDiscoveryFinished,
    TransactionId::EnsureJobsRunning,
];

/// A processing stage of the workspace lifecycle.
pub trait State: Send + Sync {
    /// Transactions that must be done for this workspace before it can
    /// leave the processing status
    fn requirements(&self, workspace: &Workspace) -> BTreeSet<TransactionId>;

    fn processing_state_id(&self) -> WorkspaceStatus;

    fn finished_state_id(&self) -> WorkspaceStatus;

    /// Every transaction `requirements` can return, whatever the workspace
    /// attributes. Used to validate the table.
    fn declared(&self) -> BTreeSet<TransactionId>;
}

pub struct Reserving;

impl State for Reserving {
    fn requirements(&self, _workspace: &Workspace) -> BTreeSet<TransactionId> {
        self.declared()
    }

    fn processing_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Reserving
    }

    fn finished_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Reserved
    }

    fn declared(&self) -> BTreeSet<TransactionId> {
        RESERVING.iter().copied().collect()
    }
}

pub struct Provisioning;

impl State for Provisioning {
    fn requirements(&self, _workspace: &Workspace) -> BTreeSet<TransactionId> {
        self.declared()
    }

    fn processing_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Provisioning
    }

    fn finished_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::WaitingForCredential
    }

    fn declared(&self) -> BTreeSet<TransactionId> {
        RESERVING.iter().chain(PROVISIONING).copied().collect()
    }
}

/// Credential-dependent transactions are only required while a credential
/// is attached; without one this state settles on the provisioning set.
pub struct Onboarding;

impl State for Onboarding {
    fn requirements(&self, workspace: &Workspace) -> BTreeSet<TransactionId> {
        let mut required = Provisioning.declared();
        if workspace.has_credential() {
            required.extend(ONBOARDING.iter().copied());
        }
        required
    }

    fn processing_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Onboarding
    }

    fn finished_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Provisioned
    }

    fn declared(&self) -> BTreeSet<TransactionId> {
        RESERVING
            .iter()
            .chain(PROVISIONING)
            .chain(ONBOARDING)
            .copied()
            .collect()
    }
}

/// Everything not required here is rolled back. Analytics runs are drained
/// first so nothing they read disappears underneath them.
pub struct Deleting;

impl State for Deleting {
    fn requirements(&self, workspace: &Workspace) -> BTreeSet<TransactionId> {
        if workspace.analytics_job.is_some() {
            self.declared()
        } else {
            BTreeSet::new()
        }
    }

    fn processing_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Deleting
    }

    fn finished_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Deleted
    }

    fn declared(&self) -> BTreeSet<TransactionId> {
        BTreeSet::from([TransactionId::EnsureJobsFinished])
    }
}

/// Ordered list of processing states, looked up by workspace status.
pub struct StateTable {
    states: Vec<Box<dyn State>>,
}

impl StateTable {
    pub fn new(states: Vec<Box<dyn State>>) -> Self {
        Self { states }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(Reserving),
            Box::new(Provisioning),
            Box::new(Onboarding),
            Box::new(Deleting),
        ])
    }

    /// State owning `status` as its processing status. Resting and terminal
    /// statuses have none.
    pub fn for_status(&self, status: WorkspaceStatus) -> Option<&dyn State> {
        self.states
            .iter()
            .find(|state| state.processing_state_id() == status)
            .map(|state| state.as_ref())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Reject duplicate processing statuses, requirements on unregistered
    /// transactions, and requirement sets missing a prerequisite of one of
    /// their members.
    pub fn validate(&self, registry: &TransactionRegistry) -> Result<()> {
        let mut seen = BTreeSet::new();

        for state in &self.states {
            let status = state.processing_state_id();
            if !seen.insert(status) {
                return Err(OrchestratorError::Configuration(format!(
                    "state table lists processing status {} twice",
                    status
                )));
            }

            let declared = state.declared();
            for id in &declared {
                let transaction = registry.get(*id).map_err(|_| {
                    OrchestratorError::Configuration(format!(
                        "state {} requires unregistered transaction {}",
                        status, id
                    ))
                })?;

                if let Some(missing) = transaction
                    .requirements()
                    .iter()
                    .find(|requirement| !declared.contains(requirement))
                {
                    return Err(OrchestratorError::Configuration(format!(
                        "state {} requires {} but not its prerequisite {}",
                        status, id, missing
                    )));
                }
            }
        }

        Ok(())
    }
}
