//! Idempotent provisioning steps.
//!
//! A [`Transaction`] owns one external resource of a workspace. `apply`
//! brings it into existence and `rollback` removes it; both may be called any
//! number of times in any partially-completed external state, and both answer
//! with an [`Outcome`] instead of blocking until the remote side converges.

mod binding;
mod credential;
mod identity;
mod jobs;
mod pipeline;
pub mod registry;
mod release;
mod search;
mod secrets;
mod storage;

use crate::clients::{ClientError, Clients};
use crate::error::OrchestratorError;
use crate::workspace::{Workspace, WorkspaceStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use binding::CreateRoleBinding;
pub use credential::EnsureCredentialOnboarded;
pub use identity::CreateServiceAccountRoles;
pub use jobs::{EnsureDiscoveryFinished, EnsureJobsFinished, EnsureJobsRunning};
pub use pipeline::CreateIngestionPipeline;
pub use registry::TransactionRegistry;
pub use release::{release_values, CreateHelmRelease, EnsureWorkspacePodsRunning};
pub use search::CreateOpenSearch;
pub use secrets::{workspace_key_id, CreateMasterCredential, CreateWorkspaceKeyId};
pub use storage::CreateDataBucket;

/// Stable name of a transaction, persisted as the ledger key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionId {
    CreateServiceAccountRoles,
    CreateWorkspaceKeyId,
    CreateDataBucket,
    CreateOpenSearch,
    CreateIngestionPipeline,
    CreateHelmRelease,
    CreateRoleBinding,
    EnsureWorkspacePodsRunning,
    CreateMasterCredential,
    EnsureCredentialOnboarded,
    EnsureDiscoveryFinished,
    EnsureJobsRunning,
    EnsureJobsFinished,
}

impl TransactionId {
    pub const ALL: [TransactionId; 13] = [
        TransactionId::CreateServiceAccountRoles,
        TransactionId::CreateWorkspaceKeyId,
        TransactionId::CreateDataBucket,
        TransactionId::CreateOpenSearch,
        TransactionId::CreateIngestionPipeline,
        TransactionId::CreateHelmRelease,
        TransactionId::CreateRoleBinding,
        TransactionId::EnsureWorkspacePodsRunning,
        TransactionId::CreateMasterCredential,
        TransactionId::EnsureCredentialOnboarded,
        TransactionId::EnsureDiscoveryFinished,
        TransactionId::EnsureJobsRunning,
        TransactionId::EnsureJobsFinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionId::CreateServiceAccountRoles => "create_service_account_roles",
            TransactionId::CreateWorkspaceKeyId => "create_workspace_key_id",
            TransactionId::CreateDataBucket => "create_data_bucket",
            TransactionId::CreateOpenSearch => "create_open_search",
            TransactionId::CreateIngestionPipeline => "create_ingestion_pipeline",
            TransactionId::CreateHelmRelease => "create_helm_release",
            TransactionId::CreateRoleBinding => "create_role_binding",
            TransactionId::EnsureWorkspacePodsRunning => "ensure_workspace_pods_running",
            TransactionId::CreateMasterCredential => "create_master_credential",
            TransactionId::EnsureCredentialOnboarded => "ensure_credential_onboarded",
            TransactionId::EnsureDiscoveryFinished => "ensure_discovery_finished",
            TransactionId::EnsureJobsRunning => "ensure_jobs_running",
            TransactionId::EnsureJobsFinished => "ensure_jobs_finished",
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] OrchestratorError),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of one apply or rollback attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The resource is fully provisioned (or fully removed) and consistent
    Done,
    /// Work was started or is converging; ask again on a later tick
    NeedsTime,
    Failed(TransactionError),
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done)
    }

    /// Fold a fallible attempt into an outcome
    pub fn from_result(result: Result<Outcome, TransactionError>) -> Self {
        result.unwrap_or_else(Outcome::Failed)
    }
}

/// Names of the external resources owned by a workspace.
#[derive(Debug, Clone)]
pub struct Naming {
    pub namespace_prefix: String,
    pub ingress_domain: String,
    pub release_chart: String,
    pub job_image: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            namespace_prefix: "ws-".to_string(),
            ingress_domain: "workspaces.local".to_string(),
            release_chart: "oci://charts/workspace".to_string(),
            job_image: "registry.local/workspace-jobs:latest".to_string(),
        }
    }
}

impl Naming {
    pub const RELEASE_NAME: &'static str = "workspace";
    pub const DISCOVERY_JOB: &'static str = "discovery";
    pub const ANALYTICS_JOB: &'static str = "analytics";

    pub fn namespace(&self, workspace: &Workspace) -> String {
        format!("{}{}", self.namespace_prefix, workspace.id)
    }

    pub fn role(&self, workspace: &Workspace) -> String {
        format!("ws-{}-workload", workspace.id)
    }

    pub fn bucket(&self, workspace: &Workspace) -> String {
        format!("ws-{}-data", workspace.id)
    }

    pub fn domain(&self, workspace: &Workspace) -> String {
        format!("ws-{}", workspace.id)
    }

    pub fn pipeline(&self, workspace: &Workspace) -> String {
        format!("ws-{}-ingest", workspace.id)
    }

    pub fn key_secret(&self, workspace: &Workspace, key_id: &str) -> String {
        format!("ws-{}-key-{}", workspace.id, key_id)
    }

    pub fn master_credential_secret(&self, workspace: &Workspace) -> String {
        format!("ws-{}-master-credential", workspace.id)
    }

    pub fn host(&self, workspace: &Workspace) -> String {
        format!("{}.{}", workspace.id, self.ingress_domain)
    }
}

/// Everything a transaction may touch: collaborators, the workspace store
/// for attribute side channels, and resource naming.
#[derive(Clone)]
pub struct TransactionContext {
    pub clients: Clients,
    pub store: WorkspaceStore,
    pub naming: Naming,
}

#[async_trait]
pub trait Transaction: Send + Sync {
    fn id(&self) -> TransactionId;

    /// Transactions that must already be done before this one is applied
    fn requirements(&self) -> &'static [TransactionId];

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome;

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome;
}
