//! Operations that move a workspace between lifecycle stages on behalf of a
//! tenant. They only touch the workspace row; the reconciler does the rest.

use crate::clients::SecretVault;
use crate::error::{OrchestratorError, Result};
use crate::workspace::{Workspace, WorkspaceStatus, WorkspaceStore, WorkspaceTier};
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct WorkspaceLifecycle {
    store: WorkspaceStore,
    vault: Arc<dyn SecretVault>,
}

impl WorkspaceLifecycle {
    pub fn new(store: WorkspaceStore, vault: Arc<dyn SecretVault>) -> Self {
        Self { store, vault }
    }

    /// Take the oldest reserved workspace for `owner`
    #[instrument(skip(self))]
    pub async fn claim(&self, name: &str, owner: &str, tier: WorkspaceTier) -> Result<Workspace> {
        let workspace = self.store.claim_reserved(name, owner, tier).await?;
        info!(workspace_id = %workspace.id, owner = %owner, "Workspace claimed");
        Ok(workspace)
    }

    /// Store the tenant's cloud credential, encrypted, and start onboarding
    /// unless the workspace is already onboarding or being deleted.
    #[instrument(skip(self, raw_credential))]
    pub async fn attach_credential(&self, id: &str, raw_credential: &str) -> Result<Workspace> {
        let workspace = self.store.get_workspace(id).await?;
        ensure_not_deleted(&workspace)?;

        let blob = self.vault.encrypt(raw_credential.as_bytes()).await?;
        self.store.set_cloud_credential(id, Some(blob.as_str())).await?;

        if self
            .move_status(
                id,
                &[
                    WorkspaceStatus::Provisioning,
                    WorkspaceStatus::WaitingForCredential,
                    WorkspaceStatus::Provisioned,
                ],
                WorkspaceStatus::Onboarding,
            )
            .await?
        {
            info!(workspace_id = %id, "Credential attached, onboarding");
        }

        self.store.get_workspace(id).await
    }

    /// Forget the tenant's credential. Onboarded workspaces go back through
    /// provisioning, which rolls the credential transactions back.
    #[instrument(skip(self))]
    pub async fn detach_credential(&self, id: &str) -> Result<Workspace> {
        let workspace = self.store.get_workspace(id).await?;
        ensure_not_deleted(&workspace)?;

        self.store.set_cloud_credential(id, None).await?;

        if self
            .move_status(
                id,
                &[WorkspaceStatus::Onboarding, WorkspaceStatus::Provisioned],
                WorkspaceStatus::Provisioning,
            )
            .await?
        {
            info!(workspace_id = %id, "Credential detached, deprovisioning credential resources");
        }

        self.store.get_workspace(id).await
    }

    #[instrument(skip(self))]
    pub async fn request_deletion(&self, id: &str) -> Result<Workspace> {
        let workspace = self.store.get_workspace(id).await?;
        ensure_not_deleted(&workspace)?;

        if workspace.status != WorkspaceStatus::Deleting {
            self.store
                .update_status(id, WorkspaceStatus::Deleting)
                .await?;
            info!(workspace_id = %id, from = %workspace.status, "Workspace deletion requested");
        }

        self.store.get_workspace(id).await
    }

    /// Move to `to` if the current status is one of `from`. Compare-and-set
    /// against the status just read; retried when the status changed under us.
    async fn move_status(
        &self,
        id: &str,
        from: &[WorkspaceStatus],
        to: WorkspaceStatus,
    ) -> Result<bool> {
        loop {
            let current = self.store.get_workspace(id).await?.status;
            if !from.contains(&current) {
                return Ok(false);
            }
            if self.store.advance_status(id, current, to).await? {
                return Ok(true);
            }
        }
    }
}

fn ensure_not_deleted(workspace: &Workspace) -> Result<()> {
    if workspace.status == WorkspaceStatus::Deleted {
        return Err(OrchestratorError::InvalidState(format!(
            "workspace {} is deleted",
            workspace.id
        )));
    }
    Ok(())
}
