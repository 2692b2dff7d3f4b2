use super::{Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::ClientResultExt;
use crate::workspace::Workspace;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::info;
use uuid::Uuid;

/// Key id of a workspace. Derived from the workspace id so an interrupted
/// apply writes the same secret again instead of a second one.
pub fn workspace_key_id(workspace: &Workspace) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, workspace.id.as_bytes())
        .simple()
        .to_string()
}

/// Per-workspace key material stored in the vault. The key id is recorded on
/// the workspace only after the secret exists, so a recorded id always has
/// material behind it and re-applying never rotates the key.
pub struct CreateWorkspaceKeyId;

impl CreateWorkspaceKeyId {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        if workspace.vault_key_id.is_some() {
            return Ok(Outcome::Done);
        }

        let key_id = workspace_key_id(workspace);
        let material: [u8; 32] = rand::random();

        info!(workspace_id = %workspace.id, key_id = %key_id, "Creating workspace key");
        ctx.clients
            .vault
            .set_secret(
                &ctx.naming.key_secret(workspace, &key_id),
                &STANDARD.encode(material),
            )
            .await?;
        ctx.store
            .set_vault_key_id(&workspace.id, Some(key_id.as_str()))
            .await?;

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        // The secret may exist even when recording the id never happened
        let key_id = workspace
            .vault_key_id
            .clone()
            .unwrap_or_else(|| workspace_key_id(workspace));

        ctx.clients
            .vault
            .delete_secret(&ctx.naming.key_secret(workspace, &key_id))
            .await
            .ignore_not_found()?;
        if workspace.vault_key_id.is_some() {
            ctx.store.set_vault_key_id(&workspace.id, None).await?;
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for CreateWorkspaceKeyId {
    fn id(&self) -> TransactionId {
        TransactionId::CreateWorkspaceKeyId
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}

/// Decrypts the tenant's cloud credential and publishes it as the workspace
/// master credential secret.
pub struct CreateMasterCredential;

impl CreateMasterCredential {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let blob = workspace.cloud_credential.as_deref().ok_or_else(|| {
            TransactionError::Precondition("workspace has no cloud credential".to_string())
        })?;

        let vault = &ctx.clients.vault;
        let plaintext = vault.decrypt(blob).await?;
        let credential = String::from_utf8(plaintext).map_err(|_| {
            TransactionError::Precondition("cloud credential is not valid UTF-8".to_string())
        })?;

        vault
            .set_secret(&ctx.naming.master_credential_secret(workspace), &credential)
            .await?;

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        ctx.clients
            .vault
            .delete_secret(&ctx.naming.master_credential_secret(workspace))
            .await
            .ignore_not_found()?;

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for CreateMasterCredential {
    fn id(&self) -> TransactionId {
        TransactionId::CreateMasterCredential
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[TransactionId::CreateWorkspaceKeyId]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}
