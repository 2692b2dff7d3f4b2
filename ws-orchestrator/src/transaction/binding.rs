use super::{Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::{ClientResultExt, RoleBinding};
use crate::workspace::Workspace;
use async_trait::async_trait;
use tracing::info;

const OWNER_ROLE: &str = "admin";

/// Grants the workspace owner admin rights on the workspace.
pub struct CreateRoleBinding;

impl CreateRoleBinding {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let owner = workspace.owner.as_deref().ok_or_else(|| {
            TransactionError::Precondition("workspace has no owner".to_string())
        })?;

        info!(workspace_id = %workspace.id, owner = %owner, "Binding owner role");
        ctx.clients
            .bindings
            .put_binding(&RoleBinding {
                workspace_id: workspace.id.clone(),
                subject: owner.to_string(),
                role: OWNER_ROLE.to_string(),
            })
            .await?;

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        if let Some(owner) = workspace.owner.as_deref() {
            ctx.clients
                .bindings
                .delete_binding(&workspace.id, owner)
                .await
                .ignore_not_found()?;
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for CreateRoleBinding {
    fn id(&self) -> TransactionId {
        TransactionId::CreateRoleBinding
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
