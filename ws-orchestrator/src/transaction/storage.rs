use super::{Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::ClientResultExt;
use crate::workspace::Workspace;
use async_trait::async_trait;
use tracing::info;

const DELETE_BATCH: usize = 1000;

/// Object storage bucket holding the workspace's raw data.
pub struct CreateDataBucket;

impl CreateDataBucket {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        ctx.clients
            .storage
            .create_bucket(&ctx.naming.bucket(workspace))
            .await
            .ignore_already_exists()?;

        Ok(Outcome::Done)
    }

    /// Empties the bucket one page per attempt, then deletes it.
    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let storage = &ctx.clients.storage;
        let bucket = ctx.naming.bucket(workspace);

        let page = match storage.list_objects(&bucket, DELETE_BATCH).await {
            Ok(page) => page,
            Err(e) if e.is_not_found() => return Ok(Outcome::Done),
            Err(e) => return Err(e.into()),
        };

        if !page.keys.is_empty() {
            info!(
                workspace_id = %workspace.id,
                bucket = %bucket,
                count = page.keys.len(),
                "Deleting bucket objects"
            );
            storage.delete_objects(&bucket, &page.keys).await?;
        }

        if page.truncated {
            return Ok(Outcome::NeedsTime);
        }

        storage.delete_bucket(&bucket).await.ignore_not_found()?;

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for CreateDataBucket {
    fn id(&self) -> TransactionId {
        TransactionId::CreateDataBucket
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[TransactionId::CreateServiceAccountRoles]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}
