use super::{Naming, Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::{ClientResultExt, DomainSpec};
use crate::workspace::{Workspace, WorkspaceTier};
use async_trait::async_trait;
use tracing::{debug, info};

/// Managed search domain backing the workspace. Records the domain endpoint
/// on the workspace once the domain is ready.
pub struct CreateOpenSearch;

fn domain_spec(naming: &Naming, workspace: &Workspace) -> DomainSpec {
    let (instance_type, instance_count, volume_gb) = match workspace.tier {
        WorkspaceTier::Small => ("t3.small.search", 1, 10),
        WorkspaceTier::Medium => ("m6g.large.search", 2, 100),
        WorkspaceTier::Large => ("r6g.xlarge.search", 3, 500),
    };

    DomainSpec {
        name: naming.domain(workspace),
        instance_type: instance_type.to_string(),
        instance_count,
        volume_gb,
        access_role: naming.role(workspace),
    }
}

impl CreateOpenSearch {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let search = &ctx.clients.search;
        let name = ctx.naming.domain(workspace);

        let Some(status) = search.describe_domain(&name).await? else {
            info!(workspace_id = %workspace.id, domain = %name, "Creating search domain");
            search
                .create_domain(&domain_spec(&ctx.naming, workspace))
                .await
                .ignore_already_exists()?;
            return Ok(Outcome::NeedsTime);
        };

        // A domain from an earlier teardown must finish deleting first.
        if status.deleted {
            return Ok(Outcome::NeedsTime);
        }

        match status.endpoint {
            Some(endpoint) if !status.processing => {
                if workspace.search_endpoint.as_deref() != Some(endpoint.as_str()) {
                    ctx.store
                        .set_search_endpoint(&workspace.id, Some(endpoint.as_str()))
                        .await?;
                }
                Ok(Outcome::Done)
            }
            _ => {
                debug!(workspace_id = %workspace.id, domain = %name, "Search domain still processing");
                Ok(Outcome::NeedsTime)
            }
        }
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let search = &ctx.clients.search;
        let name = ctx.naming.domain(workspace);

        match search.describe_domain(&name).await? {
            None => {
                if workspace.search_endpoint.is_some() {
                    ctx.store.set_search_endpoint(&workspace.id, None).await?;
                }
                Ok(Outcome::Done)
            }
            Some(status) if status.deleted => Ok(Outcome::NeedsTime),
            Some(_) => {
                info!(workspace_id = %workspace.id, domain = %name, "Deleting search domain");
                search.delete_domain(&name).await.ignore_not_found()?;
                Ok(Outcome::NeedsTime)
            }
        }
    }
}

#[async_trait]
impl Transaction for CreateOpenSearch {
    fn id(&self) -> TransactionId {
        TransactionId::CreateOpenSearch
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
