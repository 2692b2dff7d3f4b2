use super::release::{release_spec, release_values};
use super::{Naming, Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::workspace::Workspace;
use async_trait::async_trait;
use tracing::{debug, info};

/// Switches the running release over to the tenant's master credential.
///
/// The `credential_onboarded` flag is recorded first so that the release
/// values computed here and by `CreateHelmRelease` agree.
pub struct EnsureCredentialOnboarded;

impl EnsureCredentialOnboarded {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        if !workspace.credential_onboarded {
            ctx.store
                .set_credential_onboarded(&workspace.id, true)
                .await?;
        }

        let mut onboarded = workspace.clone();
        onboarded.credential_onboarded = true;

        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(&onboarded);
        let release = releases
            .get_release(&namespace, Naming::RELEASE_NAME)
            .await?
            .ok_or_else(|| {
                TransactionError::Remote(format!("release missing in namespace {}", namespace))
            })?;

        let values = release_values(&ctx.naming, &onboarded);
        if release.spec.values != values {
            info!(workspace_id = %workspace.id, "Enabling master credential on workspace release");
            releases
                .update_release(&release_spec(&ctx.naming, &onboarded, values))
                .await?;
            return Ok(Outcome::NeedsTime);
        }

        if !release.ready {
            debug!(workspace_id = %workspace.id, "Waiting for release to pick up credential");
            return Ok(Outcome::NeedsTime);
        }

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        if workspace.credential_onboarded {
            ctx.store
                .set_credential_onboarded(&workspace.id, false)
                .await?;
        }

        let mut detached = workspace.clone();
        detached.credential_onboarded = false;

        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(&detached);
        if let Some(release) = releases
            .get_release(&namespace, Naming::RELEASE_NAME)
            .await?
        {
            let values = release_values(&ctx.naming, &detached);
            if !release.deleting && release.spec.values != values {
                info!(workspace_id = %workspace.id, "Removing master credential from workspace release");
                releases
                    .update_release(&release_spec(&ctx.naming, &detached, values))
                    .await?;
            }
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for EnsureCredentialOnboarded {
    fn id(&self) -> TransactionId {
        TransactionId::EnsureCredentialOnboarded
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[
            TransactionId::CreateMasterCredential,
            TransactionId::EnsureWorkspacePodsRunning,
        ]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}
