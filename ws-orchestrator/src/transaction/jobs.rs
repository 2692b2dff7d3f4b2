use super::{Naming, Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::{ClientResultExt, JobSpec};
use crate::workspace::Workspace;
use async_trait::async_trait;
use tracing::{debug, info, warn};

const ANALYTICS_SCHEDULE: &str = "*/15 * * * *";

fn job_spec(ctx: &TransactionContext, workspace: &Workspace, name: &str) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        namespace: ctx.naming.namespace(workspace),
        image: ctx.naming.job_image.clone(),
        args: vec![name.to_string(), "--workspace".to_string(), workspace.id.clone()],
        schedule: None,
    }
}

/// One-shot discovery scan of the tenant account. Completion also marks the
/// workspace as ready for compliance reporting.
pub struct EnsureDiscoveryFinished;

impl EnsureDiscoveryFinished {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(workspace);

        let Some(job) = releases
            .get_job(&namespace, Naming::DISCOVERY_JOB)
            .await?
        else {
            info!(workspace_id = %workspace.id, "Starting discovery job");
            releases
                .create_job(&job_spec(ctx, workspace, Naming::DISCOVERY_JOB))
                .await
                .ignore_already_exists()?;
            return Ok(Outcome::NeedsTime);
        };

        if job.failed > 0 {
            warn!(workspace_id = %workspace.id, "Discovery job failed, removing it for a fresh run");
            releases
                .delete_job(&namespace, Naming::DISCOVERY_JOB)
                .await
                .ignore_not_found()?;
            return Err(TransactionError::Remote(format!(
                "discovery job failed in namespace {}",
                namespace
            )));
        }

        if job.succeeded == 0 {
            debug!(workspace_id = %workspace.id, active = job.active, "Discovery still running");
            return Ok(Outcome::NeedsTime);
        }

        if !workspace.compliance_triggered {
            ctx.store
                .set_compliance_triggered(&workspace.id, true)
                .await?;
        }

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        ctx.clients
            .releases
            .delete_job(&ctx.naming.namespace(workspace), Naming::DISCOVERY_JOB)
            .await
            .ignore_not_found()?;

        if workspace.compliance_triggered {
            ctx.store
                .set_compliance_triggered(&workspace.id, false)
                .await?;
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for EnsureDiscoveryFinished {
    fn id(&self) -> TransactionId {
        TransactionId::EnsureDiscoveryFinished
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[TransactionId::EnsureCredentialOnboarded]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}

/// Recurring analytics job. Its reference is recorded on the workspace so
/// deletion can wait for it to drain.
pub struct EnsureJobsRunning;

impl EnsureJobsRunning {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(workspace);

        match releases.get_job(&namespace, Naming::ANALYTICS_JOB).await? {
            None => {
                info!(workspace_id = %workspace.id, "Scheduling analytics job");
                let spec = JobSpec {
                    schedule: Some(ANALYTICS_SCHEDULE.to_string()),
                    ..job_spec(ctx, workspace, Naming::ANALYTICS_JOB)
                };
                releases.create_job(&spec).await.ignore_already_exists()?;
            }
            Some(job) if job.suspended => {
                info!(workspace_id = %workspace.id, "Resuming analytics job");
                releases
                    .suspend_job(&namespace, Naming::ANALYTICS_JOB, false)
                    .await?;
            }
            Some(_) => {}
        }

        let job_ref = format!("{}/{}", namespace, Naming::ANALYTICS_JOB);
        if workspace.analytics_job.as_deref() != Some(job_ref.as_str()) {
            ctx.store
                .set_analytics_job(&workspace.id, Some(job_ref.as_str()))
                .await?;
        }

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        ctx.clients
            .releases
            .delete_job(&ctx.naming.namespace(workspace), Naming::ANALYTICS_JOB)
            .await
            .ignore_not_found()?;

        if workspace.analytics_job.is_some() {
            ctx.store.set_analytics_job(&workspace.id, None).await?;
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for EnsureJobsRunning {
    fn id(&self) -> TransactionId {
        TransactionId::EnsureJobsRunning
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[TransactionId::EnsureDiscoveryFinished]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}

/// Suspends the recurring analytics job and waits for running executions to
/// drain. Used while deleting, before anything the job reads is removed.
pub struct EnsureJobsFinished;

impl EnsureJobsFinished {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        if workspace.analytics_job.is_none() {
            return Ok(Outcome::Done);
        }

        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(workspace);

        let Some(job) = releases.get_job(&namespace, Naming::ANALYTICS_JOB).await? else {
            return Ok(Outcome::Done);
        };

        if !job.suspended {
            info!(workspace_id = %workspace.id, "Suspending analytics job");
            releases
                .suspend_job(&namespace, Naming::ANALYTICS_JOB, true)
                .await?;
            return Ok(Outcome::NeedsTime);
        }

        if job.active > 0 {
            debug!(workspace_id = %workspace.id, active = job.active, "Waiting for analytics runs to finish");
            return Ok(Outcome::NeedsTime);
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for EnsureJobsFinished {
    fn id(&self) -> TransactionId {
        TransactionId::EnsureJobsFinished
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        Outcome::Done
    }
}
