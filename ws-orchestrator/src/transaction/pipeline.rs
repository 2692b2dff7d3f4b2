use super::{Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::{ClientResultExt, PipelineSpec, PipelineState};
use crate::workspace::{Workspace, WorkspaceTier};
use async_trait::async_trait;
use tracing::info;

/// Ingestion pipeline feeding the workspace's search domain.
pub struct CreateIngestionPipeline;

fn capacity(tier: WorkspaceTier) -> (u32, u32) {
    match tier {
        WorkspaceTier::Small => (1, 2),
        WorkspaceTier::Medium => (2, 4),
        WorkspaceTier::Large => (4, 8),
    }
}

impl CreateIngestionPipeline {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let pipelines = &ctx.clients.pipelines;
        let name = ctx.naming.pipeline(workspace);

        let Some(status) = pipelines.describe_pipeline(&name).await? else {
            let sink_endpoint = workspace.search_endpoint.clone().ok_or_else(|| {
                TransactionError::Precondition("search endpoint is not recorded".to_string())
            })?;
            let (min_units, max_units) = capacity(workspace.tier);

            info!(workspace_id = %workspace.id, pipeline = %name, "Creating ingestion pipeline");
            pipelines
                .create_pipeline(&PipelineSpec {
                    name: name.clone(),
                    role: ctx.naming.role(workspace),
                    sink_endpoint,
                    min_units,
                    max_units,
                })
                .await
                .ignore_already_exists()?;
            return Ok(Outcome::NeedsTime);
        };

        match status.state {
            PipelineState::Creating
            | PipelineState::Starting
            | PipelineState::Updating
            | PipelineState::Stopping
            | PipelineState::Deleting => Ok(Outcome::NeedsTime),
            PipelineState::Stopped => {
                info!(workspace_id = %workspace.id, pipeline = %name, "Starting stopped ingestion pipeline");
                pipelines.start_pipeline(&name).await?;
                Ok(Outcome::NeedsTime)
            }
            PipelineState::Failed => Err(TransactionError::Remote(format!(
                "ingestion pipeline {} is in a failed state",
                name
            ))),
            PipelineState::Active => {
                let endpoint = status.ingest_endpoints.first().ok_or_else(|| {
                    TransactionError::Remote(format!(
                        "active pipeline {} reported no ingest endpoint",
                        name
                    ))
                })?;
                if workspace.ingestion_endpoint.as_deref() != Some(endpoint.as_str()) {
                    ctx.store
                        .set_ingestion_endpoint(&workspace.id, Some(endpoint.as_str()))
                        .await?;
                }
                Ok(Outcome::Done)
            }
        }
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let pipelines = &ctx.clients.pipelines;
        let name = ctx.naming.pipeline(workspace);

        let Some(status) = pipelines.describe_pipeline(&name).await? else {
            if workspace.ingestion_endpoint.is_some() {
                ctx.store.set_ingestion_endpoint(&workspace.id, None).await?;
            }
            return Ok(Outcome::Done);
        };

        match status.state {
            PipelineState::Active => {
                info!(workspace_id = %workspace.id, pipeline = %name, "Stopping ingestion pipeline");
                pipelines.stop_pipeline(&name).await?;
            }
            PipelineState::Stopped | PipelineState::Failed => {
                info!(workspace_id = %workspace.id, pipeline = %name, "Deleting ingestion pipeline");
                pipelines.delete_pipeline(&name).await.ignore_not_found()?;
            }
            PipelineState::Creating
            | PipelineState::Starting
            | PipelineState::Updating
            | PipelineState::Stopping
            | PipelineState::Deleting => {}
        }

        Ok(Outcome::NeedsTime)
    }
}

#[async_trait]
impl Transaction for CreateIngestionPipeline {
    fn id(&self) -> TransactionId {
        TransactionId::CreateIngestionPipeline
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[TransactionId::CreateOpenSearch]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}
