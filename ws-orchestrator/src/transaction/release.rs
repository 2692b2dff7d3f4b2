use super::{Naming, Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::{ClientResultExt, PodPhase, ReleaseSpec};
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Values payload of the workspace release, derived only from workspace
/// attributes. Every transaction that touches the release goes through here
/// so they never disagree about the desired values.
pub fn release_values(naming: &Naming, workspace: &Workspace) -> Value {
    let credential_secret = workspace
        .credential_onboarded
        .then(|| naming.master_credential_secret(workspace));

    json!({
        "workspace": {
            "id": workspace.id,
            "name": workspace.name,
            "owner": workspace.owner,
            "tier": workspace.tier.as_str(),
        },
        "serviceAccount": {
            "role": naming.role(workspace),
        },
        "search": {
            "endpoint": workspace.search_endpoint,
        },
        "ingestion": {
            "endpoint": workspace.ingestion_endpoint,
        },
        "vault": {
            "keyId": workspace.vault_key_id,
        },
        "storage": {
            "bucket": naming.bucket(workspace),
        },
        "credential": {
            "enabled": workspace.credential_onboarded,
            "secretName": credential_secret,
        },
        "ingress": {
            "host": naming.host(workspace),
        },
    })
}

pub(crate) fn release_spec(naming: &Naming, workspace: &Workspace, values: Value) -> ReleaseSpec {
    ReleaseSpec {
        name: Naming::RELEASE_NAME.to_string(),
        namespace: naming.namespace(workspace),
        chart: naming.release_chart.clone(),
        values,
        suspended: false,
    }
}

/// Declarative container release running the workspace services.
pub struct CreateHelmRelease;

impl CreateHelmRelease {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(workspace);
        let desired = release_spec(
            &ctx.naming,
            workspace,
            release_values(&ctx.naming, workspace),
        );

        let Some(release) = releases
            .get_release(&namespace, Naming::RELEASE_NAME)
            .await?
        else {
            info!(workspace_id = %workspace.id, namespace = %namespace, "Installing workspace release");
            releases
                .create_release(&desired)
                .await
                .ignore_already_exists()?;
            return Ok(Outcome::NeedsTime);
        };

        if release.deleting {
            return Ok(Outcome::NeedsTime);
        }

        if release.spec.suspended {
            info!(workspace_id = %workspace.id, "Resuming suspended workspace release");
            releases.update_release(&desired).await?;
            return Ok(Outcome::NeedsTime);
        }

        if release.stalled {
            warn!(workspace_id = %workspace.id, "Workspace release stalled, suspending to retry");
            releases
                .update_release(&ReleaseSpec {
                    suspended: true,
                    ..release.spec.clone()
                })
                .await?;
            return Ok(Outcome::NeedsTime);
        }

        if release.spec.values != desired.values || release.spec.chart != desired.chart {
            info!(workspace_id = %workspace.id, "Workspace release values drifted, updating");
            releases.update_release(&desired).await?;
            return Ok(Outcome::NeedsTime);
        }

        if !release.ready {
            debug!(workspace_id = %workspace.id, "Workspace release not ready yet");
            return Ok(Outcome::NeedsTime);
        }

        if !workspace.release_installed {
            ctx.store
                .set_release_installed(&workspace.id, true)
                .await?;
        }

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let releases = &ctx.clients.releases;
        let namespace = ctx.naming.namespace(workspace);

        match releases
            .get_release(&namespace, Naming::RELEASE_NAME)
            .await?
        {
            None => {
                if workspace.release_installed {
                    ctx.store
                        .set_release_installed(&workspace.id, false)
                        .await?;
                }
                Ok(Outcome::Done)
            }
            Some(release) if release.deleting => Ok(Outcome::NeedsTime),
            Some(_) => {
                info!(workspace_id = %workspace.id, namespace = %namespace, "Uninstalling workspace release");
                releases
                    .delete_release(&namespace, Naming::RELEASE_NAME)
                    .await
                    .ignore_not_found()?;
                Ok(Outcome::NeedsTime)
            }
        }
    }
}

#[async_trait]
impl Transaction for CreateHelmRelease {
    fn id(&self) -> TransactionId {
        TransactionId::CreateHelmRelease
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[
            TransactionId::CreateOpenSearch,
            TransactionId::CreateIngestionPipeline,
            TransactionId::CreateWorkspaceKeyId,
        ]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_rollback(ctx, workspace).await)
    }
}

/// Waits for every pod of the workspace namespace to be running and ready.
/// Pods are owned by the release, so rollback has nothing to remove.
pub struct EnsureWorkspacePodsRunning;

impl EnsureWorkspacePodsRunning {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let pods = ctx
            .clients
            .releases
            .list_pods(&ctx.naming.namespace(workspace))
            .await?;

        let ready = pods
            .iter()
            .filter(|pod| pod.phase == PodPhase::Running && pod.ready)
            .count();

        if pods.is_empty() || ready < pods.len() {
            debug!(
                workspace_id = %workspace.id,
                ready,
                total = pods.len(),
                "Waiting for workspace pods"
            );
            return Ok(Outcome::NeedsTime);
        }

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for EnsureWorkspacePodsRunning {
    fn id(&self) -> TransactionId {
        TransactionId::EnsureWorkspacePodsRunning
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[TransactionId::CreateHelmRelease]
    }

    async fn apply(&self, ctx: &TransactionContext, workspace: &Workspace) -> Outcome {
        Outcome::from_result(self.try_apply(ctx, workspace).await)
    }

    async fn rollback(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        Outcome::Done
    }
}
