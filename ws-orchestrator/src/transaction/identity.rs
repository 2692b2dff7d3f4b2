use super::{Naming, Outcome, Transaction, TransactionContext, TransactionError, TransactionId};
use crate::clients::{ClientResultExt, RoleSpec};
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

/// Workload role assumed by the workspace's service account, with one inline
/// policy per backing service.
pub struct CreateServiceAccountRoles;

fn policies(naming: &Naming, workspace: &Workspace) -> Vec<(&'static str, Value)> {
    vec![
        (
            "search-access",
            statement(
                &["es:ESHttpGet", "es:ESHttpPost", "es:ESHttpPut"],
                format!("arn:aws:es:*:*:domain/{}/*", naming.domain(workspace)),
            ),
        ),
        (
            "ingest-access",
            statement(
                &["osis:Ingest"],
                format!("arn:aws:osis:*:*:pipeline/{}", naming.pipeline(workspace)),
            ),
        ),
        (
            "storage-access",
            statement(
                &["s3:GetObject", "s3:PutObject", "s3:ListBucket"],
                format!("arn:aws:s3:::{}/*", naming.bucket(workspace)),
            ),
        ),
    ]
}

fn statement(actions: &[&str], resource: String) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": actions,
            "Resource": resource,
        }]
    })
}

impl CreateServiceAccountRoles {
    async fn try_apply(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let identity = &ctx.clients.identity;
        let role = ctx.naming.role(workspace);

        if identity.get_role(&role).await?.is_none() {
            info!(workspace_id = %workspace.id, role = %role, "Creating workload role");
            identity
                .create_role(&RoleSpec {
                    name: role.clone(),
                    trusted_subject: format!(
                        "system:serviceaccount:{}:workspace",
                        ctx.naming.namespace(workspace)
                    ),
                })
                .await
                .ignore_already_exists()?;
        }

        for (policy_name, document) in policies(&ctx.naming, workspace) {
            identity
                .put_role_policy(&role, policy_name, &document)
                .await?;
        }

        Ok(Outcome::Done)
    }

    async fn try_rollback(
        &self,
        ctx: &TransactionContext,
        workspace: &Workspace,
    ) -> Result<Outcome, TransactionError> {
        let identity = &ctx.clients.identity;
        let role = ctx.naming.role(workspace);

        let Some(existing) = identity.get_role(&role).await? else {
            return Ok(Outcome::Done);
        };

        for policy_name in &existing.policy_names {
            identity
                .delete_role_policy(&role, policy_name)
                .await
                .ignore_not_found()?;
        }

        info!(workspace_id = %workspace.id, role = %role, "Deleting workload role");
        identity.delete_role(&role).await.ignore_not_found()?;

        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Transaction for CreateServiceAccountRoles {
    fn id(&self) -> TransactionId {
        TransactionId::CreateServiceAccountRoles
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
