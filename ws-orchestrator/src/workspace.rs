use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool};
use std::fmt;
use tracing::instrument;
use uuid::Uuid;

/// A tenant workspace and the attributes its transactions record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub status: WorkspaceStatus,
    pub tier: WorkspaceTier,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,

    /// Vault-encrypted cloud credential blob, never the plaintext.
    #[serde(skip_serializing)]
    pub cloud_credential: Option<String>,

    pub release_installed: bool,
    pub search_endpoint: Option<String>,
    pub ingestion_endpoint: Option<String>,
    pub analytics_job: Option<String>,
    pub vault_key_id: Option<String>,
    pub credential_onboarded: bool,
    pub compliance_triggered: bool,
}

impl Workspace {
    pub fn has_credential(&self) -> bool {
        self.cloud_credential.is_some()
    }
}

/// Lifecycle stage of a workspace. Each processing status is owned by exactly
/// one entry of the state table; the rest are resting or terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Reserving,
    Reserved,
    Provisioning,
    WaitingForCredential,
    Onboarding,
    Provisioned,
    Deleting,
    Deleted,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Reserving => "reserving",
            WorkspaceStatus::Reserved => "reserved",
            WorkspaceStatus::Provisioning => "provisioning",
            WorkspaceStatus::WaitingForCredential => "waitingforcredential",
            WorkspaceStatus::Onboarding => "onboarding",
            WorkspaceStatus::Provisioned => "provisioned",
            WorkspaceStatus::Deleting => "deleting",
            WorkspaceStatus::Deleted => "deleted",
        }
    }

    /// Statuses whose workspaces get an ingress route.
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            WorkspaceStatus::WaitingForCredential
                | WorkspaceStatus::Onboarding
                | WorkspaceStatus::Provisioned
        )
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceTier {
    #[default]
    Small,
    Medium,
    Large,
}

impl WorkspaceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceTier::Small => "small",
            WorkspaceTier::Medium => "medium",
            WorkspaceTier::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub owner: Option<String>,
    pub status: Option<WorkspaceStatus>,
}

/// Workspace rows and the attribute setters used by transactions.
#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a fresh unclaimed workspace in `reserving` status
    #[instrument(skip(self))]
    pub async fn reserve_workspace(&self) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let name = format!("reserved-{}", &id[..8]);
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, owner, status, tier, created_at, updated_at)
            VALUES (?, ?, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&name)
        .bind(WorkspaceStatus::Reserving)
        .bind(WorkspaceTier::default())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_workspace(&id).await
    }

    /// Hand the oldest reserved workspace to an owner and start provisioning it
    #[instrument(skip(self))]
    pub async fn claim_reserved(
        &self,
        name: &str,
        owner: &str,
        tier: WorkspaceTier,
    ) -> Result<Workspace> {
        let mut tx = self.pool.begin().await?;

        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM workspaces WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(WorkspaceStatus::Reserved)
        .fetch_optional(&mut *tx)
        .await?;

        let id = id.ok_or(OrchestratorError::NoReservation)?;

        sqlx::query(
            "UPDATE workspaces
             SET name = ?, owner = ?, tier = ?, status = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(name)
        .bind(owner)
        .bind(tier)
        .bind(WorkspaceStatus::Provisioning)
        .bind(Utc::now().timestamp())
        .bind(&id)
        .bind(WorkspaceStatus::Reserved)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_workspace(&id).await
    }

    /// List workspaces with optional filters
    pub async fn list_workspaces(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at ASC, id ASC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Get a single workspace by ID
    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    /// Get all workspaces with a specific status
    pub async fn get_workspaces_by_status(
        &self,
        status: WorkspaceStatus,
    ) -> Result<Vec<Workspace>> {
        self.list_workspaces(WorkspaceFilters {
            owner: None,
            status: Some(status),
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn update_status(&self, id: &str, status: WorkspaceStatus) -> Result<()> {
        self.set_field(id, "status", status).await
    }

    /// Move `id` from `from` to `to`. Returns false, without writing, when the
    /// status is no longer `from`.
    #[instrument(skip(self))]
    pub async fn advance_status(
        &self,
        id: &str,
        from: WorkspaceStatus,
        to: WorkspaceStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to)
                .bind(Utc::now().timestamp())
                .bind(id)
                .bind(from)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_cloud_credential(&self, id: &str, blob: Option<&str>) -> Result<()> {
        self.set_field(id, "cloud_credential", blob.map(str::to_owned)).await
    }

    pub async fn set_release_installed(&self, id: &str, installed: bool) -> Result<()> {
        self.set_field(id, "release_installed", installed).await
    }

    pub async fn set_search_endpoint(&self, id: &str, endpoint: Option<&str>) -> Result<()> {
        self.set_field(id, "search_endpoint", endpoint.map(str::to_owned)).await
    }

    pub async fn set_ingestion_endpoint(&self, id: &str, endpoint: Option<&str>) -> Result<()> {
        self.set_field(id, "ingestion_endpoint", endpoint.map(str::to_owned)).await
    }

    pub async fn set_analytics_job(&self, id: &str, job: Option<&str>) -> Result<()> {
        self.set_field(id, "analytics_job", job.map(str::to_owned)).await
    }

    pub async fn set_vault_key_id(&self, id: &str, key_id: Option<&str>) -> Result<()> {
        self.set_field(id, "vault_key_id", key_id.map(str::to_owned)).await
    }

    pub async fn set_credential_onboarded(&self, id: &str, onboarded: bool) -> Result<()> {
        self.set_field(id, "credential_onboarded", onboarded).await
    }

    pub async fn set_compliance_triggered(&self, id: &str, triggered: bool) -> Result<()> {
        self.set_field(id, "compliance_triggered", triggered).await
    }

    /// Remove a workspace row together with its ledger entries
    #[instrument(skip(self))]
    pub async fn hard_delete_workspace(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM workspace_transactions WHERE workspace_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        tx.commit().await?;

        Ok(())
    }

    // `column` is always one of the literals above, never caller input.
    async fn set_field<T>(&self, id: &str, column: &'static str, value: T) -> Result<()>
    where
        T: for<'e> sqlx::Encode<'e, Sqlite> + sqlx::Type<Sqlite> + Send + 'static,
    {
        let query = format!(
            "UPDATE workspaces SET {} = ?, updated_at = ? WHERE id = ?",
            column
        );

        let result = sqlx::query(&query)
            .bind(value)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        Ok(())
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    owner: Option<String>,
    status: WorkspaceStatus,
    tier: WorkspaceTier,
    created_at: i64,
    updated_at: i64,
    cloud_credential: Option<String>,
    release_installed: bool,
    search_endpoint: Option<String>,
    ingestion_endpoint: Option<String>,
    analytics_job: Option<String>,
    vault_key_id: Option<String>,
    credential_onboarded: bool,
    compliance_triggered: bool,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            status: row.status,
            tier: row.tier,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
            cloud_credential: row.cloud_credential,
            release_installed: row.release_installed,
            search_endpoint: row.search_endpoint,
            ingestion_endpoint: row.ingestion_endpoint,
            analytics_job: row.analytics_job,
            vault_key_id: row.vault_key_id,
            credential_onboarded: row.credential_onboarded,
            compliance_triggered: row.compliance_triggered,
        }
    }
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
