//! Narrow interfaces to the external systems transactions act on.
//!
//! Every method is a single remote call. Implementations report conflicts
//! with [`ClientError`] variants so transactions can decide which ones count
//! as success.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use memory::{CloudCall, InMemoryCloud};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflicting operation in progress: {0}")]
    Conflict(String),

    #[error("API error: {0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }
}

/// Normalises the idempotency errors of create/delete calls to success.
pub trait ClientResultExt {
    fn ignore_already_exists(self) -> Result<(), ClientError>;
    fn ignore_not_found(self) -> Result<(), ClientError>;
}

impl ClientResultExt for Result<(), ClientError> {
    fn ignore_already_exists(self) -> Result<(), ClientError> {
        match self {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    fn ignore_not_found(self) -> Result<(), ClientError> {
        match self {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

// --- Identity ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    /// Service account allowed to assume the role
    pub trusted_subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub policy_names: Vec<String>,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn create_role(&self, role: &RoleSpec) -> Result<(), ClientError>;
    async fn get_role(&self, name: &str) -> Result<Option<Role>, ClientError>;
    async fn put_role_policy(
        &self,
        role: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> Result<(), ClientError>;
    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> Result<(), ClientError>;
    async fn delete_role(&self, name: &str) -> Result<(), ClientError>;
}

// --- Managed search ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub volume_gb: u32,
    pub access_role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub name: String,
    pub processing: bool,
    pub deleted: bool,
    pub endpoint: Option<String>,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn create_domain(&self, spec: &DomainSpec) -> Result<(), ClientError>;
    async fn describe_domain(&self, name: &str) -> Result<Option<DomainStatus>, ClientError>;
    async fn delete_domain(&self, name: &str) -> Result<(), ClientError>;
}

// --- Ingestion pipeline ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Creating,
    Active,
    Updating,
    Starting,
    Stopping,
    Stopped,
    Deleting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub role: String,
    pub sink_endpoint: String,
    pub min_units: u32,
    pub max_units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub name: String,
    pub state: PipelineState,
    pub ingest_endpoints: Vec<String>,
}

#[async_trait]
pub trait PipelineClient: Send + Sync {
    async fn create_pipeline(&self, spec: &PipelineSpec) -> Result<(), ClientError>;
    async fn describe_pipeline(&self, name: &str) -> Result<Option<PipelineStatus>, ClientError>;
    async fn start_pipeline(&self, name: &str) -> Result<(), ClientError>;
    async fn stop_pipeline(&self, name: &str) -> Result<(), ClientError>;
    async fn delete_pipeline(&self, name: &str) -> Result<(), ClientError>;
}

// --- Cluster-side releases, pods and jobs ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub values: serde_json::Value,
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub spec: ReleaseSpec,
    pub ready: bool,
    pub stalled: bool,
    pub deleting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub phase: PodPhase,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub args: Vec<String>,
    /// Cron schedule; one-shot job when absent
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub suspended: bool,
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[async_trait]
pub trait ReleaseClient: Send + Sync {
    async fn create_release(&self, spec: &ReleaseSpec) -> Result<(), ClientError>;
    async fn get_release(&self, namespace: &str, name: &str)
        -> Result<Option<Release>, ClientError>;
    async fn update_release(&self, spec: &ReleaseSpec) -> Result<(), ClientError>;
    async fn delete_release(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodStatus>, ClientError>;
    async fn create_job(&self, spec: &JobSpec) -> Result<(), ClientError>;
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<JobStatus>, ClientError>;
    async fn suspend_job(&self, namespace: &str, name: &str, suspend: bool)
        -> Result<(), ClientError>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

// --- Secrets ---

#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn set_secret(&self, name: &str, value: &str) -> Result<(), ClientError>;
    async fn delete_secret(&self, name: &str) -> Result<(), ClientError>;
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, ClientError>;
    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, ClientError>;
}

// --- Object storage ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub truncated: bool,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn create_bucket(&self, name: &str) -> Result<(), ClientError>;
    async fn list_objects(&self, bucket: &str, max_keys: usize) -> Result<ObjectPage, ClientError>;
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), ClientError>;
    async fn delete_bucket(&self, name: &str) -> Result<(), ClientError>;
}

// --- Authorization ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub workspace_id: String,
    pub subject: String,
    pub role: String,
}

#[async_trait]
pub trait RoleBindingClient: Send + Sync {
    async fn put_binding(&self, binding: &RoleBinding) -> Result<(), ClientError>;
    async fn delete_binding(&self, workspace_id: &str, subject: &str) -> Result<(), ClientError>;
}

// --- Ingress ---

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub host: String,
    pub namespace: String,
    pub service: String,
    pub port: u16,
}

#[async_trait]
pub trait IngressRouter: Send + Sync {
    /// Replace the whole routing table
    async fn sync_routes(&self, routes: &[Route]) -> Result<(), ClientError>;
}

/// Every collaborator the transactions and fleet tasks call into.
#[derive(Clone)]
pub struct Clients {
    pub identity: Arc<dyn IdentityClient>,
    pub search: Arc<dyn SearchClient>,
    pub pipelines: Arc<dyn PipelineClient>,
    pub releases: Arc<dyn ReleaseClient>,
    pub vault: Arc<dyn SecretVault>,
    pub storage: Arc<dyn ObjectStorage>,
    pub bindings: Arc<dyn RoleBindingClient>,
    pub ingress: Arc<dyn IngressRouter>,
}

impl Clients {
    /// Use one backend for every collaborator
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: IdentityClient
            + SearchClient
            + PipelineClient
            + ReleaseClient
            + SecretVault
            + ObjectStorage
            + RoleBindingClient
            + IngressRouter
            + 'static,
    {
        Self {
            identity: backend.clone(),
            search: backend.clone(),
            pipelines: backend.clone(),
            releases: backend.clone(),
            vault: backend.clone(),
            storage: backend.clone(),
            bindings: backend.clone(),
            ingress: backend,
        }
    }
}
