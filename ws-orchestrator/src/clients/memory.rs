//! In-memory cloud backend.
//!
//! Implements every collaborator trait against a single mutex-guarded model
//! of the outside world. Long-running operations converge after a configurable
//! number of observations, which is enough to drive the full workspace
//! lifecycle locally and in tests. Calls are recorded, and failures can be
//! injected per operation.

use super::{
    ClientError, DomainSpec, DomainStatus, IdentityClient, IngressRouter, JobSpec, JobStatus,
    ObjectPage, ObjectStorage, PipelineClient, PipelineSpec, PipelineState, PipelineStatus,
    PodPhase, PodStatus, Release, ReleaseClient, ReleaseSpec, Role, RoleBinding,
    RoleBindingClient, RoleSpec, Route, SearchClient, SecretVault,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

const CIPHERTEXT_PREFIX: &str = "vault:v1:";

/// Most recent calls kept in the log; older ones are dropped
pub const CALL_LOG_CAPACITY: usize = 4096;

/// Recorded remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCall {
    pub op: &'static str,
    pub target: String,
}

struct RoleEntry {
    policies: BTreeMap<String, serde_json::Value>,
}

struct DomainEntry {
    status: DomainStatus,
    polls_left: u32,
}

struct PipelineEntry {
    state: PipelineState,
    polls_left: u32,
}

struct ReleaseEntry {
    release: Release,
    polls_left: u32,
}

struct JobEntry {
    spec: JobSpec,
    status: JobStatus,
    polls_left: u32,
}

#[derive(Default)]
struct CloudState {
    roles: BTreeMap<String, RoleEntry>,
    domains: BTreeMap<String, DomainEntry>,
    pipelines: BTreeMap<String, PipelineEntry>,
    releases: BTreeMap<(String, String), ReleaseEntry>,
    jobs: BTreeMap<(String, String), JobEntry>,
    secrets: BTreeMap<String, String>,
    buckets: BTreeMap<String, BTreeSet<String>>,
    bindings: BTreeMap<(String, String), RoleBinding>,
    routes: Vec<Route>,
    calls: VecDeque<CloudCall>,
    failures: HashMap<&'static str, VecDeque<ClientError>>,
}

impl CloudState {
    /// Log the call, then surface an injected failure if one is queued
    fn record(&mut self, op: &'static str, target: impl Into<String>) -> Result<(), ClientError> {
        if self.calls.len() == CALL_LOG_CAPACITY {
            self.calls.pop_front();
        }
        self.calls.push_back(CloudCall {
            op,
            target: target.into(),
        });

        match self.failures.get_mut(op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct InMemoryCloud {
    state: Mutex<CloudState>,
    settle_polls: u32,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCloud {
    /// Resources converge on the first observation after a change
    pub fn new() -> Self {
        Self::with_settle_polls(0)
    }

    /// Resources report in-progress for `polls` observations after a change
    pub fn with_settle_polls(polls: u32) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            settle_polls: polls,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an error for the next call of `op`
    pub fn fail_next(&self, op: &'static str, err: ClientError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Recorded calls, oldest first, up to [`CALL_LOG_CAPACITY`]
    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.iter().cloned().collect()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn role_policies(&self, role: &str) -> Option<Vec<String>> {
        self.lock()
            .roles
            .get(role)
            .map(|r| r.policies.keys().cloned().collect())
    }

    pub fn domain(&self, name: &str) -> Option<DomainStatus> {
        self.lock().domains.get(name).map(|d| d.status.clone())
    }

    pub fn pipeline_state(&self, name: &str) -> Option<PipelineState> {
        self.lock().pipelines.get(name).map(|p| p.state)
    }

    pub fn release(&self, namespace: &str, name: &str) -> Option<Release> {
        self.lock()
            .releases
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.release.clone())
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<JobStatus> {
        self.lock()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .map(|j| j.status.clone())
    }

    pub fn secret(&self, name: &str) -> Option<String> {
        self.lock().secrets.get(name).cloned()
    }

    pub fn secret_names(&self) -> Vec<String> {
        self.lock().secrets.keys().cloned().collect()
    }

    pub fn bucket_objects(&self, bucket: &str) -> Option<Vec<String>> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.iter().cloned().collect())
    }

    pub fn put_object(&self, bucket: &str, key: &str) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub fn binding(&self, workspace_id: &str, subject: &str) -> Option<RoleBinding> {
        self.lock()
            .bindings
            .get(&(workspace_id.to_string(), subject.to_string()))
            .cloned()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.lock().routes.clone()
    }

    /// Seed a ready search domain, as if created out of band
    pub fn seed_domain(&self, name: &str, endpoint: &str) {
        self.lock().domains.insert(
            name.to_string(),
            DomainEntry {
                status: DomainStatus {
                    name: name.to_string(),
                    processing: false,
                    deleted: false,
                    endpoint: Some(endpoint.to_string()),
                },
                polls_left: 0,
            },
        );
    }

    pub fn set_release_stalled(&self, namespace: &str, name: &str, stalled: bool) {
        if let Some(entry) = self
            .lock()
            .releases
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            entry.release.stalled = stalled;
            if stalled {
                entry.release.ready = false;
            }
        }
    }

    /// Mark a one-shot job as failed on its next observation
    pub fn fail_job(&self, namespace: &str, name: &str) {
        if let Some(entry) = self
            .lock()
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            entry.polls_left = 0;
            entry.status.active = 0;
            entry.status.failed += 1;
        }
    }
}

#[async_trait]
impl IdentityClient for InMemoryCloud {
    async fn create_role(&self, role: &RoleSpec) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("create_role", &role.name)?;

        if state.roles.contains_key(&role.name) {
            return Err(ClientError::AlreadyExists(role.name.clone()));
        }
        state.roles.insert(
            role.name.clone(),
            RoleEntry {
                policies: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn get_role(&self, name: &str) -> Result<Option<Role>, ClientError> {
        let mut state = self.lock();
        state.record("get_role", name)?;

        Ok(state.roles.get(name).map(|entry| Role {
            name: name.to_string(),
            policy_names: entry.policies.keys().cloned().collect(),
        }))
    }

    async fn put_role_policy(
        &self,
        role: &str,
        policy_name: &str,
        document: &serde_json::Value,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("put_role_policy", format!("{}/{}", role, policy_name))?;

        let entry = state
            .roles
            .get_mut(role)
            .ok_or_else(|| ClientError::NotFound(role.to_string()))?;
        entry
            .policies
            .insert(policy_name.to_string(), document.clone());
        Ok(())
    }

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_role_policy", format!("{}/{}", role, policy_name))?;

        let entry = state
            .roles
            .get_mut(role)
            .ok_or_else(|| ClientError::NotFound(role.to_string()))?;
        entry
            .policies
            .remove(policy_name)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(policy_name.to_string()))
    }

    async fn delete_role(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_role", name)?;

        match state.roles.get(name) {
            None => Err(ClientError::NotFound(name.to_string())),
            Some(entry) if !entry.policies.is_empty() => Err(ClientError::Conflict(format!(
                "role {} still has attached policies",
                name
            ))),
            Some(_) => {
                state.roles.remove(name);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SearchClient for InMemoryCloud {
    async fn create_domain(&self, spec: &DomainSpec) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("create_domain", &spec.name)?;

        if state.domains.contains_key(&spec.name) {
            return Err(ClientError::AlreadyExists(spec.name.clone()));
        }
        state.domains.insert(
            spec.name.clone(),
            DomainEntry {
                status: DomainStatus {
                    name: spec.name.clone(),
                    processing: true,
                    deleted: false,
                    endpoint: None,
                },
                polls_left: self.settle_polls,
            },
        );
        Ok(())
    }

    async fn describe_domain(&self, name: &str) -> Result<Option<DomainStatus>, ClientError> {
        let mut state = self.lock();
        state.record("describe_domain", name)?;

        let Some(entry) = state.domains.get_mut(name) else {
            return Ok(None);
        };

        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(Some(entry.status.clone()));
        }

        if entry.status.deleted {
            state.domains.remove(name);
            return Ok(None);
        }

        entry.status.processing = false;
        if entry.status.endpoint.is_none() {
            entry.status.endpoint = Some(format!("https://{}.search.local", name));
        }
        Ok(Some(entry.status.clone()))
    }

    async fn delete_domain(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_domain", name)?;

        let entry = state
            .domains
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        entry.status.deleted = true;
        entry.status.processing = true;
        entry.polls_left = self.settle_polls;
        Ok(())
    }
}

#[async_trait]
impl PipelineClient for InMemoryCloud {
    async fn create_pipeline(&self, spec: &PipelineSpec) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("create_pipeline", &spec.name)?;

        if state.pipelines.contains_key(&spec.name) {
            return Err(ClientError::AlreadyExists(spec.name.clone()));
        }
        state.pipelines.insert(
            spec.name.clone(),
            PipelineEntry {
                state: PipelineState::Creating,
                polls_left: self.settle_polls,
            },
        );
        Ok(())
    }

    async fn describe_pipeline(&self, name: &str) -> Result<Option<PipelineStatus>, ClientError> {
        let mut state = self.lock();
        state.record("describe_pipeline", name)?;

        let Some(entry) = state.pipelines.get_mut(name) else {
            return Ok(None);
        };

        if entry.polls_left > 0 {
            entry.polls_left -= 1;
        } else if entry.state == PipelineState::Deleting {
            state.pipelines.remove(name);
            return Ok(None);
        } else {
            entry.state = match entry.state {
                PipelineState::Creating | PipelineState::Starting | PipelineState::Updating => {
                    PipelineState::Active
                }
                PipelineState::Stopping => PipelineState::Stopped,
                settled => settled,
            };
        }

        let ingest_endpoints = if entry.state == PipelineState::Active {
            vec![format!("{}.ingest.local", name)]
        } else {
            Vec::new()
        };

        Ok(Some(PipelineStatus {
            name: name.to_string(),
            state: entry.state,
            ingest_endpoints,
        }))
    }

    async fn start_pipeline(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("start_pipeline", name)?;

        let entry = state
            .pipelines
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        if entry.state != PipelineState::Stopped {
            return Err(ClientError::Conflict(format!(
                "pipeline {} is {:?}",
                name, entry.state
            )));
        }
        entry.state = PipelineState::Starting;
        entry.polls_left = self.settle_polls;
        Ok(())
    }

    async fn stop_pipeline(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("stop_pipeline", name)?;

        let entry = state
            .pipelines
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        if entry.state != PipelineState::Active {
            return Err(ClientError::Conflict(format!(
                "pipeline {} is {:?}",
                name, entry.state
            )));
        }
        entry.state = PipelineState::Stopping;
        entry.polls_left = self.settle_polls;
        Ok(())
    }

    async fn delete_pipeline(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_pipeline", name)?;

        let entry = state
            .pipelines
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        entry.state = PipelineState::Deleting;
        entry.polls_left = self.settle_polls;
        Ok(())
    }
}

#[async_trait]
impl ReleaseClient for InMemoryCloud {
    async fn create_release(&self, spec: &ReleaseSpec) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("create_release", format!("{}/{}", spec.namespace, spec.name))?;

        let key = (spec.namespace.clone(), spec.name.clone());
        if state.releases.contains_key(&key) {
            return Err(ClientError::AlreadyExists(spec.name.clone()));
        }
        state.releases.insert(
            key,
            ReleaseEntry {
                release: Release {
                    spec: spec.clone(),
                    ready: false,
                    stalled: false,
                    deleting: false,
                },
                polls_left: self.settle_polls,
            },
        );
        Ok(())
    }

    async fn get_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, ClientError> {
        let mut state = self.lock();
        state.record("get_release", format!("{}/{}", namespace, name))?;

        let key = (namespace.to_string(), name.to_string());
        let Some(entry) = state.releases.get_mut(&key) else {
            return Ok(None);
        };

        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(Some(entry.release.clone()));
        }

        if entry.release.deleting {
            state.releases.remove(&key);
            return Ok(None);
        }

        entry.release.ready = !entry.release.spec.suspended && !entry.release.stalled;
        Ok(Some(entry.release.clone()))
    }

    async fn update_release(&self, spec: &ReleaseSpec) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("update_release", format!("{}/{}", spec.namespace, spec.name))?;

        let entry = state
            .releases
            .get_mut(&(spec.namespace.clone(), spec.name.clone()))
            .ok_or_else(|| ClientError::NotFound(spec.name.clone()))?;
        if entry.release.spec.suspended && !spec.suspended {
            entry.release.stalled = false;
        }
        entry.release.spec = spec.clone();
        entry.release.ready = false;
        entry.polls_left = self.settle_polls;
        Ok(())
    }

    async fn delete_release(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_release", format!("{}/{}", namespace, name))?;

        let entry = state
            .releases
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        entry.release.deleting = true;
        entry.release.ready = false;
        entry.polls_left = self.settle_polls;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodStatus>, ClientError> {
        let mut state = self.lock();
        state.record("list_pods", namespace)?;

        Ok(state
            .releases
            .iter()
            .filter(|((ns, _), entry)| ns == namespace && !entry.release.deleting)
            .map(|((_, name), entry)| PodStatus {
                name: format!("{}-0", name),
                phase: if entry.release.ready {
                    PodPhase::Running
                } else {
                    PodPhase::Pending
                },
                ready: entry.release.ready,
            })
            .collect())
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("create_job", format!("{}/{}", spec.namespace, spec.name))?;

        let key = (spec.namespace.clone(), spec.name.clone());
        if state.jobs.contains_key(&key) {
            return Err(ClientError::AlreadyExists(spec.name.clone()));
        }
        let one_shot = spec.schedule.is_none();
        state.jobs.insert(
            key,
            JobEntry {
                spec: spec.clone(),
                status: JobStatus {
                    name: spec.name.clone(),
                    suspended: false,
                    active: u32::from(one_shot),
                    succeeded: 0,
                    failed: 0,
                },
                polls_left: self.settle_polls,
            },
        );
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<JobStatus>, ClientError> {
        let mut state = self.lock();
        state.record("get_job", format!("{}/{}", namespace, name))?;

        let Some(entry) = state
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
        else {
            return Ok(None);
        };

        if entry.polls_left > 0 {
            entry.polls_left -= 1;
        } else if entry.spec.schedule.is_none() && entry.status.active > 0 {
            entry.status.active = 0;
            entry.status.succeeded += 1;
        }
        Ok(Some(entry.status.clone()))
    }

    async fn suspend_job(
        &self,
        namespace: &str,
        name: &str,
        suspend: bool,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("suspend_job", format!("{}/{}", namespace, name))?;

        let entry = state
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
        entry.status.suspended = suspend;
        if suspend {
            entry.status.active = 0;
        }
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_job", format!("{}/{}", namespace, name))?;

        state
            .jobs
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl SecretVault for InMemoryCloud {
    async fn set_secret(&self, name: &str, value: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("set_secret", name)?;

        state.secrets.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_secret", name)?;

        state
            .secrets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, ClientError> {
        self.lock().record("encrypt", "")?;

        Ok(format!("{}{}", CIPHERTEXT_PREFIX, STANDARD.encode(plaintext)))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, ClientError> {
        self.lock().record("decrypt", "")?;

        let encoded = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| ClientError::Api("ciphertext was not produced by this vault".into()))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| ClientError::Api(format!("malformed ciphertext: {}", e)))
    }
}

#[async_trait]
impl ObjectStorage for InMemoryCloud {
    async fn create_bucket(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("create_bucket", name)?;

        if state.buckets.contains_key(name) {
            return Err(ClientError::AlreadyExists(name.to_string()));
        }
        state.buckets.insert(name.to_string(), BTreeSet::new());
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, max_keys: usize) -> Result<ObjectPage, ClientError> {
        let mut state = self.lock();
        state.record("list_objects", bucket)?;

        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| ClientError::NotFound(bucket.to_string()))?;
        Ok(ObjectPage {
            keys: objects.iter().take(max_keys).cloned().collect(),
            truncated: objects.len() > max_keys,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_objects", bucket)?;

        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| ClientError::NotFound(bucket.to_string()))?;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_bucket", name)?;

        match state.buckets.get(name) {
            None => Err(ClientError::NotFound(name.to_string())),
            Some(objects) if !objects.is_empty() => {
                Err(ClientError::Conflict(format!("bucket {} is not empty", name)))
            }
            Some(_) => {
                state.buckets.remove(name);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RoleBindingClient for InMemoryCloud {
    async fn put_binding(&self, binding: &RoleBinding) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record(
            "put_binding",
            format!("{}/{}", binding.workspace_id, binding.subject),
        )?;

        state.bindings.insert(
            (binding.workspace_id.clone(), binding.subject.clone()),
            binding.clone(),
        );
        Ok(())
    }

    async fn delete_binding(&self, workspace_id: &str, subject: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("delete_binding", format!("{}/{}", workspace_id, subject))?;

        state
            .bindings
            .remove(&(workspace_id.to_string(), subject.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(format!("{}/{}", workspace_id, subject)))
    }
}

#[async_trait]
impl IngressRouter for InMemoryCloud {
    async fn sync_routes(&self, routes: &[Route]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record("sync_routes", routes.len().to_string())?;

        state.routes = routes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_domain_converges_after_settle_polls() {
        let cloud = InMemoryCloud::with_settle_polls(1);
        let spec = DomainSpec {
            name: "search-a".into(),
            instance_type: "t3.small".into(),
            instance_count: 1,
            volume_gb: 10,
            access_role: "role".into(),
        };
        cloud.create_domain(&spec).await.unwrap();

        let first = cloud.describe_domain("search-a").await.unwrap().unwrap();
        assert!(first.processing);
        assert!(first.endpoint.is_none());

        let second = cloud.describe_domain("search-a").await.unwrap().unwrap();
        assert!(!second.processing);
        assert_eq!(
            second.endpoint.as_deref(),
            Some("https://search-a.search.local")
        );

        assert_eq!(
            cloud.create_domain(&spec).await,
            Err(ClientError::AlreadyExists("search-a".into()))
        );
    }

    #[tokio::test]
    async fn test_call_log_keeps_only_recent_calls() {
        let cloud = InMemoryCloud::new();
        for _ in 0..CALL_LOG_CAPACITY {
            cloud.sync_routes(&[]).await.unwrap();
        }
        cloud.create_bucket("last").await.unwrap();

        let calls = cloud.calls();
        assert_eq!(calls.len(), CALL_LOG_CAPACITY);
        assert_eq!(cloud.call_count("sync_routes"), CALL_LOG_CAPACITY - 1);
        assert_eq!(calls.last().map(|call| call.op), Some("create_bucket"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let cloud = InMemoryCloud::new();
        cloud.fail_next("create_bucket", ClientError::Api("throttled".into()));

        assert!(cloud.create_bucket("b").await.is_err());
        assert!(cloud.create_bucket("b").await.is_ok());
        assert_eq!(cloud.call_count("create_bucket"), 2);
    }

    #[tokio::test]
    async fn test_vault_round_trips_ciphertext() {
        let cloud = InMemoryCloud::new();
        let blob = cloud.encrypt(b"secret-key").await.unwrap();
        assert!(blob.starts_with(CIPHERTEXT_PREFIX));
        assert_eq!(cloud.decrypt(&blob).await.unwrap(), b"secret-key".to_vec());
        assert!(cloud.decrypt("plain").await.is_err());
    }

    #[tokio::test]
    async fn test_non_empty_bucket_cannot_be_deleted() {
        let cloud = InMemoryCloud::new();
        cloud.create_bucket("data").await.unwrap();
        cloud.put_object("data", "a.json");

        assert!(matches!(
            cloud.delete_bucket("data").await,
            Err(ClientError::Conflict(_))
        ));

        let page = cloud.list_objects("data", 10).await.unwrap();
        cloud.delete_objects("data", &page.keys).await.unwrap();
        assert!(cloud.delete_bucket("data").await.is_ok());
    }
}
