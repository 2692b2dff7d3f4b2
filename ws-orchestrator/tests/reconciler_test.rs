//! End-to-end reconciler runs against the in-memory cloud.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use ws_orchestrator::test_utils::{create_test_db, fast_settings};
use ws_orchestrator::transaction::CreateServiceAccountRoles;
use ws_orchestrator::{
    run_supervised, ClientError, Clients, InMemoryCloud, Ledger, OrchestratorError, Outcome,
    Reconciler, RetryPolicy, StateTable, Transaction, TransactionContext, TransactionId,
    TransactionRegistry, Workspace, WorkspaceFilters, WorkspaceLifecycle, WorkspaceStatus,
    WorkspaceStore, WorkspaceTier,
};

struct Harness {
    cloud: Arc<InMemoryCloud>,
    store: WorkspaceStore,
    ledger: Ledger,
    lifecycle: WorkspaceLifecycle,
    reconciler: Reconciler,
}

impl Harness {
    async fn new() -> Self {
        Self::with_retry(fast_settings().retry).await
    }

    async fn with_retry(retry: RetryPolicy) -> Self {
        Self::with_cloud(InMemoryCloud::new(), retry).await
    }

    async fn with_cloud(cloud: InMemoryCloud, retry: RetryPolicy) -> Self {
        let pool = create_test_db().await;
        let cloud = Arc::new(cloud);
        let mut settings = fast_settings();
        settings.retry = retry;
        let reconciler =
            Reconciler::new(pool.clone(), Clients::from_backend(cloud.clone()), settings)
                .expect("standard reconciler should validate");
        let store = WorkspaceStore::new(pool.clone());

        Self {
            lifecycle: WorkspaceLifecycle::new(store.clone(), cloud.clone()),
            cloud,
            store,
            ledger: Ledger::new(pool),
            reconciler,
        }
    }

    async fn status(&self, id: &str) -> Option<WorkspaceStatus> {
        match self.store.get_workspace(id).await {
            Ok(workspace) => Some(workspace.status),
            Err(OrchestratorError::NotFound(_)) => None,
            Err(e) => panic!("failed to load workspace {}: {}", id, e),
        }
    }

    /// Tick until the workspace has `target` status (or is gone when
    /// `target` is None)
    async fn tick_until(&self, id: &str, target: Option<WorkspaceStatus>, max_ticks: usize) {
        for _ in 0..max_ticks {
            self.reconciler.tick().await.expect("tick failed");
            if self.status(id).await == target {
                return;
            }
        }
        panic!(
            "workspace {} stuck at {:?} instead of {:?}",
            id,
            self.status(id).await,
            target
        );
    }

    async fn reserved_workspace(&self) -> Workspace {
        let report = self.reconciler.tick().await.unwrap();
        let id = report.reserved.expect("first tick reserves a workspace");
        self.tick_until(&id, Some(WorkspaceStatus::Reserved), 20)
            .await;
        self.store.get_workspace(&id).await.unwrap()
    }
}

#[tokio::test]
async fn test_full_workspace_lifecycle() {
    let h = Harness::new().await;

    let reserved = h.reserved_workspace().await;
    let id = reserved.id.clone();
    assert!(reserved.search_endpoint.is_some());
    assert!(reserved.ingestion_endpoint.is_some());
    assert!(reserved.vault_key_id.is_some());
    assert_eq!(
        h.ledger.done_set(&id).await.unwrap().len(),
        5,
        "reserving set"
    );

    let claimed = h
        .lifecycle
        .claim("analytics", "alice", WorkspaceTier::Medium)
        .await
        .unwrap();
    assert_eq!(claimed.id, id);

    h.tick_until(&id, Some(WorkspaceStatus::WaitingForCredential), 20)
        .await;
    let workspace = h.store.get_workspace(&id).await.unwrap();
    assert!(workspace.release_installed);
    assert!(h.cloud.binding(&id, "alice").is_some());
    let host = format!("{}.workspaces.local", id);
    assert!(h.cloud.routes().iter().any(|route| route.host == host));

    h.lifecycle
        .attach_credential(&id, "AKIA:secret")
        .await
        .unwrap();
    h.tick_until(&id, Some(WorkspaceStatus::Provisioned), 20)
        .await;

    let workspace = h.store.get_workspace(&id).await.unwrap();
    assert!(workspace.credential_onboarded);
    assert!(workspace.compliance_triggered);
    assert_eq!(workspace.analytics_job, Some(format!("ws-{}/analytics", id)));
    let master = format!("ws-{}-master-credential", id);
    assert_eq!(h.cloud.secret(&master).as_deref(), Some("AKIA:secret"));
    let release = h.cloud.release(&format!("ws-{}", id), "workspace").unwrap();
    assert_eq!(release.spec.values["credential"]["enabled"], true);
    assert_eq!(h.ledger.done_set(&id).await.unwrap().len(), 12);

    // Detaching rolls the credential transactions back
    h.lifecycle.detach_credential(&id).await.unwrap();
    h.tick_until(&id, Some(WorkspaceStatus::WaitingForCredential), 20)
        .await;

    let workspace = h.store.get_workspace(&id).await.unwrap();
    assert!(!workspace.credential_onboarded);
    assert!(!workspace.compliance_triggered);
    assert!(workspace.analytics_job.is_none());
    assert!(h.cloud.secret(&master).is_none());
    assert!(h.cloud.job(&format!("ws-{}", id), "analytics").is_none());
    assert_eq!(h.ledger.done_set(&id).await.unwrap().len(), 8);

    h.lifecycle.request_deletion(&id).await.unwrap();
    h.tick_until(&id, None, 40).await;

    assert!(h.ledger.entries(&id).await.unwrap().is_empty());
    assert!(h.cloud.role_policies(&format!("ws-{}-workload", id)).is_none());
    assert!(h.cloud.domain(&format!("ws-{}", id)).is_none());
    assert!(h.cloud.pipeline_state(&format!("ws-{}-ingest", id)).is_none());
    assert!(h.cloud.bucket_objects(&format!("ws-{}-data", id)).is_none());
    assert!(h.cloud.release(&format!("ws-{}", id), "workspace").is_none());
    assert!(h.cloud.binding(&id, "alice").is_none());
    assert!(!h
        .cloud
        .secret_names()
        .iter()
        .any(|name| name.starts_with(&format!("ws-{}-", id))));
    assert!(!h.cloud.routes().iter().any(|route| route.host == host));
}

#[tokio::test]
async fn test_credential_attached_while_provisioning_onboards() {
    let h = Harness::new().await;
    let id = h.reserved_workspace().await.id;

    h.lifecycle
        .claim("analytics", "alice", WorkspaceTier::Small)
        .await
        .unwrap();
    h.lifecycle
        .attach_credential(&id, "AKIA:secret")
        .await
        .unwrap();
    h.tick_until(&id, Some(WorkspaceStatus::Provisioned), 40)
        .await;

    let workspace = h.store.get_workspace(&id).await.unwrap();
    assert!(workspace.credential_onboarded);
    let master = format!("ws-{}-master-credential", id);
    assert_eq!(h.cloud.secret(&master).as_deref(), Some("AKIA:secret"));
    assert!(h
        .ledger
        .done_set(&id)
        .await
        .unwrap()
        .contains(&TransactionId::CreateMasterCredential));
}

#[tokio::test]
async fn test_deleting_mid_create_tears_down_converging_resources() {
    let h = Harness::with_cloud(InMemoryCloud::with_settle_polls(3), fast_settings().retry).await;
    let report = h.reconciler.tick().await.unwrap();
    let id = report.reserved.expect("first tick reserves a workspace");
    let domain = format!("ws-{}", id);

    for _ in 0..10 {
        if h.cloud.domain(&domain).is_some() {
            break;
        }
        h.reconciler.tick().await.unwrap();
    }
    assert!(h.cloud.domain(&domain).is_some(), "domain create was issued");
    assert!(!h
        .ledger
        .done_set(&id)
        .await
        .unwrap()
        .contains(&TransactionId::CreateOpenSearch));

    h.lifecycle.request_deletion(&id).await.unwrap();
    h.tick_until(&id, None, 60).await;

    assert!(h.cloud.domain(&domain).is_none());
    assert!(h.cloud.bucket_objects(&format!("ws-{}-data", id)).is_none());
    assert!(h.cloud.role_policies(&format!("ws-{}-workload", id)).is_none());
}

#[tokio::test]
async fn test_deleting_drains_analytics_runs_first() {
    let h = Harness::new().await;
    let id = h.reserved_workspace().await.id;
    h.lifecycle
        .claim("analytics", "alice", WorkspaceTier::Small)
        .await
        .unwrap();
    h.tick_until(&id, Some(WorkspaceStatus::WaitingForCredential), 20)
        .await;
    h.lifecycle.attach_credential(&id, "key").await.unwrap();
    h.tick_until(&id, Some(WorkspaceStatus::Provisioned), 20)
        .await;

    h.lifecycle.request_deletion(&id).await.unwrap();
    h.cloud.clear_calls();
    h.reconciler.tick().await.unwrap();

    // First deletion tick only suspends the job; nothing is torn down yet
    let ops: Vec<&str> = h.cloud.calls().iter().map(|call| call.op).collect();
    assert!(ops.contains(&"suspend_job"));
    assert!(!ops.contains(&"delete_release"));
    assert!(!ops.contains(&"delete_job"));
    assert_eq!(h.status(&id).await, Some(WorkspaceStatus::Deleting));

    h.tick_until(&id, None, 40).await;
}

#[tokio::test]
async fn test_single_reservation_is_kept() {
    let h = Harness::new().await;

    let first = h.reconciler.tick().await.unwrap();
    assert!(first.reserved.is_some());
    let second = h.reconciler.tick().await.unwrap();
    assert!(second.reserved.is_none());

    let all = h
        .store
        .list_workspaces(WorkspaceFilters::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_failed_transaction_is_not_retried_during_backoff() {
    let h = Harness::with_retry(RetryPolicy {
        base: Duration::from_secs(3600),
        max: Duration::from_secs(3600),
        stuck_threshold: 10,
    })
    .await;
    h.reconciler.tick().await.unwrap();

    h.cloud
        .fail_next("get_role", ClientError::Api("throttled".into()));
    let report = h.reconciler.tick().await.unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(report.failed, 1);

    h.reconciler.tick().await.unwrap();
    assert_eq!(h.cloud.call_count("get_role"), 1);
}

#[tokio::test]
async fn test_concurrent_settlement_reaches_same_result() {
    let pool = create_test_db().await;
    let cloud = Arc::new(InMemoryCloud::new());
    let mut settings = fast_settings();
    settings.max_concurrent_workspaces = 4;
    let reconciler =
        Reconciler::new(pool.clone(), Clients::from_backend(cloud.clone()), settings).unwrap();
    let store = WorkspaceStore::new(pool);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(store.reserve_workspace().await.unwrap().id);
    }

    for _ in 0..20 {
        reconciler.tick().await.unwrap();
    }

    for id in ids {
        assert_eq!(
            store.get_workspace(&id).await.unwrap().status,
            WorkspaceStatus::Reserved
        );
    }
    assert_eq!(cloud.call_count("create_domain"), 3);
}

#[tokio::test]
async fn test_invalid_registry_is_rejected_at_startup() {
    let pool = create_test_db().await;
    let cloud = Arc::new(InMemoryCloud::new());
    let registry = TransactionRegistry::new().with(Arc::new(CreateServiceAccountRoles));

    let result = Reconciler::with_parts(
        pool,
        Clients::from_backend(cloud),
        fast_settings(),
        registry,
        StateTable::standard(),
    );
    assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
}

/// Panics on its first apply, then behaves
struct PanicOnce {
    panicked: AtomicBool,
}

#[async_trait]
impl Transaction for PanicOnce {
    fn id(&self) -> TransactionId {
        TransactionId::CreateServiceAccountRoles
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[]
    }

    async fn apply(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("transaction blew up");
        }
        Outcome::Done
    }

    async fn rollback(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        Outcome::Done
    }
}

#[tokio::test]
async fn test_supervisor_restarts_after_panic() {
    let pool = create_test_db().await;
    let cloud = Arc::new(InMemoryCloud::new());
    let registry = TransactionRegistry::standard().with(Arc::new(PanicOnce {
        panicked: AtomicBool::new(false),
    }));
    let reconciler = Arc::new(
        Reconciler::with_parts(
            pool.clone(),
            Clients::from_backend(cloud),
            fast_settings(),
            registry,
            StateTable::standard(),
        )
        .unwrap(),
    );
    let store = WorkspaceStore::new(pool.clone());
    let ledger = Ledger::new(pool);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(run_supervised(reconciler, shutdown_rx));

    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let reserved = store
                .get_workspaces_by_status(WorkspaceStatus::Reserved)
                .await
                .unwrap();
            if let Some(workspace) = reserved.first() {
                let done = ledger.done_set(&workspace.id).await.unwrap();
                if done.contains(&TransactionId::CreateServiceAccountRoles) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "reconciler did not recover after panic");

    shutdown_tx.send(true).unwrap();
    let restarts = supervisor.await.unwrap();
    assert_eq!(restarts, 1);
}

#[tokio::test]
async fn test_supervisor_stops_on_shutdown() {
    let pool = create_test_db().await;
    let cloud = Arc::new(InMemoryCloud::new());
    let reconciler =
        Arc::new(Reconciler::new(pool, Clients::from_backend(cloud), fast_settings()).unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(run_supervised(reconciler, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(30)).await;

    shutdown_tx.send(true).unwrap();
    let restarts = tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert_eq!(restarts, 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_restart_delay() {
    let pool = create_test_db().await;
    let cloud = Arc::new(InMemoryCloud::new());
    let panicking = Arc::new(PanicOnce {
        panicked: AtomicBool::new(false),
    });
    let registry = TransactionRegistry::standard().with(panicking.clone());
    let mut settings = fast_settings();
    settings.interval = Duration::from_secs(3600);
    let reconciler = Arc::new(
        Reconciler::with_parts(
            pool.clone(),
            Clients::from_backend(cloud),
            settings,
            registry,
            StateTable::standard(),
        )
        .unwrap(),
    );
    // Settled on the very first tick, so the panic happens right away
    WorkspaceStore::new(pool).reserve_workspace().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(run_supervised(reconciler, shutdown_rx));

    let panicked = tokio::time::timeout(Duration::from_secs(5), async {
        while !panicking.panicked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(panicked.is_ok(), "transaction never ran");
    // Let the supervisor observe the panic and enter its restart delay
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).unwrap();
    let restarts = tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor waited out the restart delay")
        .unwrap();
    assert_eq!(restarts, 1);
}
