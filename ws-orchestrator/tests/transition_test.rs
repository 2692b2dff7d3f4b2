//! Settlement semantics with scripted transactions: requirement ordering,
//! rollback ordering, status advancement, backoff and timeouts.

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ws_orchestrator::test_utils::{create_test_db, test_context};
use ws_orchestrator::{
    InMemoryCloud, Ledger, OrchestratorError, Outcome, RetryPolicy, RetryTracker, State,
    Transaction, TransactionContext, TransactionError, TransactionId, TransactionRegistry,
    TransitionHandler, Workspace, WorkspaceStatus, WorkspaceStore,
};

const R1: TransactionId = TransactionId::CreateServiceAccountRoles;
const R2: TransactionId = TransactionId::CreateDataBucket;
const X: TransactionId = TransactionId::CreateRoleBinding;

type CallLog = Arc<Mutex<Vec<(TransactionId, &'static str)>>>;

#[derive(Debug, Clone, Copy)]
enum Step {
    Done,
    NeedsTime,
    Fail,
}

struct Scripted {
    id: TransactionId,
    requires: &'static [TransactionId],
    apply_steps: Mutex<VecDeque<Step>>,
    rollback_steps: Mutex<VecDeque<Step>>,
    log: CallLog,
}

impl Scripted {
    fn new(id: TransactionId, requires: &'static [TransactionId], log: &CallLog) -> Self {
        Self {
            id,
            requires,
            apply_steps: Mutex::new(VecDeque::new()),
            rollback_steps: Mutex::new(VecDeque::new()),
            log: log.clone(),
        }
    }

    fn on_apply(self, steps: &[Step]) -> Self {
        self.apply_steps.lock().unwrap().extend(steps.iter().copied());
        self
    }

    fn on_rollback(self, steps: &[Step]) -> Self {
        self.rollback_steps
            .lock()
            .unwrap()
            .extend(steps.iter().copied());
        self
    }

    fn next(&self, steps: &Mutex<VecDeque<Step>>, action: &'static str) -> Outcome {
        self.log.lock().unwrap().push((self.id, action));
        match steps.lock().unwrap().pop_front().unwrap_or(Step::Done) {
            Step::Done => Outcome::Done,
            Step::NeedsTime => Outcome::NeedsTime,
            Step::Fail => Outcome::Failed(TransactionError::Remote("scripted failure".into())),
        }
    }
}

#[async_trait]
impl Transaction for Scripted {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn requirements(&self) -> &'static [TransactionId] {
        self.requires
    }

    async fn apply(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        self.next(&self.apply_steps, "apply")
    }

    async fn rollback(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        self.next(&self.rollback_steps, "rollback")
    }
}

struct Slow(TransactionId);

#[async_trait]
impl Transaction for Slow {
    fn id(&self) -> TransactionId {
        self.0
    }

    fn requirements(&self) -> &'static [TransactionId] {
        &[]
    }

    async fn apply(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Outcome::Done
    }

    async fn rollback(&self, _ctx: &TransactionContext, _workspace: &Workspace) -> Outcome {
        Outcome::Done
    }
}

struct Fixed(&'static [TransactionId]);

impl State for Fixed {
    fn requirements(&self, _workspace: &Workspace) -> BTreeSet<TransactionId> {
        self.declared()
    }

    fn processing_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Reserving
    }

    fn finished_state_id(&self) -> WorkspaceStatus {
        WorkspaceStatus::Reserved
    }

    fn declared(&self) -> BTreeSet<TransactionId> {
        self.0.iter().copied().collect()
    }
}

struct Fixture {
    store: WorkspaceStore,
    ledger: Ledger,
    ctx: TransactionContext,
    workspace_id: String,
    log: CallLog,
}

impl Fixture {
    async fn new() -> Self {
        let pool = create_test_db().await;
        let cloud = Arc::new(InMemoryCloud::new());
        let ctx = test_context(&pool, &cloud);
        let store = WorkspaceStore::new(pool.clone());
        let workspace = store.reserve_workspace().await.unwrap();

        Self {
            store,
            ledger: Ledger::new(pool),
            ctx,
            workspace_id: workspace.id,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn handler(&self, registry: TransactionRegistry) -> TransitionHandler {
        self.handler_with(registry, RetryPolicy::default(), Duration::from_secs(5))
    }

    fn handler_with(
        &self,
        registry: TransactionRegistry,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> TransitionHandler {
        TransitionHandler::new(
            self.ledger.clone(),
            registry,
            self.ctx.clone(),
            Arc::new(RetryTracker::new(policy)),
            call_timeout,
        )
    }

    async fn workspace(&self) -> Workspace {
        self.store.get_workspace(&self.workspace_id).await.unwrap()
    }

    async fn done(&self) -> BTreeSet<TransactionId> {
        self.ledger.done_set(&self.workspace_id).await.unwrap()
    }

    fn calls(&self) -> Vec<(TransactionId, &'static str)> {
        self.log.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_requirements_apply_one_layer_per_settlement() {
    let fx = Fixture::new().await;
    let registry = TransactionRegistry::new()
        .with(Arc::new(Scripted::new(R1, &[], &fx.log)))
        .with(Arc::new(Scripted::new(R2, &[R1], &fx.log)));
    let handler = fx.handler(registry);
    let state = Fixed(&[R1, R2]);

    let first = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(first.applied, vec![R1]);
    assert_eq!(first.pending, vec![R2]);
    assert!(!first.advanced());
    assert_eq!(fx.calls(), vec![(R1, "apply")]);
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserving);

    let second = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(second.applied, vec![R2]);
    assert!(!second.advanced());
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserving);

    let third = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert!(third.applied.is_empty());
    assert_eq!(third.advanced_to, Some(WorkspaceStatus::Reserved));
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserved);
    assert_eq!(fx.done().await, BTreeSet::from([R1, R2]));
}

#[tokio::test]
async fn test_needs_time_keeps_status() {
    let fx = Fixture::new().await;
    let registry = TransactionRegistry::new()
        .with(Arc::new(Scripted::new(R1, &[], &fx.log).on_apply(&[Step::NeedsTime])));
    let handler = fx.handler(registry);
    let state = Fixed(&[R1]);

    let first = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(first.pending, vec![R1]);
    assert!(fx.done().await.is_empty());

    let second = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(second.applied, vec![R1]);
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserving);

    let third = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert!(third.advanced());
}

#[tokio::test]
async fn test_extraneous_entry_is_rolled_back_before_advancing() {
    let fx = Fixture::new().await;
    fx.ledger.mark_done(&fx.workspace_id, X).await.unwrap();

    let registry = TransactionRegistry::new().with(Arc::new(
        Scripted::new(X, &[], &fx.log).on_rollback(&[Step::NeedsTime, Step::Done]),
    ));
    let handler = fx.handler(registry);
    let state = Fixed(&[]);

    let first = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert!(first.rolled_back.is_empty());
    assert_eq!(first.pending, vec![X]);
    assert!(!first.advanced());
    assert_eq!(fx.done().await, BTreeSet::from([X]));
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserving);

    let second = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(second.rolled_back, vec![X]);
    assert!(second.advanced());
    assert!(fx.done().await.is_empty());
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserved);
}

#[tokio::test]
async fn test_started_apply_is_rolled_back_once_no_longer_required() {
    let fx = Fixture::new().await;
    let registry = TransactionRegistry::new()
        .with(Arc::new(Scripted::new(R1, &[], &fx.log).on_apply(&[Step::NeedsTime])));
    let handler = fx.handler(registry);

    let first = handler
        .settle(fx.workspace().await, &Fixed(&[R1]))
        .await
        .unwrap();
    assert_eq!(first.pending, vec![R1]);
    assert!(fx.done().await.is_empty());
    let entries = fx.ledger.entries(&fx.workspace_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].done);

    // The requirement went away while the create was still converging
    let second = handler
        .settle(fx.workspace().await, &Fixed(&[]))
        .await
        .unwrap();
    assert_eq!(second.rolled_back, vec![R1]);
    assert!(second.advanced());
    assert!(fx.ledger.entries(&fx.workspace_id).await.unwrap().is_empty());
    assert_eq!(fx.calls(), vec![(R1, "apply"), (R1, "rollback")]);
}

#[tokio::test]
async fn test_rollback_waits_for_dependents() {
    let fx = Fixture::new().await;
    fx.ledger.mark_done(&fx.workspace_id, R1).await.unwrap();
    fx.ledger.mark_done(&fx.workspace_id, R2).await.unwrap();

    let registry = TransactionRegistry::new()
        .with(Arc::new(Scripted::new(R1, &[], &fx.log)))
        .with(Arc::new(
            Scripted::new(R2, &[R1], &fx.log).on_rollback(&[Step::NeedsTime]),
        ));
    let handler = fx.handler(registry);
    let state = Fixed(&[]);

    let first = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(fx.calls(), vec![(R2, "rollback")]);
    assert_eq!(first.pending, vec![R2, R1]);
    assert_eq!(fx.done().await, BTreeSet::from([R1, R2]));

    let second = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(second.rolled_back, vec![R2, R1]);
    assert!(second.advanced());
    assert_eq!(
        fx.calls(),
        vec![(R2, "rollback"), (R2, "rollback"), (R1, "rollback")]
    );
}

#[tokio::test]
async fn test_rollback_waits_for_requirements_to_settle() {
    let fx = Fixture::new().await;
    fx.ledger.mark_done(&fx.workspace_id, X).await.unwrap();

    let registry = TransactionRegistry::new()
        .with(Arc::new(Scripted::new(R1, &[], &fx.log)))
        .with(Arc::new(Scripted::new(X, &[], &fx.log)));
    let handler = fx.handler(registry);
    let state = Fixed(&[R1]);

    let first = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(first.applied, vec![R1]);
    assert!(first.rolled_back.is_empty());

    let second = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(second.rolled_back, vec![X]);
    assert!(second.advanced());
    assert_eq!(fx.calls(), vec![(R1, "apply"), (X, "rollback")]);
}

#[tokio::test]
async fn test_failed_transaction_backs_off() {
    let fx = Fixture::new().await;
    let registry = TransactionRegistry::new()
        .with(Arc::new(Scripted::new(R1, &[], &fx.log).on_apply(&[Step::Fail])));
    let policy = RetryPolicy {
        base: Duration::from_secs(3600),
        max: Duration::from_secs(3600),
        stuck_threshold: 10,
    };
    let handler = fx.handler_with(registry, policy, Duration::from_secs(5));
    let state = Fixed(&[R1]);

    let first = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(first.failed, vec![R1]);
    assert!(fx.done().await.is_empty());

    let second = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert!(second.failed.is_empty());
    assert_eq!(second.pending, vec![R1]);
    assert_eq!(fx.calls().len(), 1);
}

#[tokio::test]
async fn test_failure_without_backoff_is_retried_next_settlement() {
    let fx = Fixture::new().await;
    let registry = TransactionRegistry::new().with(Arc::new(
        Scripted::new(R1, &[], &fx.log).on_apply(&[Step::Fail, Step::Fail]),
    ));
    let policy = RetryPolicy {
        base: Duration::ZERO,
        max: Duration::ZERO,
        stuck_threshold: 2,
    };
    let handler = fx.handler_with(registry, policy, Duration::from_secs(5));
    let state = Fixed(&[R1]);

    for _ in 0..2 {
        let settlement = handler.settle(fx.workspace().await, &state).await.unwrap();
        assert_eq!(settlement.failed, vec![R1]);
    }

    let recovered = handler.settle(fx.workspace().await, &state).await.unwrap();
    assert_eq!(recovered.applied, vec![R1]);
    assert_eq!(fx.calls().len(), 3);
}

#[tokio::test]
async fn test_slow_transaction_times_out() {
    let fx = Fixture::new().await;
    let registry = TransactionRegistry::new().with(Arc::new(Slow(R1)));
    let handler = fx.handler_with(registry, RetryPolicy::default(), Duration::from_millis(20));

    let settlement = handler
        .settle(fx.workspace().await, &Fixed(&[R1]))
        .await
        .unwrap();
    assert_eq!(settlement.failed, vec![R1]);
    assert!(fx.done().await.is_empty());
}

#[tokio::test]
async fn test_unregistered_requirement_is_a_configuration_error() {
    let fx = Fixture::new().await;
    let handler = fx.handler(TransactionRegistry::new());

    let result = handler.settle(fx.workspace().await, &Fixed(&[R1])).await;
    assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    assert_eq!(fx.workspace().await.status, WorkspaceStatus::Reserving);
}
