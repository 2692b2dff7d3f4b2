//! The periodic control loop.
//!
//! Each tick settles every workspace sitting in a processing status, then
//! runs the fleet-wide tasks: ingress sync, reservation and the deletion
//! sweep. Errors are logged per workspace and never end the loop.

use crate::clients::{Clients, Route};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::retry::{InFlight, RetryPolicy, RetryTracker};
use crate::state::StateTable;
use crate::transaction::{Naming, TransactionContext, TransactionRegistry};
use crate::transition::{Settlement, TransitionHandler};
use crate::workspace::{Workspace, WorkspaceFilters, WorkspaceStatus, WorkspaceStore};
use futures_util::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const GATEWAY_SERVICE: &str = "workspace-gateway";
const GATEWAY_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// Upper bound for a single apply or rollback
    pub call_timeout: Duration,
    /// Workspaces settled in parallel within one tick
    pub max_concurrent_workspaces: usize,
    pub retry: RetryPolicy,
    pub naming: Naming,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            max_concurrent_workspaces: 1,
            retry: RetryPolicy::default(),
            naming: Naming::default(),
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Workspaces listed
    pub seen: usize,
    /// Workspaces in a processing status that were settled
    pub settled: usize,
    pub advanced: usize,
    /// Settlements with a failed transaction or an error
    pub failed: usize,
    /// Workspaces skipped because another settlement held them
    pub busy: usize,
    pub reserved: Option<String>,
    pub swept: usize,
    pub routes: usize,
}

/// Everything the loop needs, passed explicitly.
#[derive(Clone)]
pub struct ReconcilerContext {
    pub store: WorkspaceStore,
    pub ledger: Ledger,
    pub registry: TransactionRegistry,
    pub states: Arc<StateTable>,
    pub transactions: TransactionContext,
    pub retry: Arc<RetryTracker>,
    pub in_flight: InFlight,
    pub settings: ReconcilerSettings,
}

enum SettleResult {
    Settled(Settlement),
    Busy,
    Errored,
}

pub struct Reconciler {
    ctx: ReconcilerContext,
    handler: TransitionHandler,
}

impl Reconciler {
    /// Reconciler over the standard transactions and states
    pub fn new(pool: SqlitePool, clients: Clients, settings: ReconcilerSettings) -> Result<Self> {
        Self::with_parts(
            pool,
            clients,
            settings,
            TransactionRegistry::standard(),
            StateTable::standard(),
        )
    }

    /// Build from explicit parts. Fails if the registry or the state table
    /// does not validate.
    pub fn with_parts(
        pool: SqlitePool,
        clients: Clients,
        settings: ReconcilerSettings,
        registry: TransactionRegistry,
        states: StateTable,
    ) -> Result<Self> {
        registry.validate()?;
        states.validate(&registry)?;

        let store = WorkspaceStore::new(pool.clone());
        let ledger = Ledger::new(pool);
        let retry = Arc::new(RetryTracker::new(settings.retry));
        let transactions = TransactionContext {
            clients,
            store: store.clone(),
            naming: settings.naming.clone(),
        };

        let handler = TransitionHandler::new(
            ledger.clone(),
            registry.clone(),
            transactions.clone(),
            retry.clone(),
            settings.call_timeout,
        );

        Ok(Self {
            ctx: ReconcilerContext {
                store,
                ledger,
                registry,
                states: Arc::new(states),
                transactions,
                retry,
                in_flight: InFlight::new(),
                settings,
            },
            handler,
        })
    }

    pub fn context(&self) -> &ReconcilerContext {
        &self.ctx
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let workspaces = self
            .ctx
            .store
            .list_workspaces(WorkspaceFilters::default())
            .await?;

        let mut report = TickReport {
            seen: workspaces.len(),
            ..TickReport::default()
        };

        let processing: Vec<Workspace> = workspaces
            .into_iter()
            .filter(|w| self.ctx.states.for_status(w.status).is_some())
            .collect();

        let results: Vec<SettleResult> = stream::iter(processing)
            .map(|workspace| self.settle_one(workspace))
            .buffer_unordered(self.ctx.settings.max_concurrent_workspaces.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                SettleResult::Settled(settlement) => {
                    report.settled += 1;
                    if settlement.advanced() {
                        report.advanced += 1;
                    }
                    if !settlement.failed.is_empty() {
                        report.failed += 1;
                    }
                }
                SettleResult::Busy => report.busy += 1,
                SettleResult::Errored => report.failed += 1,
            }
        }

        match self.sync_ingress().await {
            Ok(routes) => report.routes = routes,
            Err(e) => error!(error = %e, "Ingress sync failed"),
        }

        match self.ensure_reservation().await {
            Ok(reserved) => report.reserved = reserved,
            Err(e) => error!(error = %e, "Workspace reservation failed"),
        }

        match self.sweep_deleted().await {
            Ok(swept) => report.swept = swept,
            Err(e) => error!(error = %e, "Deletion sweep failed"),
        }

        Ok(report)
    }

    async fn settle_one(&self, workspace: Workspace) -> SettleResult {
        let Some(state) = self.ctx.states.for_status(workspace.status) else {
            return SettleResult::Busy;
        };

        let Some(_lease) = self.ctx.in_flight.try_acquire(&workspace.id) else {
            debug!(workspace_id = %workspace.id, "Workspace already being settled");
            return SettleResult::Busy;
        };

        let workspace_id = workspace.id.clone();
        match self.handler.settle(workspace, state).await {
            Ok(settlement) => SettleResult::Settled(settlement),
            Err(e) => {
                error!(workspace_id = %workspace_id, error = %e, "Failed to settle workspace");
                SettleResult::Errored
            }
        }
    }

    /// Publish the full route table for serving workspaces. Returns the
    /// number of routes.
    pub async fn sync_ingress(&self) -> Result<usize> {
        let naming = &self.ctx.settings.naming;

        let mut routes: Vec<Route> = self
            .ctx
            .store
            .list_workspaces(WorkspaceFilters::default())
            .await?
            .into_iter()
            .filter(|w| w.status.is_serving() && w.release_installed)
            .map(|w| Route {
                host: naming.host(&w),
                namespace: naming.namespace(&w),
                service: GATEWAY_SERVICE.to_string(),
                port: GATEWAY_PORT,
            })
            .collect();
        routes.sort();

        self.ctx.transactions.clients.ingress.sync_routes(&routes).await?;

        Ok(routes.len())
    }

    /// Keep one unclaimed workspace warming up or ready to claim
    pub async fn ensure_reservation(&self) -> Result<Option<String>> {
        let store = &self.ctx.store;

        for status in [WorkspaceStatus::Reserving, WorkspaceStatus::Reserved] {
            if !store.get_workspaces_by_status(status).await?.is_empty() {
                return Ok(None);
            }
        }

        let workspace = store.reserve_workspace().await?;
        info!(workspace_id = %workspace.id, "Reserved new workspace");

        Ok(Some(workspace.id))
    }

    /// Hard-delete every workspace that reached `deleted`
    pub async fn sweep_deleted(&self) -> Result<usize> {
        let deleted = self
            .ctx
            .store
            .get_workspaces_by_status(WorkspaceStatus::Deleted)
            .await?;

        let mut swept = 0;
        for workspace in deleted {
            match self.ctx.store.hard_delete_workspace(&workspace.id).await {
                Ok(()) => {
                    self.ctx.retry.forget_workspace(&workspace.id);
                    info!(workspace_id = %workspace.id, "Removed deleted workspace");
                    swept += 1;
                }
                Err(e) => {
                    warn!(workspace_id = %workspace.id, error = %e, "Failed to remove deleted workspace")
                }
            }
        }

        Ok(swept)
    }

    /// Tick on the configured interval until `shutdown` turns true or its
    /// sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.ctx.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.ctx.settings.interval.as_secs(),
            max_concurrent = self.ctx.settings.max_concurrent_workspaces,
            "Reconciler running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(?report, "Reconcile tick finished"),
                        Err(e) => error!(error = %e, "Reconcile tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}

/// Run the loop in its own task and start it again whenever it panics.
/// Returns the number of restarts once shut down.
pub async fn run_supervised(
    reconciler: Arc<Reconciler>,
    mut shutdown: watch::Receiver<bool>,
) -> u32 {
    let restart_delay = reconciler.ctx.settings.interval;
    let mut restarts = 0;

    loop {
        if *shutdown.borrow() {
            return restarts;
        }

        let task = tokio::spawn({
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            async move { reconciler.run(shutdown).await }
        });

        match task.await {
            Ok(()) => return restarts,
            Err(e) if e.is_panic() => {
                restarts += 1;
                error!(restarts, "Reconciler panicked, restarting");
                tokio::select! {
                    _ = tokio::time::sleep(restart_delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return restarts;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Reconciler task cancelled");
                return restarts;
            }
        }
    }
}
