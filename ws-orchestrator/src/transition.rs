//! Moves one workspace towards the finished status of its current state.

use crate::error::Result;
use crate::ledger::Ledger;
use crate::retry::RetryTracker;
use crate::state::State;
use crate::transaction::{
    Outcome, TransactionContext, TransactionError, TransactionId, TransactionRegistry,
};
use crate::workspace::{Workspace, WorkspaceStatus};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// What one settlement did to a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    pub workspace_id: String,
    /// Transactions marked done in this settlement
    pub applied: Vec<TransactionId>,
    /// Transactions whose ledger entry was removed in this settlement
    pub rolled_back: Vec<TransactionId>,
    /// Transactions that need time, wait for prerequisites or back off
    pub pending: Vec<TransactionId>,
    pub failed: Vec<TransactionId>,
    /// Set when the workspace reached the finished status
    pub advanced_to: Option<WorkspaceStatus>,
}

impl Settlement {
    fn new(workspace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            ..Self::default()
        }
    }

    pub fn advanced(&self) -> bool {
        self.advanced_to.is_some()
    }
}

#[derive(Clone)]
pub struct TransitionHandler {
    ledger: Ledger,
    registry: TransactionRegistry,
    ctx: TransactionContext,
    retry: Arc<RetryTracker>,
    call_timeout: Duration,
}

impl TransitionHandler {
    pub fn new(
        ledger: Ledger,
        registry: TransactionRegistry,
        ctx: TransactionContext,
        retry: Arc<RetryTracker>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            ctx,
            retry,
            call_timeout,
        }
    }

    /// Run one settlement pass.
    ///
    /// Missing requirements are applied first, in dependency order, against
    /// the ledger as it stood when the pass started. Only once every
    /// requirement was already done are extraneous entries rolled back, and
    /// only once nothing extraneous remains does the status advance.
    #[instrument(
        skip(self, workspace, state),
        fields(workspace_id = %workspace.id, status = %workspace.status)
    )]
    pub async fn settle(&self, workspace: Workspace, state: &dyn State) -> Result<Settlement> {
        let mut workspace = workspace;
        let mut settlement = Settlement::new(&workspace.id);

        let required = state.requirements(&workspace);
        let done_at_start = self.ledger.done_set(&workspace.id).await?;

        let missing: BTreeSet<TransactionId> =
            required.difference(&done_at_start).copied().collect();
        if !missing.is_empty() {
            self.apply_pass(&mut workspace, &missing, &done_at_start, &mut settlement)
                .await?;
            return Ok(settlement);
        }

        // Started but unfinished applies count: their create may have landed
        let recorded = self.ledger.recorded_set(&workspace.id).await?;
        let extraneous: BTreeSet<TransactionId> =
            recorded.difference(&required).copied().collect();
        if !extraneous.is_empty() {
            self.rollback_pass(&mut workspace, &extraneous, &recorded, &mut settlement)
                .await?;

            let remaining = self.ledger.recorded_set(&workspace.id).await?;
            if !remaining.is_subset(&required) {
                return Ok(settlement);
            }
        }

        let from = state.processing_state_id();
        let finished = state.finished_state_id();
        if !self
            .ctx
            .store
            .advance_status(&workspace.id, from, finished)
            .await?
        {
            debug!(workspace_id = %workspace.id, "Status changed during settlement");
            return Ok(settlement);
        }
        info!(
            workspace_id = %workspace.id,
            from = %from,
            to = %finished,
            "Workspace settled"
        );
        settlement.advanced_to = Some(finished);

        Ok(settlement)
    }

    async fn apply_pass(
        &self,
        workspace: &mut Workspace,
        missing: &BTreeSet<TransactionId>,
        done_at_start: &BTreeSet<TransactionId>,
        settlement: &mut Settlement,
    ) -> Result<()> {
        for id in self.registry.dependency_order(missing)? {
            let transaction = self.registry.get(id)?;

            if let Some(unmet) = transaction
                .requirements()
                .iter()
                .find(|requirement| !done_at_start.contains(requirement))
            {
                debug!(workspace_id = %workspace.id, transaction = %id, waiting_on = %unmet, "Prerequisite not done");
                settlement.pending.push(id);
                continue;
            }

            if self.retry.is_backing_off(&workspace.id, id) {
                settlement.pending.push(id);
                continue;
            }

            self.ledger.mark_started(&workspace.id, id).await?;
            let outcome = self
                .bounded(transaction.apply(&self.ctx, workspace))
                .await;

            if self.record(workspace, id, outcome, settlement, "apply") {
                self.ledger.mark_done(&workspace.id, id).await?;
                settlement.applied.push(id);
            }

            *workspace = self.ctx.store.get_workspace(&workspace.id).await?;
        }

        Ok(())
    }

    async fn rollback_pass(
        &self,
        workspace: &mut Workspace,
        extraneous: &BTreeSet<TransactionId>,
        recorded: &BTreeSet<TransactionId>,
        settlement: &mut Settlement,
    ) -> Result<()> {
        let mut present = recorded.clone();

        for id in self.registry.dependency_order(extraneous)?.into_iter().rev() {
            if let Some(dependent) = present
                .iter()
                .find(|other| **other != id && self.registry.requires_transitively(**other, id))
            {
                debug!(workspace_id = %workspace.id, transaction = %id, dependent = %dependent, "Dependent still provisioned");
                settlement.pending.push(id);
                continue;
            }

            if self.retry.is_backing_off(&workspace.id, id) {
                settlement.pending.push(id);
                continue;
            }

            let transaction = self.registry.get(id)?;
            let outcome = self
                .bounded(transaction.rollback(&self.ctx, workspace))
                .await;

            if self.record(workspace, id, outcome, settlement, "rollback") {
                self.ledger.remove(&workspace.id, id).await?;
                present.remove(&id);
                settlement.rolled_back.push(id);
            }

            *workspace = self.ctx.store.get_workspace(&workspace.id).await?;
        }

        Ok(())
    }

    async fn bounded<F>(&self, call: F) -> Outcome
    where
        F: Future<Output = Outcome>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failed(TransactionError::Timeout(self.call_timeout)),
        }
    }

    /// Book the outcome with the retry tracker. Returns whether it was Done.
    fn record(
        &self,
        workspace: &Workspace,
        id: TransactionId,
        outcome: Outcome,
        settlement: &mut Settlement,
        action: &'static str,
    ) -> bool {
        match outcome {
            Outcome::Done => {
                self.retry.record_progress(&workspace.id, id);
                debug!(workspace_id = %workspace.id, transaction = %id, action, "Transaction done");
                true
            }
            Outcome::NeedsTime => {
                self.retry.record_progress(&workspace.id, id);
                settlement.pending.push(id);
                false
            }
            Outcome::Failed(e) => {
                let failure = self.retry.record_failure(&workspace.id, id);
                if failure.stuck {
                    error!(
                        workspace_id = %workspace.id,
                        transaction = %id,
                        action,
                        failures = failure.failures,
                        error = %e,
                        "Transaction stuck"
                    );
                } else {
                    warn!(
                        workspace_id = %workspace.id,
                        transaction = %id,
                        action,
                        failures = failure.failures,
                        retry_in = ?failure.delay,
                        error = %e,
                        "Transaction failed"
                    );
                }
                settlement.failed.push(id);
                false
            }
        }
    }
}
