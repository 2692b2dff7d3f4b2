//! Workspace provisioning controller
//!
//! Workspaces move through a fixed table of lifecycle states. Each state
//! names the idempotent transactions that must be done before the workspace
//! may leave it; a persisted ledger records which ones are. A periodic
//! reconciler applies what is missing, rolls back what is no longer wanted
//! and advances the status once the two agree.

pub mod clients;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod transaction;
pub mod transition;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use clients::{ClientError, Clients, InMemoryCloud};
pub use error::{OrchestratorError, Result};
pub use ledger::{Ledger, WorkspaceTransaction};
pub use lifecycle::WorkspaceLifecycle;
pub use reconciler::{run_supervised, Reconciler, ReconcilerContext, ReconcilerSettings, TickReport};
pub use retry::{InFlight, RetryPolicy, RetryTracker};
pub use state::{State, StateTable};
pub use transaction::{
    Naming, Outcome, Transaction, TransactionContext, TransactionError, TransactionId,
    TransactionRegistry,
};
pub use transition::{Settlement, TransitionHandler};
pub use workspace::{Workspace, WorkspaceFilters, WorkspaceStatus, WorkspaceStore, WorkspaceTier};
