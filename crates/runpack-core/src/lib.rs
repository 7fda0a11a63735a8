//! Run lifecycle coordinator: Run Store, Budget Engine, Finalize Protocol,
//! Reconciler, and Submission Path for an asynchronous, money-accurate,
//! exactly-once job execution platform.

pub mod budget;
pub mod config;
#[cfg(feature = "postgres")]
pub mod db;
pub mod finalize;
pub mod lease;
pub mod money;
pub mod object_store;
pub mod queue;
pub mod reconciler;
pub mod run;
pub mod run_store;
#[cfg(feature = "postgres")]
pub mod run_store_pg;
pub mod submission;

pub use budget::{BudgetEngine, BudgetError};
pub use config::{Ttls, TtlConfigError};
pub use finalize::{AbortReason, FinalizeError, FinalizeResult};
pub use lease::acquire_lease;
pub use money::{Money, MoneyError};
pub use object_store::{ArtifactMetadata, ObjectStore, ObjectStoreError};
pub use queue::{DispatchMessage, Dispatcher, DispatcherError};
pub use reconciler::{ReconcileError, ReconcileSummary};
pub use run::{FinalizeStage, MoneyState, Run, RunExtraConditions, RunFieldUpdates, RunStatus};
pub use run_store::{RunStore, RunStoreError};
#[cfg(feature = "postgres")]
pub use run_store_pg::PostgresRunStore;
pub use submission::{SubmissionError, SubmissionRequest};

#[cfg(feature = "postgres")]
pub use db::{DbError, PgClient};
