//! Offline sync: the engine that replays records, the coordinator that
//! decides when, and connectivity tracking.

pub mod backoff;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
#[cfg(test)]
pub(crate) mod mock;

pub use backoff::RetryPolicy;
pub use connectivity::{Connectivity, ConnectivityProbe};
pub use coordinator::{CoordinatorHandle, SyncCoordinator};
pub use engine::{Reconciler, SyncEngine, SyncErrorEntry, SyncSummary};
