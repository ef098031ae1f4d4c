//! Blue-green refresh of the local mirror.
//!
//! `DataRefreshOrchestrator` sequences a run against an `UpdateCoordinator`
//! and a `CandidateStore`; `DirectoryCoordinator` is the on-disk store the
//! CLI drives.

pub mod coordinator;
pub mod fs_store;
pub mod orchestrator;
pub mod types;

pub use coordinator::{
    CandidateStore, ConnectionPoolStatus, CoordinatorStatus, IntegrityReport, StoreStats,
    UpdateCoordinator,
};
pub use fs_store::{ActivePointer, DirectoryCoordinator, Slot};
pub use orchestrator::DataRefreshOrchestrator;
pub use types::{
    Conflict, ConflictReason, DeltaRecord, RefreshCandidate, RunPhase, RunResult, RunStatus,
};
