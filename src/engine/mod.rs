//! Triage engine: paginated scanning, batch moves and rule orchestration.

pub mod mover;
pub mod orchestrator;
pub mod scanner;

pub use mover::{BatchItem, BatchMover, BatchOutcome, MoveOptions, TagMode};
pub use orchestrator::{
    EngineConfig, FolderListOutcome, FolderReset, GroupOutcome, MoveOutcome, MoveRequest,
    OrganizeOutcome, OrganizeRequest, Orchestrator, PathFailure, PreviewOutcome, PreviewRequest,
    ResetOutcome, RuleResult, RunAllOutcome, RunOutcome, SetupOutcome, SyncOutcome,
};
pub use scanner::{Match, ScanPage, Scanner};
