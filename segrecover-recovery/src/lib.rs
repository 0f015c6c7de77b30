//! Segrecover Recovery
//!
//! Segment recovery, rebalancing and heap checksum verification for
//! mirrored clusters.
//!
//! Components:
//! - **Directives**: which segments to recover, and where (`confinfo`)
//! - **Assessor**: probes target directories and timelines
//! - **Planner**: picks full or incremental recovery per segment
//! - **Executor**: runs base backup / rewind / start in staged batches
//! - **Reconfigurer**: waits for the cluster to adopt a new topology
//! - **Rebalance**: returns pairs to their preferred roles
//! - **Checksum**: heap checksum consistency across the cluster
//! - **Session**: one entry point per operation, sharing configuration
//!   and logging context

pub mod assess;
pub mod checksum;
pub mod config;
pub mod confinfo;
pub mod executor;
pub mod planner;
pub mod progress;
pub mod rebalance;
pub mod reconfigure;
pub mod report;
pub mod session;

pub use assess::{DirectoryState, TargetAssessment, TargetAssessor, TimelineRelation};
pub use checksum::{ChecksumError, ChecksumReport, HeapChecksumVerifier};
pub use config::{CliOverrides, ConfigError, RecoveryConfig};
pub use confinfo::{
    parse_confinfo, parse_directives, read_directive_file, DirectiveError, RecoveryDirective,
    SegmentLocation,
};
pub use executor::{ExecutorConfig, RecoveryExecutor};
pub use planner::{
    find_candidates, CandidateSet, Planner, PlannerConfig, RecoveryCandidate, RecoveryInfo,
    RecoveryKind, RecoveryPlan,
};
pub use progress::ProgressMonitor;
pub use rebalance::{
    determine_unbalanced, RebalanceOperation, RebalanceOutcome, RebalanceSelection,
    RebalanceState, StopReport,
};
pub use reconfigure::{ReconfigureError, SegmentReconfigurer};
pub use report::{FailureStage, RecoveryReport, SegmentFailure};
pub use session::{RebalanceReport, RecoverySession, SessionError};
