//! Retention subsystem: plans which obsolete file slices can be removed,
//! executes the deletions crash-safely through the timeline, and migrates
//! persisted clean payloads across schema versions.

pub mod executor;
pub mod markers;
pub mod migrator;
pub mod plan;
pub mod planner;

pub use executor::{CleanExecutor, CleanOutcome};
pub use markers::MarkerCleaner;
pub use migrator::{CleanMetadataMigrator, CleanPlanMigrator, MigrationError};
pub use plan::{CleanFileInfo, CleanMetadata, CleanPartitionMetadata, CleanPlan};
pub use planner::CleanPlanner;
