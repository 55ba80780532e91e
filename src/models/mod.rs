pub mod association;
pub mod core;
pub mod linkage;
pub mod stats;

pub use association::{AssociatedRecord, AssociationStrategy, EnhancedAssociation};
pub use core::{NormalizedUnit, SourceKind, Unit};
pub use linkage::{
    derive_match_id, LinkageResult, MatchConfidence, MatchExplanation, MatchType, ReviewStatus,
};
pub use stats::LinkageStatistics;
