pub mod graph;
pub mod kernels;
pub mod layered;

pub use graph::{graph_boost, AttrKind, AttributeGraph, VertexRef};
pub use layered::{decide, Candidate, MatchOutcome, MatchStrategySet};
