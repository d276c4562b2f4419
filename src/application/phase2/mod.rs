//! Phase 2: batch distribution and the multi-factor scoring pipeline.

pub mod distributor;
pub mod optimizer;
pub mod pipeline;
pub mod regime;
pub mod scoring;
pub mod selector;
pub mod weights;

pub use pipeline::{DistributionPlan, Phase2Pipeline};
pub use weights::WeightStore;
