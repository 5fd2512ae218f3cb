//! Quality labelling and split allocation of training samples.
//!
//! Samples are filtered by judged principle count, bucketed by preference
//! outcome, shuffled per bucket with a seeded ChaCha RNG and distributed over
//! fixed-size carve-outs and share-based splits. The same pool and seed always
//! produce the same assignment, whatever order the pool arrives in.

mod allocator;
mod labels;
mod plan;

pub use allocator::{
    apportion, Allocation, AllocationReport, ExcludedSample, ExclusionReason, QualityAllocator,
};
pub use labels::{attach_labels, PreferenceOutcome, QualityLabels, UNLABELED};
pub use plan::{CarveOut, SplitPlan, TiePolicy};
