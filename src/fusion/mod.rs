//! Similarity fusion: category gating, weighted scoring and the decision
//! policy.

pub mod candidates;
pub mod category;
mod decision;
mod score;

pub use candidates::score_candidates;
pub use decision::{Decision, Scored, decide, rank};
pub use score::{Fused, fuse};
