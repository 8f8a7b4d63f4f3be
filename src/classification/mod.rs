//! Stamp classification module
//!
//! Scores candidate crops with weighted stamp-likeness heuristics and an
//! optional trained model, producing a [`Verdict`] per crop.

pub mod classifier;
pub mod heuristics;

pub use classifier::{Heuristic, StampClassifier, SubScores, Verdict};
