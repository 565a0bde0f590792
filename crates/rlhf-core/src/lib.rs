//! RLHF Core - Shared feedback types and errors
//!
//! This crate provides the domain types used across the RLHF pipeline crates.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod feedback;
pub mod util;

pub use error::{Result, RlhfError};
pub use feedback::{
    FeedbackId, FeedbackKey, FeedbackRecord, InterventionResult, PredictionAccuracy, MAX_CLOCK_SKEW_SECS,
};
