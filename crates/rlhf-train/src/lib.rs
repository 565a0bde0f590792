//! RLHF training pipeline
//!
//! Turns officer feedback on predictions into rewards, keeps a bounded
//! replay history of (state, action, reward) samples, and periodically runs
//! a policy update against it.
//!
//! The main entry point is [`RlhfService`], which owns a [`FeedbackStore`],
//! a [`ReplayBuffer`] and a [`Trainer`].

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::float_cmp)]
#![allow(clippy::similar_names)]

pub mod algorithm;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod experience;
pub mod model;
pub mod prediction;
pub mod prioritized;
pub mod reward;
pub mod service;
pub mod state;
pub mod store;
mod sum_tree;
pub mod trainer;

pub use algorithm::{apply_update, UpdateParams, UpdateReport};
pub use checkpoint::{CheckpointMeta, CheckpointStore, FileCheckpointStore};
pub use config::{BufferType, RewardStrategy, RlhfConfig, UpdateFrequency, UpdateStrategy};
pub use experience::{Experience, ExperienceBuffer, ReplayBuffer, SampleIndex, TrainingBatch};
pub use model::{Gradients, PolicyModel, SoftmaxPolicy};
pub use prediction::{InMemoryPredictionRepository, PredictionRepository};
pub use prioritized::{PrioritizedExperienceBuffer, PRIORITY_EPSILON};
pub use reward::{RewardCalculator, RewardComponents, RewardSignal};
pub use service::{FeedbackAck, FeedbackSubmission, RlhfEvent, RlhfService, RlhfServiceBuilder, ServiceStats};
pub use state::{Action, PredictionContext, Reward, State};
pub use store::{FeedbackStore, FeedbackStoreStats, SubmitOutcome};
pub use trainer::{
    SkipReason, Trainer, TrainerProgress, TrainerState, TrainingOutcome, TrainingResult, TriggerSource,
};
