//! Pipeline configuration
//!
//! Every value can be overridden at startup and stays fixed for the lifetime
//! of the process. Sections map to `[reward]`, `[training]`, `[buffer]`,
//! `[feedback]` and `[checkpoint]` in `rlhf.toml`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rlhf_core::{Result, RlhfError};

/// How feedback is turned into a reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStrategy {
    /// +1 success, -1 failure, 0 unknown
    Sparse,
    /// Sum of location, outcome and recovery-rate terms
    Shaped,
    /// Shaped terms kept as separate heads
    Hierarchical,
}

/// Policy update rule applied to each sampled batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    Reinforce,
    Ppo,
    ActorCritic,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::Reinforce => "reinforce",
            UpdateStrategy::Ppo => "ppo",
            UpdateStrategy::ActorCritic => "actor_critic",
        }
    }
}

impl std::fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replay buffer variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    Uniform,
    Prioritized,
}

/// How often the background loop attempts a training cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    /// After every accepted submission
    Immediate,
    Hourly,
    Daily,
    Weekly,
}

impl UpdateFrequency {
    /// Timer period, `None` for submission-driven training
    pub fn interval(&self) -> Option<Duration> {
        match self {
            UpdateFrequency::Immediate => None,
            UpdateFrequency::Hourly => Some(Duration::from_secs(60 * 60)),
            UpdateFrequency::Daily => Some(Duration::from_secs(24 * 60 * 60)),
            UpdateFrequency::Weekly => Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RlhfConfig {
    pub reward: RewardConfig,
    pub training: TrainingConfig,
    pub buffer: BufferConfig,
    pub feedback: FeedbackConfig,
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub strategy: RewardStrategy,
    pub location_exact_match_reward: f64,
    pub location_nearby_reward: f64,
    /// Negative
    pub location_different_penalty: f64,
    pub apprehension_reward: f64,
    pub recovery_reward: f64,
    pub both_outcome_bonus: f64,
    /// Negative
    pub unsuccessful_penalty: f64,
    pub recovery_rate_multiplier: f64,
    /// Loss weight per head (location, outcome, recovery) for hierarchical rewards
    pub head_weights: [f64; 3],
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            strategy: RewardStrategy::Shaped,
            location_exact_match_reward: 10.0,
            location_nearby_reward: 5.0,
            location_different_penalty: -5.0,
            apprehension_reward: 8.0,
            recovery_reward: 6.0,
            both_outcome_bonus: 4.0,
            unsuccessful_penalty: -3.0,
            recovery_rate_multiplier: 5.0,
            head_weights: [1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub update_strategy: UpdateStrategy,
    pub update_frequency: UpdateFrequency,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub ppo_clip_ratio: f64,
    pub ppo_epochs: usize,
    pub value_loss_coef: f64,
    pub max_gradient_norm: f64,
    pub min_samples_for_update: usize,
    pub min_feedback_for_update: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            update_strategy: UpdateStrategy::Ppo,
            update_frequency: UpdateFrequency::Daily,
            batch_size: 32,
            learning_rate: 1e-3,
            discount_factor: 0.99,
            ppo_clip_ratio: 0.2,
            ppo_epochs: 4,
            value_loss_coef: 0.5,
            max_gradient_norm: 1.0,
            min_samples_for_update: 64,
            min_feedback_for_update: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub buffer_type: BufferType,
    pub capacity: usize,
    pub priority_alpha: f64,
    pub priority_beta: f64,
    pub priority_beta_increment: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_type: BufferType::Prioritized,
            capacity: 10_000,
            priority_alpha: 0.6,
            priority_beta: 0.4,
            priority_beta_increment: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub feedback_buffer_size: usize,
    pub feedback_staleness_days: i64,
    pub sweep_interval_secs: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            feedback_buffer_size: 10_000,
            feedback_staleness_days: 90,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub checkpoint_dir: PathBuf,
    pub save_frequency: u64,
    pub keep_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint_dir: PathBuf::from("checkpoints"),
            save_frequency: 10,
            keep_checkpoints: 5,
        }
    }
}

fn invalid(msg: impl Into<String>) -> RlhfError {
    RlhfError::Config(msg.into())
}

impl RlhfConfig {
    /// Check ranges that would otherwise surface as runtime panics or NaNs.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.batch_size == 0 {
            return Err(invalid("training.batch_size must be at least 1"));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(invalid("training.learning_rate must be positive"));
        }
        if !(0.0..=1.0).contains(&t.discount_factor) {
            return Err(invalid("training.discount_factor must be within [0, 1]"));
        }
        if !(t.ppo_clip_ratio > 0.0 && t.ppo_clip_ratio < 1.0) {
            return Err(invalid("training.ppo_clip_ratio must be within (0, 1)"));
        }
        if t.ppo_epochs == 0 {
            return Err(invalid("training.ppo_epochs must be at least 1"));
        }
        if !(t.max_gradient_norm.is_finite() && t.max_gradient_norm > 0.0) {
            return Err(invalid("training.max_gradient_norm must be positive"));
        }
        if t.value_loss_coef < 0.0 {
            return Err(invalid("training.value_loss_coef must not be negative"));
        }

        let b = &self.buffer;
        if b.capacity == 0 {
            return Err(invalid("buffer.capacity must be at least 1"));
        }
        if !(b.priority_alpha.is_finite() && b.priority_alpha >= 0.0) {
            return Err(invalid("buffer.priority_alpha must not be negative"));
        }
        if !(b.priority_beta > 0.0 && b.priority_beta <= 1.0) {
            return Err(invalid("buffer.priority_beta must be within (0, 1]"));
        }
        if b.priority_beta_increment < 0.0 {
            return Err(invalid("buffer.priority_beta_increment must not be negative"));
        }

        let f = &self.feedback;
        if f.feedback_buffer_size == 0 {
            return Err(invalid("feedback.feedback_buffer_size must be at least 1"));
        }
        if f.feedback_staleness_days <= 0 {
            return Err(invalid("feedback.feedback_staleness_days must be positive"));
        }
        if f.sweep_interval_secs == 0 {
            return Err(invalid("feedback.sweep_interval_secs must be positive"));
        }

        let c = &self.checkpoint;
        if c.save_frequency == 0 {
            return Err(invalid("checkpoint.save_frequency must be at least 1"));
        }
        if c.keep_checkpoints == 0 {
            return Err(invalid("checkpoint.keep_checkpoints must be at least 1"));
        }

        if self.reward.head_weights.iter().any(|w| !w.is_finite()) {
            return Err(invalid("reward.head_weights must be finite"));
        }

        Ok(())
    }
}
