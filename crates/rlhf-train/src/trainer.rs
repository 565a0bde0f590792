//! Training cycle: gating, sampling, policy update, checkpointing
//!
//! A cycle always produces a [`TrainingResult`]. Not enough data yields a
//! skipped result and numerical trouble yields a failed one. Neither
//! changes the model. The update itself runs on a scratch copy of the model
//! on the blocking pool and is committed only when it completes cleanly.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use rlhf_core::Result;

use crate::algorithm::{apply_update, UpdateParams, UpdateReport};
use crate::checkpoint::{self, CheckpointMeta, CheckpointStore};
use crate::config::{RlhfConfig, UpdateStrategy};
use crate::experience::ReplayBuffer;
use crate::model::PolicyModel;
use crate::store::FeedbackStore;

/// Where the trainer is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Idle,
    Gating,
    Sampling,
    Updating,
    Checkpointing,
}

impl TrainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainerState::Idle => "idle",
            TrainerState::Gating => "gating",
            TrainerState::Sampling => "sampling",
            TrainerState::Updating => "updating",
            TrainerState::Checkpointing => "checkpointing",
        }
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientFeedback { available: usize, required: usize },
    InsufficientSamples { available: usize, required: usize },
    /// A scheduled trigger arrived while another cycle was running
    CycleInProgress,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InsufficientFeedback { available, required } => {
                write!(f, "insufficient feedback: {available} of {required}")
            }
            SkipReason::InsufficientSamples { available, required } => {
                write!(f, "insufficient samples: {available} of {required}")
            }
            SkipReason::CycleInProgress => write!(f, "training cycle already in progress"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingOutcome {
    Updated,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

/// Immutable record of one training cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub round_id: u64,
    pub strategy_used: UpdateStrategy,
    pub mean_loss: f64,
    /// Global gradient norm before clipping
    pub gradient_norm: f64,
    pub samples_used: usize,
    pub timestamp: DateTime<Utc>,
    pub outcome: TrainingOutcome,
    pub checkpoint: Option<PathBuf>,
    pub trigger: TriggerSource,
}

impl TrainingResult {
    fn without_update(
        round_id: u64,
        strategy: UpdateStrategy,
        trigger: TriggerSource,
        outcome: TrainingOutcome,
    ) -> Self {
        Self {
            round_id,
            strategy_used: strategy,
            mean_loss: 0.0,
            gradient_norm: 0.0,
            samples_used: 0,
            timestamp: Utc::now(),
            outcome,
            checkpoint: None,
            trigger,
        }
    }

    pub(crate) fn skipped(
        round_id: u64,
        strategy: UpdateStrategy,
        trigger: TriggerSource,
        reason: SkipReason,
    ) -> Self {
        Self::without_update(round_id, strategy, trigger, TrainingOutcome::Skipped { reason })
    }

    fn failed(round_id: u64, strategy: UpdateStrategy, trigger: TriggerSource, error: String) -> Self {
        Self::without_update(round_id, strategy, trigger, TrainingOutcome::Failed { error })
    }

    pub fn is_updated(&self) -> bool {
        matches!(self.outcome, TrainingOutcome::Updated)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, TrainingOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, TrainingOutcome::Failed { .. })
    }
}

/// Counters published after every cycle so readers never wait on the trainer
#[derive(Debug, Clone, Default)]
pub struct TrainerProgress {
    pub rounds: u64,
    pub completed_updates: u64,
    pub last_result: Option<TrainingResult>,
}

/// Owns the live model and runs training cycles against shared state
pub struct Trainer {
    model: Box<dyn PolicyModel>,
    config: RlhfConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    state: watch::Sender<TrainerState>,
    progress: watch::Sender<TrainerProgress>,
    rounds: u64,
    /// Round numbering has been aligned with the checkpoint store
    rounds_seeded: bool,
    completed_updates: u64,
    last_result: Option<TrainingResult>,
}

impl Trainer {
    pub fn new(model: Box<dyn PolicyModel>, config: RlhfConfig) -> Self {
        let (state, _) = watch::channel(TrainerState::Idle);
        let (progress, _) = watch::channel(TrainerProgress::default());
        Self {
            model,
            config,
            checkpoints: None,
            state,
            progress,
            rounds: 0,
            rounds_seeded: false,
            completed_updates: 0,
            last_result: None,
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn state(&self) -> TrainerState {
        *self.state.borrow()
    }

    /// Observe state changes without holding the trainer
    pub fn watch_state(&self) -> watch::Receiver<TrainerState> {
        self.state.subscribe()
    }

    /// Observe counters without holding the trainer
    pub fn watch_progress(&self) -> watch::Receiver<TrainerProgress> {
        self.progress.subscribe()
    }

    pub fn model(&self) -> &dyn PolicyModel {
        self.model.as_ref()
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn completed_updates(&self) -> u64 {
        self.completed_updates
    }

    pub fn last_result(&self) -> Option<&TrainingResult> {
        self.last_result.as_ref()
    }

    fn set_state(&self, state: TrainerState) {
        self.state.send_replace(state);
    }

    fn publish_progress(&self) {
        self.progress.send_replace(TrainerProgress {
            rounds: self.rounds,
            completed_updates: self.completed_updates,
            last_result: self.last_result.clone(),
        });
    }

    /// Load the newest checkpoint into the model, continuing its round numbering
    pub async fn restore_latest(&mut self) -> Result<Option<CheckpointMeta>> {
        let Some(store) = self.checkpoints.clone() else {
            return Ok(None);
        };
        let latest = checkpoint::latest(store.as_ref()).await?;
        self.rounds_seeded = true;
        let Some(meta) = latest else {
            return Ok(None);
        };

        // Numbering continues past existing checkpoints even if the weights don't load
        self.rounds = self.rounds.max(meta.round_id);
        self.publish_progress();
        let weights = store.load(&meta.path).await?;
        self.model.import_weights(&weights)?;

        info!(round_id = meta.round_id, path = %meta.path.display(), "Restored model from checkpoint");
        Ok(Some(meta))
    }

    /// Start numbering after the newest stored checkpoint so rotation never
    /// discards a checkpoint this trainer just wrote.
    async fn seed_rounds(&mut self) {
        self.rounds_seeded = true;
        let Some(store) = self.checkpoints.clone() else {
            return;
        };
        match checkpoint::latest(store.as_ref()).await {
            Ok(Some(meta)) if meta.round_id > self.rounds => {
                debug!(round_id = meta.round_id, "Continuing round numbering after stored checkpoints");
                self.rounds = meta.round_id;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not list checkpoints to seed round numbering"),
        }
    }

    /// Run one full cycle.
    pub async fn run_cycle(
        &mut self,
        store: &Mutex<FeedbackStore>,
        buffer: &Mutex<ReplayBuffer>,
        trigger: TriggerSource,
    ) -> TrainingResult {
        if !self.rounds_seeded {
            self.seed_rounds().await;
        }
        self.rounds += 1;
        let round_id = self.rounds;

        let result = self.cycle(round_id, store, buffer, trigger).await;
        self.set_state(TrainerState::Idle);

        match &result.outcome {
            TrainingOutcome::Updated => info!(
                round_id,
                strategy = %result.strategy_used,
                mean_loss = result.mean_loss,
                gradient_norm = result.gradient_norm,
                samples_used = result.samples_used,
                trigger = ?trigger,
                "Training round completed"
            ),
            TrainingOutcome::Skipped { reason } => {
                debug!(round_id, trigger = ?trigger, %reason, "Training round skipped");
            }
            TrainingOutcome::Failed { error } => {
                warn!(round_id, trigger = ?trigger, %error, "Training round failed, model unchanged");
            }
        }

        self.last_result = Some(result.clone());
        self.publish_progress();
        result
    }

    async fn cycle(
        &mut self,
        round_id: u64,
        store: &Mutex<FeedbackStore>,
        buffer: &Mutex<ReplayBuffer>,
        trigger: TriggerSource,
    ) -> TrainingResult {
        let training = &self.config.training;
        let strategy = training.update_strategy;
        let batch_size = training.batch_size;

        self.set_state(TrainerState::Gating);
        let feedback_count = store.lock().await.count();
        if feedback_count < training.min_feedback_for_update {
            let reason = SkipReason::InsufficientFeedback {
                available: feedback_count,
                required: training.min_feedback_for_update,
            };
            return TrainingResult::skipped(round_id, strategy, trigger, reason);
        }

        let required_samples = training.min_samples_for_update.max(batch_size);
        let buffered = buffer.lock().await.len();
        if buffered < required_samples {
            let reason = SkipReason::InsufficientSamples {
                available: buffered,
                required: required_samples,
            };
            return TrainingResult::skipped(round_id, strategy, trigger, reason);
        }

        self.set_state(TrainerState::Sampling);
        let sampled = buffer.lock().await.sample(batch_size);
        let batch = match sampled {
            Ok(batch) => batch,
            Err(e) if e.is_not_ready() => {
                let reason = SkipReason::InsufficientSamples {
                    available: buffered,
                    required: required_samples,
                };
                return TrainingResult::skipped(round_id, strategy, trigger, reason);
            }
            Err(e) => return TrainingResult::failed(round_id, strategy, trigger, e.to_string()),
        };

        self.set_state(TrainerState::Updating);
        let params = UpdateParams::from_config(training, &self.config.reward);
        let mut scratch = self.model.boxed_clone();
        let joined = tokio::task::spawn_blocking(move || {
            let report = apply_update(strategy, scratch.as_mut(), &batch, &params);
            (scratch, batch, report)
        })
        .await;

        let (scratch, batch, report) = match joined {
            Ok((scratch, batch, Ok(report))) => (scratch, batch, report),
            Ok((_, _, Err(e))) => return TrainingResult::failed(round_id, strategy, trigger, e.to_string()),
            Err(e) => {
                return TrainingResult::failed(round_id, strategy, trigger, format!("update task panicked: {e}"))
            }
        };

        self.model = scratch;
        self.completed_updates += 1;

        let indices = batch.indices();
        match buffer.lock().await.update_priorities(&indices, &report.sample_errors) {
            Ok(applied) if applied < indices.len() => {
                debug!(applied, sampled = indices.len(), "Dropped priority updates for overwritten slots");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to write back priorities"),
        }

        let mut result = TrainingResult {
            round_id,
            strategy_used: strategy,
            mean_loss: report.mean_loss,
            gradient_norm: report.gradient_norm,
            samples_used: batch.len(),
            timestamp: Utc::now(),
            outcome: TrainingOutcome::Updated,
            checkpoint: None,
            trigger,
        };

        if self.checkpoint_due() {
            self.set_state(TrainerState::Checkpointing);
            result.checkpoint = self.save_checkpoint(&result, &report).await;
        }

        result
    }

    fn checkpoint_due(&self) -> bool {
        let cfg = &self.config.checkpoint;
        cfg.enabled
            && self.checkpoints.is_some()
            && cfg.save_frequency > 0
            && self.completed_updates % cfg.save_frequency == 0
    }

    /// Persist and rotate. Failures are logged and never fail the cycle.
    async fn save_checkpoint(&self, result: &TrainingResult, report: &UpdateReport) -> Option<PathBuf> {
        let store = self.checkpoints.as_ref()?;

        let mut meta = CheckpointMeta::new(result.round_id, result.strategy_used);
        meta.mean_loss = report.mean_loss;
        meta.gradient_norm = report.gradient_norm;
        meta.samples_used = result.samples_used;

        let path = match store.save(&self.model.export_weights(), meta).await {
            Ok(path) => path,
            Err(e) => {
                warn!(round_id = result.round_id, error = %e, "Checkpoint save failed");
                return None;
            }
        };

        if let Err(e) = checkpoint::rotate(store.as_ref(), self.config.checkpoint.keep_checkpoints).await {
            warn!(error = %e, "Checkpoint rotation failed");
        }

        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FileCheckpointStore;
    use crate::codec::WeightSet;
    use crate::config::BufferType;
    use crate::experience::Experience;
    use crate::model::SoftmaxPolicy;
    use crate::reward::RewardSignal;
    use crate::state::{Action, State};
    use async_trait::async_trait;
    use rlhf_core::{FeedbackKey, FeedbackRecord, InterventionResult, PredictionAccuracy, RlhfError};
    use std::path::Path;
    use tempfile::TempDir;

    fn config(min_feedback: usize, min_samples: usize, batch_size: usize) -> RlhfConfig {
        let mut config = RlhfConfig::default();
        config.training.min_feedback_for_update = min_feedback;
        config.training.min_samples_for_update = min_samples;
        config.training.batch_size = batch_size;
        config.buffer.capacity = 128;
        config.checkpoint.save_frequency = 1;
        config
    }

    fn key(i: usize) -> FeedbackKey {
        FeedbackKey::new(format!("case-{i}"), format!("pred-{i}"), "officer-1")
    }

    async fn fill(
        store: &Mutex<FeedbackStore>,
        buffer: &Mutex<ReplayBuffer>,
        feedback: usize,
        samples: usize,
        reward: f64,
    ) {
        let mut store = store.lock().await;
        for i in 0..feedback {
            let record = FeedbackRecord::new(key(i), PredictionAccuracy::ExactMatch, InterventionResult::Apprehension);
            store.submit(record, RewardSignal::Scalar(reward));
        }
        let mut buffer = buffer.lock().await;
        for i in 0..samples {
            buffer.push(Experience::new(key(i), State::new(vec![1.0, 0.0]), Action(i % 2), reward));
        }
    }

    fn shared(config: &RlhfConfig) -> (Mutex<FeedbackStore>, Mutex<ReplayBuffer>) {
        (
            Mutex::new(FeedbackStore::from_config(&config.feedback)),
            Mutex::new(ReplayBuffer::from_config(&config.buffer)),
        )
    }

    fn trainer(config: RlhfConfig) -> Trainer {
        Trainer::new(Box::new(SoftmaxPolicy::new(2, 2)), config)
    }

    #[tokio::test]
    async fn test_gating_feedback_threshold() {
        let config = config(10, 4, 4);
        let (store, buffer) = shared(&config);
        let mut trainer = trainer(config);

        fill(&store, &buffer, 9, 16, 1.0).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;
        assert_eq!(
            result.outcome,
            TrainingOutcome::Skipped {
                reason: SkipReason::InsufficientFeedback { available: 9, required: 10 }
            }
        );
        assert_eq!(result.samples_used, 0);

        fill(&store, &buffer, 10, 0, 1.0).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;
        assert!(result.is_updated(), "{:?}", result.outcome);
        assert_eq!(result.samples_used, 4);
    }

    #[tokio::test]
    async fn test_gating_sample_threshold_uses_batch_size() {
        let config = config(1, 2, 8);
        let (store, buffer) = shared(&config);
        let mut trainer = trainer(config);

        fill(&store, &buffer, 1, 7, 1.0).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Scheduled).await;
        assert_eq!(
            result.outcome,
            TrainingOutcome::Skipped {
                reason: SkipReason::InsufficientSamples { available: 7, required: 8 }
            }
        );
        assert_eq!(trainer.completed_updates(), 0);
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[tokio::test]
    async fn test_update_changes_model_and_priorities() {
        let mut config = config(1, 4, 4);
        config.training.update_strategy = UpdateStrategy::ActorCritic;
        config.buffer.buffer_type = BufferType::Prioritized;
        let (store, buffer) = shared(&config);
        let mut trainer = trainer(config);
        let progress = trainer.watch_progress();
        let before = trainer.model().export_weights();

        fill(&store, &buffer, 4, 4, 3.0).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;

        assert!(result.is_updated());
        assert_eq!(result.round_id, 1);
        assert!(result.mean_loss.is_finite());
        assert_ne!(trainer.model().export_weights(), before);
        assert_eq!(trainer.completed_updates(), 1);
        assert_eq!(trainer.last_result().unwrap().round_id, 1);

        let published = progress.borrow().clone();
        assert_eq!((published.rounds, published.completed_updates), (1, 1));
        assert!(published.last_result.is_some_and(|r| r.is_updated()));
    }

    #[tokio::test]
    async fn test_nan_reward_fails_without_touching_model() {
        let config = config(1, 4, 4);
        let (store, buffer) = shared(&config);
        let mut trainer = trainer(config);
        let before = trainer.model().export_weights();

        fill(&store, &buffer, 4, 4, f64::NAN).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;

        assert!(result.is_failed(), "{:?}", result.outcome);
        assert_eq!(trainer.model().export_weights(), before);
        assert_eq!(trainer.completed_updates(), 0);
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[tokio::test]
    async fn test_checkpoints_saved_and_rotated() {
        let dir = TempDir::new().unwrap();
        let mut config = config(1, 4, 4);
        config.checkpoint.keep_checkpoints = 2;
        let (store, buffer) = shared(&config);
        let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()));
        let mut trainer = trainer(config).with_checkpoint_store(checkpoints.clone());

        fill(&store, &buffer, 4, 8, 1.0).await;
        for _ in 0..4 {
            let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;
            assert!(result.checkpoint.is_some());
        }

        let rounds: Vec<u64> = checkpoints.list().await.unwrap().iter().map(|m| m.round_id).collect();
        assert_eq!(rounds, vec![3, 4]);

        let mut restored = Trainer::new(Box::new(SoftmaxPolicy::new(2, 2)), RlhfConfig::default())
            .with_checkpoint_store(checkpoints);
        let meta = restored.restore_latest().await.unwrap().unwrap();
        assert_eq!(meta.round_id, 4);
        assert_eq!(restored.rounds(), 4);
        assert_eq!(restored.model().export_weights(), trainer.model().export_weights());
    }

    #[tokio::test]
    async fn test_fresh_trainer_numbers_after_existing_checkpoints() {
        let dir = TempDir::new().unwrap();
        let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()));
        let weights = SoftmaxPolicy::new(2, 2).export_weights();
        for round in 46..=50 {
            checkpoints
                .save(&weights, CheckpointMeta::new(round, UpdateStrategy::Ppo))
                .await
                .unwrap();
        }

        let mut config = config(1, 4, 4);
        config.checkpoint.keep_checkpoints = 5;
        let (store, buffer) = shared(&config);
        // No restore: the weights in the directory are ignored, numbering is not
        let mut trainer = trainer(config).with_checkpoint_store(checkpoints.clone());

        fill(&store, &buffer, 4, 8, 1.0).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;
        assert!(result.is_updated());
        assert_eq!(result.round_id, 51);

        let path = result.checkpoint.unwrap();
        assert!(path.exists());
        let rounds: Vec<u64> = checkpoints.list().await.unwrap().iter().map(|m| m.round_id).collect();
        assert_eq!(rounds, vec![47, 48, 49, 50, 51]);
    }

    #[tokio::test]
    async fn test_failed_restore_still_continues_numbering() {
        let dir = TempDir::new().unwrap();
        let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()));
        // Shape does not match the 2x2 model below
        checkpoints
            .save(
                &SoftmaxPolicy::new(3, 5).export_weights(),
                CheckpointMeta::new(9, UpdateStrategy::Ppo),
            )
            .await
            .unwrap();

        let mut trainer = trainer(config(1, 4, 4)).with_checkpoint_store(checkpoints);
        assert!(trainer.restore_latest().await.is_err());
        assert_eq!(trainer.rounds(), 9);
    }

    struct FailingStore;

    #[async_trait]
    impl CheckpointStore for FailingStore {
        async fn save(&self, _: &WeightSet, _: CheckpointMeta) -> Result<PathBuf> {
            Err(RlhfError::Checkpoint("disk full".into()))
        }

        async fn list(&self) -> Result<Vec<CheckpointMeta>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _: &Path) -> Result<()> {
            Ok(())
        }

        async fn load(&self, _: &Path) -> Result<WeightSet> {
            Err(RlhfError::Checkpoint("empty".into()))
        }
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let config = config(1, 4, 4);
        let (store, buffer) = shared(&config);
        let mut trainer = trainer(config).with_checkpoint_store(Arc::new(FailingStore));

        fill(&store, &buffer, 4, 4, 1.0).await;
        let result = trainer.run_cycle(&store, &buffer, TriggerSource::Manual).await;

        assert!(result.is_updated());
        assert!(result.checkpoint.is_none());
        assert_eq!(trainer.completed_updates(), 1);
    }
}
