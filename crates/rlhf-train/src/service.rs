//! Explicitly constructed owner of the whole feedback pipeline
//!
//! [`RlhfService`] is cheap to clone; clones share one store, one replay
//! buffer and one trainer. Feedback submission holds the store lock across
//! the matching buffer insert, always taking the store first. Training runs either on demand or from the background loop
//! started with [`RlhfService::start`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use rlhf_core::{
    FeedbackId, FeedbackKey, FeedbackRecord, InterventionResult, PredictionAccuracy, Result, RlhfError,
};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{BufferType, RlhfConfig, UpdateFrequency, UpdateStrategy};
use crate::experience::{Experience, ReplayBuffer};
use crate::model::{PolicyModel, SoftmaxPolicy};
use crate::prediction::{InMemoryPredictionRepository, PredictionRepository};
use crate::reward::{RewardCalculator, RewardComponents};
use crate::state::{PredictionContext, Reward};
use crate::store::{FeedbackStore, FeedbackStoreStats};
use crate::trainer::{SkipReason, Trainer, TrainerProgress, TrainerState, TrainingResult, TriggerSource};

const EVENT_CAPACITY: usize = 256;

/// Officer feedback as received from a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub case_id: String,
    pub prediction_id: String,
    pub officer_id: String,
    pub prediction_accuracy: PredictionAccuracy,
    pub intervention_result: InterventionResult,
    #[serde(default)]
    pub recovery_amount: Option<f64>,
    #[serde(default)]
    pub fraud_amount: Option<f64>,
    /// Defaults to the time of submission
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl FeedbackSubmission {
    pub fn into_record(self) -> FeedbackRecord {
        let key = FeedbackKey::new(self.case_id, self.prediction_id, self.officer_id);
        let record = FeedbackRecord::new(key, self.prediction_accuracy, self.intervention_result)
            .with_amounts(self.recovery_amount, self.fraud_amount);
        match self.submitted_at {
            Some(at) => record.with_submitted_at(at),
            None => record,
        }
    }
}

/// Acknowledgement returned for an accepted submission
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackAck {
    pub feedback_id: FeedbackId,
    pub reward: Reward,
    pub components: Option<RewardComponents>,
    pub accepted: bool,
    /// An earlier submission for the same key was replaced
    pub replaced: bool,
    /// The prediction context was known, so a training sample was recorded
    pub experience_recorded: bool,
}

/// Observability events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RlhfEvent {
    RewardComputed {
        key: FeedbackKey,
        reward: Reward,
        components: Option<RewardComponents>,
        replaced: bool,
    },
    TrainingCompleted(TrainingResult),
    FeedbackExpired { removed: usize },
}

/// Point-in-time service counters
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub running: bool,
    pub trainer_state: TrainerState,
    pub update_strategy: UpdateStrategy,
    pub buffer_type: BufferType,
    pub feedback: FeedbackStoreStats,
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub beta: Option<f64>,
    pub rounds: u64,
    pub completed_updates: u64,
    pub last_loss: Option<f64>,
    pub last_result: Option<TrainingResult>,
    pub feedback_rejected: u64,
    pub experiences_recorded: u64,
}

struct Inner {
    config: RlhfConfig,
    calculator: RewardCalculator,
    store: Mutex<FeedbackStore>,
    buffer: Mutex<ReplayBuffer>,
    trainer: Mutex<Trainer>,
    trainer_state: watch::Receiver<TrainerState>,
    trainer_progress: watch::Receiver<TrainerProgress>,
    predictions: Arc<dyn PredictionRepository>,
    input_dim: usize,
    action_space: usize,
    events: broadcast::Sender<RlhfEvent>,
    shutdown: broadcast::Sender<()>,
    feedback_arrived: Notify,
    background: Mutex<Option<JoinHandle<()>>>,
    feedback_rejected: AtomicU64,
    experiences_recorded: AtomicU64,
}

/// Builder for [`RlhfService`]
pub struct RlhfServiceBuilder {
    config: RlhfConfig,
    model: Option<Box<dyn PolicyModel>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    predictions: Option<Arc<dyn PredictionRepository>>,
}

impl RlhfServiceBuilder {
    pub fn model(mut self, model: Box<dyn PolicyModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn prediction_repository(mut self, repository: Arc<dyn PredictionRepository>) -> Self {
        self.predictions = Some(repository);
        self
    }

    /// Validate the configuration and assemble the service.
    ///
    /// Without an explicit model a zero-initialized [`SoftmaxPolicy`] with
    /// `input_dim` features and `action_space` actions is used. Without an
    /// explicit checkpoint store one rooted at `checkpoint.checkpoint_dir`
    /// is used when checkpointing is enabled.
    pub fn build(self, input_dim: usize, action_space: usize) -> Result<RlhfService> {
        self.config.validate()?;

        let model = self
            .model
            .unwrap_or_else(|| Box::new(SoftmaxPolicy::new(input_dim, action_space)));
        let (input_dim, action_space) = (model.input_dim(), model.action_space_size());

        let checkpoints = self.checkpoints.or_else(|| {
            self.config.checkpoint.enabled.then(|| {
                Arc::new(FileCheckpointStore::new(&self.config.checkpoint.checkpoint_dir))
                    as Arc<dyn CheckpointStore>
            })
        });

        let mut trainer = Trainer::new(model, self.config.clone());
        if let Some(store) = checkpoints {
            trainer = trainer.with_checkpoint_store(store);
        }
        let trainer_state = trainer.watch_state();
        let trainer_progress = trainer.watch_progress();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        info!(
            reward_strategy = ?self.config.reward.strategy,
            update_strategy = %self.config.training.update_strategy,
            update_frequency = ?self.config.training.update_frequency,
            buffer_type = ?self.config.buffer.buffer_type,
            input_dim,
            action_space,
            "RLHF service initialized"
        );

        Ok(RlhfService {
            inner: Arc::new(Inner {
                calculator: RewardCalculator::new(self.config.reward.clone()),
                store: Mutex::new(FeedbackStore::from_config(&self.config.feedback)),
                buffer: Mutex::new(ReplayBuffer::from_config(&self.config.buffer)),
                trainer: Mutex::new(trainer),
                trainer_state,
                trainer_progress,
                predictions: self
                    .predictions
                    .unwrap_or_else(|| Arc::new(InMemoryPredictionRepository::new())),
                input_dim,
                action_space,
                events,
                shutdown,
                feedback_arrived: Notify::new(),
                background: Mutex::new(None),
                feedback_rejected: AtomicU64::new(0),
                experiences_recorded: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

#[derive(Clone)]
pub struct RlhfService {
    inner: Arc<Inner>,
}

impl RlhfService {
    pub fn builder(config: RlhfConfig) -> RlhfServiceBuilder {
        RlhfServiceBuilder {
            config,
            model: None,
            checkpoints: None,
            predictions: None,
        }
    }

    pub fn config(&self) -> &RlhfConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RlhfEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: RlhfEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Compute the reward for a submission, store it, and record a training
    /// sample when the prediction's context is known.
    pub async fn submit_feedback(&self, submission: FeedbackSubmission) -> Result<FeedbackAck> {
        let record = submission.into_record();
        let reward = match self.inner.calculator.compute(&record) {
            Ok(reward) => reward,
            Err(e) => {
                self.inner.feedback_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(case_id = %record.case_id, error = %e, "Rejected feedback");
                return Err(e);
            }
        };

        let key = record.key();
        let feedback_id = record.id;
        let context = self.inner.predictions.context(&record.prediction_id).await?;

        // Store then buffer; the store guard is held until the push so the
        // buffered sample always matches the stored record for its key
        let mut store = self.inner.store.lock().await;
        let outcome = store.submit(record, reward);

        let experience_recorded = match context {
            Some(context) if self.context_fits(&context) => {
                let experience = Experience::new(key.clone(), context.state, context.action, reward.value())
                    .with_components(reward.components());
                self.inner.buffer.lock().await.push(experience);
                self.inner.experiences_recorded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => {
                warn!(%key, "Prediction context does not match the model, no training sample recorded");
                false
            }
            None => {
                debug!(%key, "No prediction context, feedback stored without a training sample");
                false
            }
        };
        drop(store);

        info!(
            %key,
            reward = reward.value(),
            replaced = outcome.replaced,
            experience_recorded,
            "Feedback reward computed"
        );
        if let Some(evicted) = &outcome.evicted {
            debug!(%evicted, "Feedback store full, evicted oldest record");
        }

        self.emit(RlhfEvent::RewardComputed {
            key,
            reward: reward.value(),
            components: reward.components(),
            replaced: outcome.replaced,
        });

        if experience_recorded && self.inner.config.training.update_frequency == UpdateFrequency::Immediate {
            self.inner.feedback_arrived.notify_one();
        }

        Ok(FeedbackAck {
            feedback_id,
            reward: reward.value(),
            components: reward.components(),
            accepted: true,
            replaced: outcome.replaced,
            experience_recorded,
        })
    }

    fn context_fits(&self, context: &PredictionContext) -> bool {
        context.state.dimension() == self.inner.input_dim
            && context.state.is_finite()
            && context.action.index() < self.inner.action_space
    }

    /// Record what the model saw and decided for a prediction
    pub async fn register_prediction(
        &self,
        prediction_id: impl Into<String>,
        context: PredictionContext,
    ) -> Result<()> {
        let prediction_id = prediction_id.into();
        if prediction_id.trim().is_empty() {
            return Err(RlhfError::InvalidFeedback("prediction_id must not be empty".into()));
        }
        if !self.context_fits(&context) {
            return Err(RlhfError::InvalidFeedback(format!(
                "prediction context needs {} finite features and an action below {}, got {} features and action {}",
                self.inner.input_dim,
                self.inner.action_space,
                context.state.dimension(),
                context.action.index()
            )));
        }

        self.inner.predictions.register(prediction_id, context).await
    }

    /// Run a training cycle.
    ///
    /// A manual trigger waits for any cycle in flight. A scheduled trigger
    /// that finds a cycle running is coalesced into it and reported as skipped.
    pub async fn trigger_training(&self, trigger: TriggerSource) -> TrainingResult {
        let result = match trigger {
            TriggerSource::Manual => {
                let mut trainer = self.inner.trainer.lock().await;
                trainer.run_cycle(&self.inner.store, &self.inner.buffer, trigger).await
            }
            TriggerSource::Scheduled => match self.inner.trainer.try_lock() {
                Ok(mut trainer) => trainer.run_cycle(&self.inner.store, &self.inner.buffer, trigger).await,
                Err(_) => {
                    debug!("Scheduled trigger coalesced into running cycle");
                    TrainingResult::skipped(
                        0,
                        self.inner.config.training.update_strategy,
                        trigger,
                        SkipReason::CycleInProgress,
                    )
                }
            },
        };

        self.emit(RlhfEvent::TrainingCompleted(result.clone()));
        result
    }

    /// Drop feedback older than the staleness window
    pub async fn sweep_stale(&self) -> usize {
        let removed = self.inner.store.lock().await.sweep_stale(Utc::now());
        if removed > 0 {
            info!(removed, "Expired stale feedback");
            self.emit(RlhfEvent::FeedbackExpired { removed });
        }
        removed
    }

    /// Load the newest checkpoint, if any, into the live model
    pub async fn restore_latest(&self) -> Result<bool> {
        Ok(self.inner.trainer.lock().await.restore_latest().await?.is_some())
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .background
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the background schedule and staleness sweeps. Idempotent.
    pub async fn start(&self) {
        let mut background = self.inner.background.lock().await;
        if background.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let shutdown = self.inner.shutdown.subscribe();
        let service = self.clone();
        *background = Some(tokio::spawn(async move { service.run_background(shutdown).await }));

        info!(
            update_frequency = ?self.inner.config.training.update_frequency,
            sweep_interval_secs = self.inner.config.feedback.sweep_interval_secs,
            "RLHF background loop started"
        );
    }

    /// Stop the background loop. A cycle already running finishes first.
    pub async fn stop(&self) {
        let handle = self.inner.background.lock().await.take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.inner.shutdown.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "RLHF background loop ended abnormally");
        }
        info!("RLHF background loop stopped");
    }

    async fn run_background(self, mut shutdown: broadcast::Receiver<()>) {
        let frequency = self.inner.config.training.update_frequency;
        let immediate = frequency == UpdateFrequency::Immediate;

        let mut schedule = frequency.interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let sweep_period = Duration::from_secs(self.inner.config.feedback.sweep_interval_secs.max(1));
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                () = async {
                    match schedule.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.trigger_training(TriggerSource::Scheduled).await;
                }
                () = self.inner.feedback_arrived.notified(), if immediate => {
                    self.trigger_training(TriggerSource::Scheduled).await;
                }
                _ = sweep.tick() => {
                    self.sweep_stale().await;
                }
            }
        }
    }

    pub async fn stats(&self) -> ServiceStats {
        let feedback = self.inner.store.lock().await.stats();
        let (buffer_len, buffer_capacity, beta) = {
            let buffer = self.inner.buffer.lock().await;
            (buffer.len(), buffer.capacity(), buffer.beta())
        };

        // Counters as of the last finished cycle, even while one is running
        let TrainerProgress {
            rounds,
            completed_updates,
            last_result,
        } = self.inner.trainer_progress.borrow().clone();
        let last_loss = last_result
            .as_ref()
            .filter(|result| result.is_updated())
            .map(|result| result.mean_loss);

        ServiceStats {
            running: self.is_running().await,
            trainer_state: *self.inner.trainer_state.borrow(),
            update_strategy: self.inner.config.training.update_strategy,
            buffer_type: self.inner.config.buffer.buffer_type,
            feedback,
            buffer_len,
            buffer_capacity,
            beta,
            rounds,
            completed_updates,
            last_loss,
            last_result,
            feedback_rejected: self.inner.feedback_rejected.load(Ordering::Relaxed),
            experiences_recorded: self.inner.experiences_recorded.load(Ordering::Relaxed),
        }
    }
}
