//! Policy update strategies
//!
//! Each strategy consumes one [`TrainingBatch`], mutates the given model and
//! reports a per-sample error for priority write-back. Every gradient is
//! clipped to `max_gradient_norm` before it is applied. Callers run this on
//! a scratch copy of the model and discard it on error, so a failed step
//! never leaves partial updates behind.

use std::collections::HashMap;

use rlhf_core::{Result, RlhfError};

use crate::config::{RewardConfig, TrainingConfig, UpdateStrategy};
use crate::experience::TrainingBatch;
use crate::model::{Gradients, PolicyModel};

/// Hyperparameters for one update
#[derive(Debug, Clone)]
pub struct UpdateParams {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub ppo_clip_ratio: f64,
    pub ppo_epochs: usize,
    pub value_loss_coef: f64,
    pub max_gradient_norm: f64,
    pub head_weights: [f64; 3],
}

impl UpdateParams {
    pub fn from_config(training: &TrainingConfig, reward: &RewardConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            discount_factor: training.discount_factor,
            ppo_clip_ratio: training.ppo_clip_ratio,
            ppo_epochs: training.ppo_epochs,
            value_loss_coef: training.value_loss_coef,
            max_gradient_norm: training.max_gradient_norm,
            head_weights: reward.head_weights,
        }
    }
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self::from_config(&TrainingConfig::default(), &RewardConfig::default())
    }
}

/// What an update did
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub mean_loss: f64,
    /// Largest pre-clip gradient norm across passes
    pub gradient_norm: f64,
    pub clipped: bool,
    pub passes: usize,
    /// |training error| per batch item, in batch order
    pub sample_errors: Vec<f64>,
}

/// Run one update of `strategy` over `batch`
pub fn apply_update(
    strategy: UpdateStrategy,
    model: &mut dyn PolicyModel,
    batch: &TrainingBatch,
    params: &UpdateParams,
) -> Result<UpdateReport> {
    if batch.is_empty() {
        return Err(RlhfError::TrainingFailed("empty batch".into()));
    }

    let returns = discounted_returns(batch, params);
    if let Some(i) = returns.iter().position(|g| !g.is_finite()) {
        return Err(RlhfError::TrainingFailed(format!(
            "non-finite return for {}",
            batch.items[i].experience.key
        )));
    }

    match strategy {
        UpdateStrategy::Reinforce => reinforce(model, batch, &returns, params),
        UpdateStrategy::Ppo => ppo(model, batch, &returns, params),
        UpdateStrategy::ActorCritic => actor_critic(model, batch, &returns, params),
    }
}

/// Discounted return-to-go per batch item.
///
/// Items sharing a `case_id` form one trace ordered by `created_at`; a
/// slot sampled twice counts once in its trace.
pub fn discounted_returns(batch: &TrainingBatch, params: &UpdateParams) -> Vec<f64> {
    let mut traces: HashMap<&str, Vec<(usize, u64)>> = HashMap::new();
    for (i, item) in batch.items.iter().enumerate() {
        let trace = traces.entry(item.experience.key.case_id.as_str()).or_default();
        if !trace.iter().any(|&(_, seq)| seq == item.index.sequence) {
            trace.push((i, item.index.sequence));
        }
    }

    let mut by_sequence: HashMap<u64, f64> = HashMap::new();
    for trace in traces.values_mut() {
        trace.sort_by_key(|&(i, seq)| (batch.items[i].experience.created_at, seq));

        let mut running = 0.0;
        for &(i, seq) in trace.iter().rev() {
            let reward = batch.items[i].experience.training_reward(&params.head_weights);
            running = reward + params.discount_factor * running;
            by_sequence.insert(seq, running);
        }
    }

    batch
        .items
        .iter()
        .map(|item| by_sequence.get(&item.index.sequence).copied().unwrap_or(0.0))
        .collect()
}

fn finish_pass(
    model: &mut dyn PolicyModel,
    mut gradients: Gradients,
    loss: f64,
    params: &UpdateParams,
) -> Result<(f64, bool)> {
    if !loss.is_finite() {
        return Err(RlhfError::TrainingFailed(format!("non-finite loss {loss}")));
    }
    if !gradients.is_finite() {
        return Err(RlhfError::TrainingFailed("non-finite gradient".into()));
    }

    let raw_norm = gradients.clip_to_norm(params.max_gradient_norm);
    model.apply_gradients(&gradients, params.learning_rate)?;
    Ok((raw_norm, raw_norm > params.max_gradient_norm))
}

/// loss = -mean(w * G * log pi(a|s))
fn reinforce(
    model: &mut dyn PolicyModel,
    batch: &TrainingBatch,
    returns: &[f64],
    params: &UpdateParams,
) -> Result<UpdateReport> {
    let n = batch.len() as f64;
    let mut gradients = Gradients::new();
    let mut loss = 0.0;
    let mut errors = Vec::with_capacity(batch.len());

    for (item, &g) in batch.items.iter().zip(returns) {
        let exp = &item.experience;
        let log_prob = model.log_prob(&exp.state, exp.action)?;
        let grad = model.log_prob_grad(&exp.state, exp.action)?;

        loss -= item.weight * g * log_prob / n;
        gradients.accumulate(&grad, -item.weight * g / n)?;
        errors.push((g * log_prob).abs());
    }

    let (gradient_norm, clipped) = finish_pass(model, gradients, loss, params)?;
    Ok(UpdateReport {
        mean_loss: loss,
        gradient_norm,
        clipped,
        passes: 1,
        sample_errors: errors,
    })
}

/// Clipped surrogate objective over `ppo_epochs` passes, critic trained alongside
fn ppo(
    model: &mut dyn PolicyModel,
    batch: &TrainingBatch,
    returns: &[f64],
    params: &UpdateParams,
) -> Result<UpdateReport> {
    let n = batch.len() as f64;
    let eps = params.ppo_clip_ratio;

    let mut old_log_probs = Vec::with_capacity(batch.len());
    let mut advantages = Vec::with_capacity(batch.len());
    for (item, &g) in batch.items.iter().zip(returns) {
        let exp = &item.experience;
        old_log_probs.push(model.log_prob(&exp.state, exp.action)?);
        advantages.push(g - model.value(&exp.state)?);
    }

    let mut report = UpdateReport {
        mean_loss: 0.0,
        gradient_norm: 0.0,
        clipped: false,
        passes: 0,
        sample_errors: advantages.iter().map(|a| a.abs()).collect(),
    };

    for _ in 0..params.ppo_epochs {
        let mut gradients = Gradients::new();
        let mut loss = 0.0;

        for ((item, &g), (&old, &advantage)) in batch
            .items
            .iter()
            .zip(returns)
            .zip(old_log_probs.iter().zip(&advantages))
        {
            let exp = &item.experience;
            let new = model.log_prob(&exp.state, exp.action)?;
            let ratio = (new - old).exp();
            let unclipped = ratio * advantage;
            let clipped = ratio.clamp(1.0 - eps, 1.0 + eps) * advantage;

            loss -= item.weight * unclipped.min(clipped) / n;
            if unclipped <= clipped {
                // d ratio / d theta = ratio * grad log pi
                let grad = model.log_prob_grad(&exp.state, exp.action)?;
                gradients.accumulate(&grad, -item.weight * advantage * ratio / n)?;
            }

            let value_error = g - model.value(&exp.state)?;
            loss += params.value_loss_coef * item.weight * 0.5 * value_error * value_error / n;
            let value_grad = model.value_grad(&exp.state)?;
            gradients.accumulate(
                &value_grad,
                -params.value_loss_coef * item.weight * value_error / n,
            )?;
        }

        let (norm, clipped) = finish_pass(model, gradients, loss, params)?;
        report.mean_loss = loss;
        report.gradient_norm = report.gradient_norm.max(norm);
        report.clipped |= clipped;
        report.passes += 1;
    }

    Ok(report)
}

/// Advantage = G - V(s); policy gradient on the advantage plus a squared-error critic
fn actor_critic(
    model: &mut dyn PolicyModel,
    batch: &TrainingBatch,
    returns: &[f64],
    params: &UpdateParams,
) -> Result<UpdateReport> {
    let n = batch.len() as f64;
    let mut gradients = Gradients::new();
    let mut loss = 0.0;
    let mut errors = Vec::with_capacity(batch.len());

    for (item, &g) in batch.items.iter().zip(returns) {
        let exp = &item.experience;
        let advantage = g - model.value(&exp.state)?;
        let log_prob = model.log_prob(&exp.state, exp.action)?;

        loss -= item.weight * advantage * log_prob / n;
        loss += params.value_loss_coef * item.weight * 0.5 * advantage * advantage / n;

        let policy_grad = model.log_prob_grad(&exp.state, exp.action)?;
        gradients.accumulate(&policy_grad, -item.weight * advantage / n)?;
        let value_grad = model.value_grad(&exp.state)?;
        gradients.accumulate(&value_grad, -params.value_loss_coef * item.weight * advantage / n)?;

        errors.push(advantage.abs());
    }

    let (gradient_norm, clipped) = finish_pass(model, gradients, loss, params)?;
    Ok(UpdateReport {
        mean_loss: loss,
        gradient_norm,
        clipped,
        passes: 1,
        sample_errors: errors,
    })
}
