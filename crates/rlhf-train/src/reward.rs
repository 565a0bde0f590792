//! Reward computation from officer feedback
//!
//! Pure and deterministic: the same record and weights always give the same
//! reward. Rewards are not clipped; large values are left for the trainer's
//! gradient clipping to absorb.

use serde::{Deserialize, Serialize};

use rlhf_core::{FeedbackRecord, InterventionResult, PredictionAccuracy, Result};

use crate::config::{RewardConfig, RewardStrategy};
use crate::state::Reward;

/// Shaped reward split into its heads
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardComponents {
    pub location: f64,
    pub outcome: f64,
    pub recovery: f64,
}

impl RewardComponents {
    pub fn total(&self) -> f64 {
        self.location + self.outcome + self.recovery
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.location, self.outcome, self.recovery]
    }

    /// Head-weighted sum used by the hierarchical loss
    pub fn weighted(&self, head_weights: &[f64; 3]) -> f64 {
        self.as_array()
            .iter()
            .zip(head_weights)
            .map(|(r, w)| r * w)
            .sum()
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}

/// Output of a reward strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RewardSignal {
    Scalar(Reward),
    /// Hierarchical strategy: aggregation deferred to the trainer
    Vector(RewardComponents),
}

impl RewardSignal {
    /// Scalar view; vectors collapse to the unweighted sum
    pub fn value(&self) -> Reward {
        match self {
            RewardSignal::Scalar(r) => *r,
            RewardSignal::Vector(c) => c.total(),
        }
    }

    pub fn components(&self) -> Option<RewardComponents> {
        match self {
            RewardSignal::Scalar(_) => None,
            RewardSignal::Vector(c) => Some(*c),
        }
    }
}

/// Converts feedback into rewards using the configured strategy
#[derive(Debug, Clone)]
pub struct RewardCalculator {
    config: RewardConfig,
}

impl RewardCalculator {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn strategy(&self) -> RewardStrategy {
        self.config.strategy
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    /// Compute the reward signal, rejecting malformed records.
    pub fn compute(&self, record: &FeedbackRecord) -> Result<RewardSignal> {
        record.validate()?;

        let signal = match self.config.strategy {
            RewardStrategy::Sparse => RewardSignal::Scalar(Self::sparse(record)),
            RewardStrategy::Shaped => RewardSignal::Scalar(self.shaped_components(record).total()),
            RewardStrategy::Hierarchical => RewardSignal::Vector(self.shaped_components(record)),
        };

        Ok(signal)
    }

    /// Scalar reward for the record
    pub fn reward(&self, record: &FeedbackRecord) -> Result<Reward> {
        Ok(self.compute(record)?.value())
    }

    fn sparse(record: &FeedbackRecord) -> Reward {
        match record.intervention_result {
            result if result.is_success() => 1.0,
            InterventionResult::Unsuccessful => -1.0,
            _ => 0.0,
        }
    }

    /// The three shaped terms, independent of the active strategy
    pub fn shaped_components(&self, record: &FeedbackRecord) -> RewardComponents {
        RewardComponents {
            location: self.location_term(record.prediction_accuracy),
            outcome: self.outcome_term(record.intervention_result),
            recovery: record.recovery_rate() * self.config.recovery_rate_multiplier,
        }
    }

    fn location_term(&self, accuracy: PredictionAccuracy) -> f64 {
        let c = &self.config;
        match accuracy {
            PredictionAccuracy::ExactMatch => c.location_exact_match_reward,
            PredictionAccuracy::Nearby => c.location_nearby_reward,
            PredictionAccuracy::Different => c.location_different_penalty,
            PredictionAccuracy::Unknown => 0.0,
        }
    }

    fn outcome_term(&self, result: InterventionResult) -> f64 {
        let c = &self.config;
        match result {
            InterventionResult::Apprehension => c.apprehension_reward,
            InterventionResult::Recovery => c.recovery_reward,
            InterventionResult::Both => {
                c.apprehension_reward + c.recovery_reward + c.both_outcome_bonus
            }
            InterventionResult::Unsuccessful => c.unsuccessful_penalty,
            InterventionResult::None => 0.0,
        }
    }
}

impl Default for RewardCalculator {
    fn default() -> Self {
        Self::new(RewardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlhf_core::{FeedbackKey, RlhfError};

    fn record(accuracy: PredictionAccuracy, result: InterventionResult) -> FeedbackRecord {
        FeedbackRecord::new(FeedbackKey::new("case", "pred", "officer"), accuracy, result)
    }

    fn calculator(strategy: RewardStrategy) -> RewardCalculator {
        RewardCalculator::new(RewardConfig {
            strategy,
            ..RewardConfig::default()
        })
    }

    #[test]
    fn test_shaped_recovery_scenario() {
        let calc = RewardCalculator::default();
        let fb = record(PredictionAccuracy::ExactMatch, InterventionResult::Recovery)
            .with_amounts(Some(50_000.0), Some(100_000.0));

        let reward = calc.reward(&fb).unwrap();
        assert!((reward - 18.5).abs() < 1e-9);
    }

    #[test]
    fn test_both_beats_unsuccessful_for_every_accuracy() {
        let calc = RewardCalculator::default();
        for accuracy in PredictionAccuracy::ALL {
            let both = calc.reward(&record(accuracy, InterventionResult::Both)).unwrap();
            let failed = calc
                .reward(&record(accuracy, InterventionResult::Unsuccessful))
                .unwrap();
            assert!(both > failed, "{accuracy}: {both} <= {failed}");
        }
    }

    #[test]
    fn test_both_includes_bonus() {
        let calc = RewardCalculator::default();
        let reward = calc
            .reward(&record(PredictionAccuracy::Unknown, InterventionResult::Both))
            .unwrap();
        assert_eq!(reward, 8.0 + 6.0 + 4.0);
    }

    #[test]
    fn test_location_terms() {
        let calc = RewardCalculator::default();
        let none = InterventionResult::None;
        assert_eq!(calc.reward(&record(PredictionAccuracy::Nearby, none)).unwrap(), 5.0);
        assert_eq!(calc.reward(&record(PredictionAccuracy::Different, none)).unwrap(), -5.0);
        assert_eq!(calc.reward(&record(PredictionAccuracy::Unknown, none)).unwrap(), 0.0);
    }

    #[test]
    fn test_no_clipping() {
        let calc = RewardCalculator::default();
        let fb = record(PredictionAccuracy::ExactMatch, InterventionResult::Recovery)
            .with_amounts(Some(1_000_000.0), Some(1.0));
        let reward = calc.reward(&fb).unwrap();
        assert!(reward > 1_000_000.0);
    }

    #[test]
    fn test_sparse() {
        let calc = calculator(RewardStrategy::Sparse);
        let acc = PredictionAccuracy::Different;
        assert_eq!(calc.reward(&record(acc, InterventionResult::Both)).unwrap(), 1.0);
        assert_eq!(calc.reward(&record(acc, InterventionResult::Apprehension)).unwrap(), 1.0);
        assert_eq!(calc.reward(&record(acc, InterventionResult::Unsuccessful)).unwrap(), -1.0);
        assert_eq!(calc.reward(&record(acc, InterventionResult::None)).unwrap(), 0.0);
    }

    #[test]
    fn test_sparse_rewards_every_successful_outcome() {
        let calc = calculator(RewardStrategy::Sparse);
        for result in InterventionResult::ALL {
            let reward = calc.reward(&record(PredictionAccuracy::Unknown, result)).unwrap();
            assert_eq!(reward == 1.0, result.is_success(), "{result}");
        }
    }

    #[test]
    fn test_hierarchical_keeps_heads() {
        let calc = calculator(RewardStrategy::Hierarchical);
        let fb = record(PredictionAccuracy::ExactMatch, InterventionResult::Recovery)
            .with_amounts(Some(50_000.0), Some(100_000.0));

        let signal = calc.compute(&fb).unwrap();
        let components = signal.components().unwrap();
        assert_eq!(components.location, 10.0);
        assert_eq!(components.outcome, 6.0);
        assert!((components.recovery - 2.5).abs() < 1e-9);
        assert!((signal.value() - 18.5).abs() < 1e-9);
        assert!((components.weighted(&[0.0, 1.0, 0.0]) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_malformed() {
        let calc = RewardCalculator::default();
        let fb = record(PredictionAccuracy::ExactMatch, InterventionResult::Recovery)
            .with_amounts(Some(-5.0), Some(100.0));
        assert!(matches!(calc.compute(&fb), Err(RlhfError::InvalidFeedback(_))));
    }
}
