//! Prioritized experience replay
//!
//! Sampling probability is `p_i^alpha / sum_j p_j^alpha`. Importance weights
//! `(N * P(i))^-beta` are normalized so the largest weight in a batch is 1.
//! `beta` anneals towards 1 by `beta_increment` after every sample call.

use rand::Rng;

use rlhf_core::{FeedbackKey, Result, RlhfError};

use crate::experience::{BatchItem, Experience, Ring, SampleIndex, TrainingBatch};
use crate::sum_tree::PriorityTree;

/// Floor applied to non-positive or non-finite priorities
pub const PRIORITY_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct PrioritizedExperienceBuffer {
    ring: Ring,
    tree: PriorityTree,
    alpha: f64,
    beta: f64,
    beta_increment: f64,
}

impl PrioritizedExperienceBuffer {
    pub fn new(capacity: usize, alpha: f64, beta: f64, beta_increment: f64) -> Self {
        let ring = Ring::new(capacity);
        let tree = PriorityTree::new(ring.capacity());
        Self {
            ring,
            tree,
            alpha: alpha.max(0.0),
            beta: beta.clamp(0.0, 1.0),
            beta_increment: beta_increment.max(0.0),
        }
    }

    /// Add an experience at the current maximum priority (1.0 when empty),
    /// so it is sampled at least once before its real priority is known.
    ///
    /// A resubmission for a buffered key replaces that slot and keeps its priority.
    pub fn push(&mut self, experience: Experience) {
        let priority = if self.ring.len() == 0 {
            1.0
        } else {
            self.tree.max_priority().max(PRIORITY_EPSILON)
        };

        let inserted = self.ring.insert(experience);
        if !inserted.replaced {
            self.set_priority(inserted.slot, priority);
        }
    }

    fn set_priority(&mut self, slot: usize, priority: f64) {
        self.tree.set(slot, priority.powf(self.alpha), priority);
    }

    /// Sample `batch_size` experiences proportionally to priority.
    pub fn sample(&mut self, batch_size: usize) -> Result<TrainingBatch> {
        self.sample_with(batch_size, &mut rand::thread_rng())
    }

    /// Stratified proportional sampling with importance weights
    pub fn sample_with<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<TrainingBatch> {
        let available = self.ring.len();
        if available < batch_size || available == 0 {
            return Err(RlhfError::InsufficientSamples {
                available,
                requested: batch_size,
            });
        }

        let total = self.tree.total();
        if !(total.is_finite() && total > 0.0) {
            return Err(RlhfError::Internal(format!(
                "priority mass is not usable: {total}"
            )));
        }

        let segment = total / batch_size as f64;
        let n = available as f64;
        let mut items = Vec::with_capacity(batch_size);

        for i in 0..batch_size {
            let low = segment * i as f64;
            let high = segment * (i + 1) as f64;
            let mass = if high > low { rng.gen_range(low..high) } else { low };

            let slot = self.tree.find(mass).min(available - 1);
            let Some((experience, index)) = self.ring.get(slot) else {
                continue;
            };

            let probability = self.tree.mass(slot) / total;
            let weight = (n * probability).powf(-self.beta);
            items.push(BatchItem {
                index,
                experience: experience.clone(),
                weight,
            });
        }

        let max_weight = items.iter().map(|item| item.weight).fold(0.0_f64, f64::max);
        if max_weight > 0.0 && max_weight.is_finite() {
            for item in &mut items {
                item.weight /= max_weight;
            }
        }

        self.beta = (self.beta + self.beta_increment).min(1.0);

        Ok(TrainingBatch { items })
    }

    /// Replace priorities of sampled experiences.
    ///
    /// Values that are not strictly positive and finite are floored at
    /// [`PRIORITY_EPSILON`]. Indices whose slot has been overwritten since
    /// sampling are skipped. Returns how many priorities were applied.
    pub fn update_priorities(&mut self, indices: &[SampleIndex], priorities: &[f64]) -> Result<usize> {
        if indices.len() != priorities.len() {
            return Err(RlhfError::Internal(format!(
                "{} indices but {} priorities",
                indices.len(),
                priorities.len()
            )));
        }

        let mut applied = 0;
        for (&index, &priority) in indices.iter().zip(priorities) {
            if !self.ring.is_current(index) {
                continue;
            }
            let priority = if priority.is_finite() && priority > 0.0 {
                priority.max(PRIORITY_EPSILON)
            } else {
                PRIORITY_EPSILON
            };
            self.set_priority(index.slot, priority);
            applied += 1;
        }

        Ok(applied)
    }

    /// Raw priority of a slot
    pub fn priority(&self, slot: usize) -> Option<f64> {
        (slot < self.ring.len()).then(|| self.tree.priority(slot))
    }

    pub fn max_priority(&self) -> f64 {
        self.tree.max_priority()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn oldest(&self) -> Option<&Experience> {
        self.ring.oldest()
    }

    pub fn contains_key(&self, key: &FeedbackKey) -> bool {
        self.ring.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.tree.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Action, State};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn exp(case: &str) -> Experience {
        Experience::new(
            FeedbackKey::new(case, "pred", "officer"),
            State::new(vec![1.0]),
            Action(0),
            1.0,
        )
    }

    fn filled(n: usize, alpha: f64, beta: f64) -> PrioritizedExperienceBuffer {
        let mut buffer = PrioritizedExperienceBuffer::new(n, alpha, beta, 0.0);
        for i in 0..n {
            buffer.push(exp(&format!("c{i}")));
        }
        buffer
    }

    #[test]
    fn test_first_push_gets_unit_priority() {
        let mut buffer = PrioritizedExperienceBuffer::new(4, 0.6, 0.4, 0.0);
        buffer.push(exp("c0"));
        assert_eq!(buffer.priority(0), Some(1.0));
    }

    #[test]
    fn test_push_uses_current_max_priority() {
        let mut buffer = PrioritizedExperienceBuffer::new(4, 0.6, 0.4, 0.0);
        buffer.push(exp("c0"));
        buffer.push(exp("c1"));
        let slot0 = buffer.ring.get(0).unwrap().1;
        buffer.update_priorities(&[slot0], &[7.5]).unwrap();

        buffer.push(exp("c2"));
        assert_eq!(buffer.priority(2), Some(7.5));
        assert_eq!(buffer.max_priority(), 7.5);
    }

    #[test]
    fn test_capacity_is_fifo_regardless_of_priority() {
        let mut buffer = PrioritizedExperienceBuffer::new(3, 0.6, 0.4, 0.0);
        for i in 0..3 {
            buffer.push(exp(&format!("c{i}")));
        }
        let slot0 = buffer.ring.get(0).unwrap().1;
        buffer.update_priorities(&[slot0], &[1000.0]).unwrap();

        buffer.push(exp("c3"));
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.contains_key(&FeedbackKey::new("c0", "pred", "officer")));
        assert_eq!(buffer.oldest().unwrap().key.case_id, "c1");
    }

    #[test]
    fn test_resubmission_keeps_slot_priority() {
        let mut buffer = filled(2, 0.6, 0.4);
        let indices: Vec<_> = (0..2).map(|s| buffer.ring.get(s).unwrap().1).collect();
        buffer.update_priorities(&indices, &[0.5, 4.0]).unwrap();

        let mut resubmitted = exp("c0");
        resubmitted.reward = 3.0;
        buffer.push(resubmitted);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.priority(0), Some(0.5));
        assert_eq!(buffer.ring.get(0).unwrap().0.reward, 3.0);
        // The old sample index no longer addresses the replaced slot
        assert_eq!(buffer.update_priorities(&indices[..1], &[9.0]).unwrap(), 0);
    }

    #[test]
    fn test_alpha_zero_gives_unit_weights() {
        for beta in [0.1, 0.4, 1.0] {
            let mut buffer = filled(16, 0.0, beta);
            let slot3 = buffer.ring.get(3).unwrap().1;
            buffer.update_priorities(&[slot3], &[50.0]).unwrap();

            let batch = buffer.sample(8).unwrap();
            assert!(batch.weights().iter().all(|&w| w == 1.0), "beta={beta}");
        }
    }

    #[test]
    fn test_weights_normalized_to_max_one() {
        let mut buffer = filled(8, 0.6, 0.5);
        let slot0 = buffer.ring.get(0).unwrap().1;
        buffer.update_priorities(&[slot0], &[20.0]).unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let batch = buffer.sample_with(8, &mut rng).unwrap();
        let max = batch.weights().into_iter().fold(0.0, f64::max);
        assert!((max - 1.0).abs() < 1e-12);
        assert!(batch.weights().iter().all(|&w| w > 0.0 && w <= 1.0));
    }

    #[test]
    fn test_beta_anneals_and_clamps() {
        let mut buffer = PrioritizedExperienceBuffer::new(4, 0.6, 0.9, 0.06);
        buffer.push(exp("c0"));

        buffer.sample(1).unwrap();
        assert!((buffer.beta() - 0.96).abs() < 1e-12);
        buffer.sample(1).unwrap();
        assert_eq!(buffer.beta(), 1.0);
        buffer.sample(1).unwrap();
        assert_eq!(buffer.beta(), 1.0);
    }

    #[test]
    fn test_update_floors_non_positive() {
        let mut buffer = filled(3, 0.6, 0.4);
        let indices: Vec<_> = (0..3).map(|s| buffer.ring.get(s).unwrap().1).collect();

        let applied = buffer
            .update_priorities(&indices, &[0.0, -4.0, f64::NAN])
            .unwrap();
        assert_eq!(applied, 3);
        for slot in 0..3 {
            assert_eq!(buffer.priority(slot), Some(PRIORITY_EPSILON));
        }
    }

    #[test]
    fn test_update_skips_overwritten_slots() {
        let mut buffer = filled(2, 0.6, 0.4);
        let stale = buffer.ring.get(0).unwrap().1;

        buffer.push(exp("c2"));
        assert_eq!(buffer.update_priorities(&[stale], &[9.0]).unwrap(), 0);
        assert_ne!(buffer.priority(0), Some(9.0));
    }

    #[test]
    fn test_update_length_mismatch() {
        let mut buffer = filled(2, 0.6, 0.4);
        let index = buffer.ring.get(0).unwrap().1;
        assert!(buffer.update_priorities(&[index], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_insufficient_samples() {
        let mut buffer = filled(3, 0.6, 0.4);
        let err = buffer.sample(4).unwrap_err();
        assert!(err.is_not_ready());

        let mut empty = PrioritizedExperienceBuffer::new(3, 0.6, 0.4, 0.1);
        assert!(empty.sample(1).is_err());
        // Failed calls do not anneal
        assert_eq!(empty.beta(), 0.4);
    }

    #[test]
    fn test_high_priority_sampling_frequency() {
        let n = 10;
        let alpha = 0.6;
        let mut buffer = filled(n, alpha, 0.4);
        let indices: Vec<_> = (0..n).map(|s| buffer.ring.get(s).unwrap().1).collect();
        let mut priorities = vec![1.0; n];
        priorities[4] = 100.0;
        buffer.update_priorities(&indices, &priorities).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let draws = 5000;
        let mut hits = 0;
        for _ in 0..draws {
            let batch = buffer.sample_with(1, &mut rng).unwrap();
            if batch.items[0].index.slot == 4 {
                hits += 1;
            }
        }

        let expected = 100f64.powf(alpha) / (100f64.powf(alpha) + (n - 1) as f64);
        let observed = hits as f64 / draws as f64;
        assert!(
            (observed - expected).abs() < 0.03,
            "observed {observed:.3}, expected {expected:.3}"
        );
    }
}
