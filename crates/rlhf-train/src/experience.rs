//! Experience replay buffers
//!
//! Storage is a fixed-capacity ring: once full, each push overwrites the
//! oldest slot. Priority never influences retention, only sampling.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use rlhf_core::{FeedbackKey, Result, RlhfError};

use crate::config::{BufferConfig, BufferType};
use crate::prioritized::PrioritizedExperienceBuffer;
use crate::reward::RewardComponents;
use crate::state::{Action, Reward, State};

/// A single trainable (state, action, reward) sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    /// Feedback this experience was derived from
    pub key: FeedbackKey,
    pub state: State,
    pub action: Action,
    pub reward: Reward,
    /// Per-head rewards when the hierarchical strategy produced this sample
    pub components: Option<RewardComponents>,
    pub created_at: DateTime<Utc>,
}

impl Experience {
    pub fn new(key: FeedbackKey, state: State, action: Action, reward: Reward) -> Self {
        Self {
            key,
            state,
            action,
            reward,
            components: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_components(mut self, components: Option<RewardComponents>) -> Self {
        self.components = components;
        self
    }

    /// Reward the trainer optimizes, weighting each head for hierarchical rewards
    pub fn training_reward(&self, head_weights: &[f64; 3]) -> Reward {
        match &self.components {
            Some(c) => c.weighted(head_weights),
            None => self.reward,
        }
    }
}

/// Location of a sampled experience.
///
/// The sequence number identifies the occupant of the slot, so a priority
/// update for a slot that was overwritten after sampling is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleIndex {
    pub slot: usize,
    pub sequence: u64,
}

/// One entry of a training batch
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub index: SampleIndex,
    pub experience: Experience,
    /// Importance-sampling weight, 1.0 for uniform sampling
    pub weight: f64,
}

/// Ordered sample consumed by one trainer step
#[derive(Debug, Clone, Default)]
pub struct TrainingBatch {
    pub items: Vec<BatchItem>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn indices(&self) -> Vec<SampleIndex> {
        self.items.iter().map(|item| item.index).collect()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.items.iter().map(|item| item.weight).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    experience: Experience,
    sequence: u64,
}

/// What a push did to the ring
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inserted {
    pub slot: usize,
    pub replaced: bool,
}

/// Fixed-capacity keyed ring shared by both buffer variants
#[derive(Debug, Clone)]
pub(crate) struct Ring {
    slots: Vec<Option<Slot>>,
    keys: HashMap<FeedbackKey, usize>,
    next: usize,
    len: usize,
    sequence: u64,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            keys: HashMap::new(),
            next: 0,
            len: 0,
            sequence: 0,
        }
    }

    /// Insert, replacing in place when the key is already buffered
    pub fn insert(&mut self, experience: Experience) -> Inserted {
        self.sequence += 1;

        if let Some(&slot) = self.keys.get(&experience.key) {
            self.slots[slot] = Some(Slot {
                experience,
                sequence: self.sequence,
            });
            return Inserted {
                slot,
                replaced: true,
            };
        }

        let slot = self.next;
        if let Some(old) = self.slots[slot].take() {
            self.keys.remove(&old.experience.key);
        }
        self.keys.insert(experience.key.clone(), slot);
        self.slots[slot] = Some(Slot {
            experience,
            sequence: self.sequence,
        });

        self.next = (self.next + 1) % self.slots.len();
        self.len = (self.len + 1).min(self.slots.len());

        Inserted {
            slot,
            replaced: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots are always `0..len`
    pub fn get(&self, slot: usize) -> Option<(&Experience, SampleIndex)> {
        self.slots.get(slot)?.as_ref().map(|s| {
            (
                &s.experience,
                SampleIndex {
                    slot,
                    sequence: s.sequence,
                },
            )
        })
    }

    pub fn is_current(&self, index: SampleIndex) -> bool {
        matches!(self.slots.get(index.slot), Some(Some(s)) if s.sequence == index.sequence)
    }

    /// The experience that the next push of a new key would evict
    pub fn oldest(&self) -> Option<&Experience> {
        let slot = if self.len < self.slots.len() { 0 } else { self.next };
        self.get(slot).map(|(exp, _)| exp)
    }

    pub fn contains_key(&self, key: &FeedbackKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.keys.clear();
        self.next = 0;
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.slots.iter().flatten().map(|s| &s.experience)
    }
}

/// Uniform experience replay buffer
#[derive(Debug, Clone)]
pub struct ExperienceBuffer {
    ring: Ring,
}

impl ExperienceBuffer {
    /// Create a new experience buffer with given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
        }
    }

    /// Add an experience, overwriting the oldest slot when full
    pub fn push(&mut self, experience: Experience) {
        self.ring.insert(experience);
    }

    /// Sample a batch uniformly without replacement
    pub fn sample(&self, batch_size: usize) -> Result<TrainingBatch> {
        self.sample_with(batch_size, &mut rand::thread_rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Result<TrainingBatch> {
        let available = self.ring.len();
        if available < batch_size || available == 0 {
            return Err(RlhfError::InsufficientSamples {
                available,
                requested: batch_size,
            });
        }

        let items = index::sample(rng, available, batch_size)
            .into_iter()
            .filter_map(|slot| self.ring.get(slot))
            .map(|(experience, index)| BatchItem {
                index,
                experience: experience.clone(),
                weight: 1.0,
            })
            .collect();

        Ok(TrainingBatch { items })
    }

    /// Get buffer length
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Check if buffer is empty
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

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// Get all experiences in slot order
    pub fn all(&self) -> Vec<Experience> {
        self.ring.iter().cloned().collect()
    }
}

impl Default for ExperienceBuffer {
    fn default() -> Self {
        Self::new(10000)
    }
}

/// Replay buffer selected by `buffer_type`
#[derive(Debug, Clone)]
pub enum ReplayBuffer {
    Uniform(ExperienceBuffer),
    Prioritized(PrioritizedExperienceBuffer),
}

impl ReplayBuffer {
    pub fn from_config(config: &BufferConfig) -> Self {
        match config.buffer_type {
            BufferType::Uniform => ReplayBuffer::Uniform(ExperienceBuffer::new(config.capacity)),
            BufferType::Prioritized => ReplayBuffer::Prioritized(PrioritizedExperienceBuffer::new(
                config.capacity,
                config.priority_alpha,
                config.priority_beta,
                config.priority_beta_increment,
            )),
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        match self {
            ReplayBuffer::Uniform(_) => BufferType::Uniform,
            ReplayBuffer::Prioritized(_) => BufferType::Prioritized,
        }
    }

    pub fn push(&mut self, experience: Experience) {
        match self {
            ReplayBuffer::Uniform(b) => b.push(experience),
            ReplayBuffer::Prioritized(b) => b.push(experience),
        }
    }

    pub fn sample(&mut self, batch_size: usize) -> Result<TrainingBatch> {
        self.sample_with(batch_size, &mut rand::thread_rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<TrainingBatch> {
        match self {
            ReplayBuffer::Uniform(b) => b.sample_with(batch_size, rng),
            ReplayBuffer::Prioritized(b) => b.sample_with(batch_size, rng),
        }
    }

    /// Write back training errors; a no-op for the uniform buffer.
    /// Returns how many priorities were applied.
    pub fn update_priorities(&mut self, indices: &[SampleIndex], priorities: &[f64]) -> Result<usize> {
        match self {
            ReplayBuffer::Uniform(_) => Ok(0),
            ReplayBuffer::Prioritized(b) => b.update_priorities(indices, priorities),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReplayBuffer::Uniform(b) => b.len(),
            ReplayBuffer::Prioritized(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            ReplayBuffer::Uniform(b) => b.capacity(),
            ReplayBuffer::Prioritized(b) => b.capacity(),
        }
    }

    /// Current importance-sampling exponent, if prioritized
    pub fn beta(&self) -> Option<f64> {
        match self {
            ReplayBuffer::Uniform(_) => None,
            ReplayBuffer::Prioritized(b) => Some(b.beta()),
        }
    }
}
