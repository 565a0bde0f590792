//! Policy model interface and a reference linear softmax policy
//!
//! The trainer only needs log-probabilities, value estimates and their
//! gradients; concrete architectures plug in behind [`PolicyModel`].

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayD, ArrayView1, Axis};
use rand::Rng;

use rlhf_core::{Result, RlhfError};

use crate::codec::{DType, Tensor, WeightSet};
use crate::state::{Action, State};

/// Named parameter gradients (loss gradients: applying them descends)
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    tensors: BTreeMap<String, ArrayD<f64>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, gradient: ArrayD<f64>) {
        self.tensors.insert(name.into(), gradient);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f64>)> {
        self.tensors.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// `self += scale * other`
    pub fn accumulate(&mut self, other: &Gradients, scale: f64) -> Result<()> {
        for (name, gradient) in &other.tensors {
            match self.tensors.get_mut(name) {
                Some(existing) => {
                    if existing.shape() != gradient.shape() {
                        return Err(RlhfError::TrainingFailed(format!(
                            "gradient {name}: shape {:?} vs {:?}",
                            existing.shape(),
                            gradient.shape()
                        )));
                    }
                    existing.scaled_add(scale, gradient);
                }
                None => {
                    self.tensors
                        .insert(name.clone(), gradient.mapv(|v| v * scale));
                }
            }
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        for gradient in self.tensors.values_mut() {
            gradient.mapv_inplace(|v| v * factor);
        }
    }

    /// Global L2 norm across all tensors
    pub fn global_norm(&self) -> f64 {
        self.tensors
            .values()
            .flat_map(|g| g.iter())
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.tensors.values().all(|g| g.iter().all(|v| v.is_finite()))
    }

    /// Rescale so the global norm is at most `max_norm`. Returns the raw norm.
    pub fn clip_to_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }
}

/// Trainable policy with a value head
pub trait PolicyModel: Send + Sync {
    /// Model name
    fn name(&self) -> &str;

    fn input_dim(&self) -> usize;

    fn action_space_size(&self) -> usize;

    /// log pi(action | state)
    fn log_prob(&self, state: &State, action: Action) -> Result<f64>;

    /// Gradient of log pi(action | state) with respect to the parameters
    fn log_prob_grad(&self, state: &State, action: Action) -> Result<Gradients>;

    /// Value estimate V(state)
    fn value(&self, state: &State) -> Result<f64>;

    /// Gradient of V(state) with respect to the parameters
    fn value_grad(&self, state: &State) -> Result<Gradients>;

    /// `params -= learning_rate * gradients`
    fn apply_gradients(&mut self, gradients: &Gradients, learning_rate: f64) -> Result<()>;

    fn export_weights(&self) -> WeightSet;

    fn import_weights(&mut self, weights: &WeightSet) -> Result<()>;

    fn boxed_clone(&self) -> Box<dyn PolicyModel>;
}

const POLICY_WEIGHT: &str = "policy.weight";
const POLICY_BIAS: &str = "policy.bias";
const VALUE_WEIGHT: &str = "value.weight";
const VALUE_BIAS: &str = "value.bias";

/// Linear softmax policy over discrete actions with a linear value baseline
#[derive(Debug, Clone)]
pub struct SoftmaxPolicy {
    policy_weight: Array2<f64>,
    policy_bias: Array1<f64>,
    value_weight: Array1<f64>,
    value_bias: Array1<f64>,
}

impl SoftmaxPolicy {
    /// Zero-initialized: uniform policy, zero baseline
    pub fn new(input_dim: usize, action_space: usize) -> Self {
        Self {
            policy_weight: Array2::zeros((action_space, input_dim)),
            policy_bias: Array1::zeros(action_space),
            value_weight: Array1::zeros(input_dim),
            value_bias: Array1::zeros(1),
        }
    }

    /// Small random policy weights in `[-scale, scale)`
    pub fn random<R: Rng + ?Sized>(input_dim: usize, action_space: usize, scale: f64, rng: &mut R) -> Self {
        let mut policy = Self::new(input_dim, action_space);
        if scale > 0.0 {
            policy
                .policy_weight
                .mapv_inplace(|_| rng.gen_range(-scale..scale));
        }
        policy
    }

    fn features<'a>(&self, state: &'a State) -> Result<ArrayView1<'a, f64>> {
        if state.dimension() != self.input_dim() {
            return Err(RlhfError::TrainingFailed(format!(
                "state has {} features, model expects {}",
                state.dimension(),
                self.input_dim()
            )));
        }
        Ok(ArrayView1::from(state.to_features()))
    }

    fn check_action(&self, action: Action) -> Result<()> {
        if action.index() >= self.action_space_size() {
            return Err(RlhfError::TrainingFailed(format!(
                "action {} outside action space of {}",
                action.index(),
                self.action_space_size()
            )));
        }
        Ok(())
    }

    /// Action probabilities for a state
    pub fn probabilities(&self, state: &State) -> Result<Array1<f64>> {
        let s = self.features(state)?;
        let logits = self.policy_weight.dot(&s) + &self.policy_bias;
        let max = logits.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        let exp = logits.mapv(|v| (v - max).exp());
        let sum = exp.sum();
        Ok(exp / sum)
    }

    fn apply_tensor<D: ndarray::Dimension>(
        target: &mut ndarray::Array<f64, D>,
        name: &str,
        gradients: &Gradients,
        learning_rate: f64,
    ) -> Result<()> {
        let Some(gradient) = gradients.get(name) else {
            return Ok(());
        };
        if gradient.shape() != target.shape() {
            return Err(RlhfError::TrainingFailed(format!(
                "gradient {name}: shape {:?}, parameter {:?}",
                gradient.shape(),
                target.shape()
            )));
        }
        let gradient = gradient
            .view()
            .into_dimensionality::<D>()
            .map_err(|e| RlhfError::TrainingFailed(format!("gradient {name}: {e}")))?;
        target.scaled_add(-learning_rate, &gradient);
        Ok(())
    }
}

impl PolicyModel for SoftmaxPolicy {
    fn name(&self) -> &str {
        "softmax_policy"
    }

    fn input_dim(&self) -> usize {
        self.policy_weight.ncols()
    }

    fn action_space_size(&self) -> usize {
        self.policy_weight.nrows()
    }

    fn log_prob(&self, state: &State, action: Action) -> Result<f64> {
        self.check_action(action)?;
        let probs = self.probabilities(state)?;
        Ok(probs[action.index()].ln())
    }

    fn log_prob_grad(&self, state: &State, action: Action) -> Result<Gradients> {
        self.check_action(action)?;
        let s = self.features(state)?;
        let probs = self.probabilities(state)?;

        // d log softmax_a / d logits = onehot(a) - p
        let mut delta = -probs;
        delta[action.index()] += 1.0;

        let weight_grad = delta
            .view()
            .insert_axis(Axis(1))
            .dot(&s.insert_axis(Axis(0)));

        let mut gradients = Gradients::new();
        gradients.insert(POLICY_WEIGHT, weight_grad.into_dyn());
        gradients.insert(POLICY_BIAS, delta.into_dyn());
        Ok(gradients)
    }

    fn value(&self, state: &State) -> Result<f64> {
        let s = self.features(state)?;
        Ok(self.value_weight.dot(&s) + self.value_bias[0])
    }

    fn value_grad(&self, state: &State) -> Result<Gradients> {
        let s = self.features(state)?;
        let mut gradients = Gradients::new();
        gradients.insert(VALUE_WEIGHT, s.to_owned().into_dyn());
        gradients.insert(VALUE_BIAS, Array1::from_elem(1, 1.0).into_dyn());
        Ok(gradients)
    }

    fn apply_gradients(&mut self, gradients: &Gradients, learning_rate: f64) -> Result<()> {
        Self::apply_tensor(&mut self.policy_weight, POLICY_WEIGHT, gradients, learning_rate)?;
        Self::apply_tensor(&mut self.policy_bias, POLICY_BIAS, gradients, learning_rate)?;
        Self::apply_tensor(&mut self.value_weight, VALUE_WEIGHT, gradients, learning_rate)?;
        Self::apply_tensor(&mut self.value_bias, VALUE_BIAS, gradients, learning_rate)?;
        Ok(())
    }

    fn export_weights(&self) -> WeightSet {
        let entries = [
            (POLICY_WEIGHT, self.policy_weight.shape().to_vec(), self.policy_weight.iter().copied().collect()),
            (POLICY_BIAS, self.policy_bias.shape().to_vec(), self.policy_bias.to_vec()),
            (VALUE_WEIGHT, self.value_weight.shape().to_vec(), self.value_weight.to_vec()),
            (VALUE_BIAS, self.value_bias.shape().to_vec(), self.value_bias.to_vec()),
        ];

        let mut weights = WeightSet::new();
        for (name, shape, data) in entries {
            weights.tensors.push(Tensor {
                name: name.to_string(),
                shape,
                dtype: DType::F64,
                data,
            });
        }
        weights
    }

    fn import_weights(&mut self, weights: &WeightSet) -> Result<()> {
        let tensor = |name: &str, shape: &[usize]| -> Result<Vec<f64>> {
            let t = weights
                .get(name)
                .ok_or_else(|| RlhfError::Checkpoint(format!("missing tensor {name}")))?;
            if t.shape != shape {
                return Err(RlhfError::Checkpoint(format!(
                    "tensor {name}: shape {:?}, model expects {shape:?}",
                    t.shape
                )));
            }
            Ok(t.data.clone())
        };

        let (actions, inputs) = self.policy_weight.dim();
        let policy_weight = Array2::from_shape_vec((actions, inputs), tensor(POLICY_WEIGHT, &[actions, inputs])?)
            .map_err(|e| RlhfError::Checkpoint(e.to_string()))?;
        let policy_bias = Array1::from(tensor(POLICY_BIAS, &[actions])?);
        let value_weight = Array1::from(tensor(VALUE_WEIGHT, &[inputs])?);
        let value_bias = Array1::from(tensor(VALUE_BIAS, &[1])?);

        self.policy_weight = policy_weight;
        self.policy_bias = policy_bias;
        self.value_weight = value_weight;
        self.value_bias = value_bias;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn PolicyModel> {
        Box::new(self.clone())
    }
}
