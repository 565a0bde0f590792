//! State, Action, and Reward types for policy training

use serde::{Deserialize, Serialize};

/// Scalar reward derived from officer feedback
pub type Reward = f64;

/// Feature vector the prediction model conditioned on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub features: Vec<f64>,
}

impl State {
    pub fn new(features: Vec<f64>) -> Self {
        Self { features }
    }

    pub fn to_features(&self) -> &[f64] {
        &self.features
    }

    /// State dimension for the policy input layer
    pub fn dimension(&self) -> usize {
        self.features.len()
    }

    pub fn is_finite(&self) -> bool {
        self.features.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f64>> for State {
    fn from(features: Vec<f64>) -> Self {
        Self::new(features)
    }
}

/// Discrete decision emitted by the model (e.g. the index of the predicted hotspot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(pub usize);

impl Action {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What the model saw and what it decided for one prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionContext {
    pub state: State,
    pub action: Action,
    /// Model version that served the prediction, if known
    #[serde(default)]
    pub model_version: Option<String>,
}

impl PredictionContext {
    pub fn new(state: State, action: Action) -> Self {
        Self {
            state,
            action,
            model_version: None,
        }
    }
}
