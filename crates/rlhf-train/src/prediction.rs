//! Lookup of the (state, action) a prediction was made with

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use rlhf_core::Result;

use crate::state::PredictionContext;

/// Resolves prediction ids to the model input and decision they came from
#[async_trait]
pub trait PredictionRepository: Send + Sync {
    async fn context(&self, prediction_id: &str) -> Result<Option<PredictionContext>>;

    async fn register(&self, prediction_id: String, context: PredictionContext) -> Result<()>;
}

/// Process-local repository, used when no external store is wired in
#[derive(Debug, Default)]
pub struct InMemoryPredictionRepository {
    contexts: RwLock<HashMap<String, PredictionContext>>,
}

impl InMemoryPredictionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }
}

#[async_trait]
impl PredictionRepository for InMemoryPredictionRepository {
    async fn context(&self, prediction_id: &str) -> Result<Option<PredictionContext>> {
        Ok(self.contexts.read().await.get(prediction_id).cloned())
    }

    async fn register(&self, prediction_id: String, context: PredictionContext) -> Result<()> {
        self.contexts.write().await.insert(prediction_id, context);
        Ok(())
    }
}
