//! Configuration loading for the RLHF daemon

use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;

use rlhf_train::config::{BufferConfig, CheckpointConfig, FeedbackConfig, RewardConfig, TrainingConfig};
use rlhf_train::RlhfConfig;

/// Configuration for the daemon.
///
/// Pipeline sections sit at the top level so `RLHF__TRAINING__BATCH_SIZE=64`
/// overrides `[training] batch_size`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub model: ModelConfig,
    pub reward: RewardConfig,
    pub training: TrainingConfig,
    pub buffer: BufferConfig,
    pub feedback: FeedbackConfig,
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind_address: String,
    pub log_level: String,
    /// Empty for stdout only
    pub log_file: String,
    /// Base for relative checkpoint directories. Empty uses the platform data dir.
    pub data_dir: String,
    /// Load the newest checkpoint on startup
    pub restore_checkpoint: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9300".to_string(),
            log_level: "info".to_string(),
            log_file: String::new(),
            data_dir: String::new(),
            restore_checkpoint: true,
        }
    }
}

impl DaemonConfig {
    pub fn get_data_dir(&self) -> PathBuf {
        if !self.data_dir.is_empty() {
            return PathBuf::from(&self.data_dir);
        }
        dirs::data_local_dir()
            .map(|dir| dir.join("rlhf"))
            .unwrap_or_else(|| PathBuf::from(".rlhf"))
    }
}

/// Shape of the reference policy served by the daemon
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub action_space: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_dim: 16,
            action_space: 8,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file();

        let mut builder = ConfigBuilder::<config::builder::DefaultState>::default();

        if let Some(path) = &config_path {
            tracing::info!("Loading config from: {:?}", path);
            builder = builder.add_source(File::from(path.clone()).required(false));
        } else {
            tracing::info!("No config file found, using defaults");
        }

        builder = builder.add_source(
            Environment::with_prefix("RLHF")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.daemon
            .bind_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind_address: {}", self.daemon.bind_address))?;
        if self.model.input_dim == 0 || self.model.action_space == 0 {
            anyhow::bail!("model.input_dim and model.action_space must be at least 1");
        }
        self.rlhf().validate().context("Invalid pipeline configuration")?;
        Ok(())
    }

    /// Pipeline configuration handed to the service
    pub fn rlhf(&self) -> RlhfConfig {
        RlhfConfig {
            reward: self.reward.clone(),
            training: self.training.clone(),
            buffer: self.buffer.clone(),
            feedback: self.feedback.clone(),
            checkpoint: CheckpointConfig {
                checkpoint_dir: self.checkpoint_dir(),
                ..self.checkpoint.clone()
            },
        }
    }

    /// Checkpoint directory, resolved against the data dir when relative
    pub fn checkpoint_dir(&self) -> PathBuf {
        let dir = &self.checkpoint.checkpoint_dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.daemon.get_data_dir().join(dir)
        }
    }

    /// Find the configuration file
    fn find_config_file() -> Option<PathBuf> {
        // Check in order: RLHF_CONFIG env, ./rlhf.toml, ~/.config/rlhf/rlhf.toml
        if let Ok(path) = std::env::var("RLHF_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let local = PathBuf::from("rlhf.toml");
        if local.exists() {
            return Some(local);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config").join("rlhf").join("rlhf.toml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }
}
