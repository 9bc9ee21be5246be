use crate::{
    cancel::CancellationToken, expert::ExpertDataset, tensor::Buffer, vec_env::VecEnv,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// The requested number of timesteps was reached, or a hook asked to stop.
    Completed,
    /// The cancellation flag was raised while collecting experience.
    Interrupted,
}

/// Summary handed to [`LearningHooks`] after every rollout and its update.
#[derive(Debug, Clone, Default)]
pub struct RolloutStats {
    pub rollout: usize,
    /// Environment steps taken by this agent since it was built or loaded.
    pub timesteps: usize,
    /// Episodes that finished during this rollout.
    pub episodes: usize,
    pub mean_episode_reward: Option<f32>,
    pub total_reward: f32,
    pub losses: Vec<(&'static str, f32)>,
}

pub trait LearningHooks {
    /// Called after each rollout has been learned from. Returning `true` stops learning.
    fn on_rollout_end(&mut self, stats: &RolloutStats) -> Result<bool>;

    /// Polled between environment steps.
    fn should_stop(&self) -> bool;
}

/// Hooks that never stop learning early.
#[derive(Debug, Default)]
pub struct NoHooks;

impl LearningHooks for NoHooks {
    fn on_rollout_end(&mut self, _stats: &RolloutStats) -> Result<bool> {
        Ok(false)
    }

    fn should_stop(&self) -> bool {
        false
    }
}

impl LearningHooks for CancellationToken {
    fn on_rollout_end(&mut self, _stats: &RolloutStats) -> Result<bool> {
        Ok(false)
    }

    fn should_stop(&self) -> bool {
        self.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainOptions {
    pub n_epochs: usize,
    pub learning_rate: f64,
    /// Report validation loss every `val_interval` epochs.
    pub val_interval: usize,
}

impl Default for PretrainOptions {
    fn default() -> Self {
        Self {
            n_epochs: 1000,
            learning_rate: 1e-4,
            val_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PretrainReport {
    pub epochs: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
}

pub trait Agent {
    /// Collects experience from `env` and updates the agent until `total_timesteps` more steps
    /// were taken, a hook stops it, or it is cancelled.
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: usize,
        hooks: &mut dyn LearningHooks,
    ) -> Result<LearnOutcome>;

    fn predict(&self, observation: &Buffer, deterministic: bool) -> Result<Buffer>;

    /// Behaviour cloning on expert demonstrations.
    fn pretrain(
        &mut self,
        dataset: &ExpertDataset,
        options: &PretrainOptions,
    ) -> Result<PretrainReport>;

    /// Writes a checkpoint and returns the path of the file written.
    fn save(&self, path: &Path) -> Result<PathBuf>;

    fn num_timesteps(&self) -> usize;
}
