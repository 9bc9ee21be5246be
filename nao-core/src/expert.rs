use crate::{
    env::ExpertEnv,
    error::{ConfigError, DatasetError},
    rng::with_rng,
    tensor::Buffer,
    vec_env::SeededEnv,
};
use anyhow::{Context, Result};
use bincode::{Decode, Encode};
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const TRAJ_MAGIC: &[u8; 8] = b"NAOTRAJ1";

/// File extension of recorded demonstrations.
pub const TRAJ_EXTENSION: &str = "traj";

/// How many recorded episodes to keep. Serialized as an integer where `-1` means every episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TrajectoryLimit {
    #[default]
    All,
    Limit(usize),
}

impl TryFrom<i64> for TrajectoryLimit {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::All),
            n if n >= 0 => Ok(Self::Limit(n as usize)),
            n => Err(format!("trajectory limit must be -1 or non negative, got {n}")),
        }
    }
}

impl From<TrajectoryLimit> for i64 {
    fn from(value: TrajectoryLimit) -> Self {
        match value {
            TrajectoryLimit::All => -1,
            TrajectoryLimit::Limit(n) => n as i64,
        }
    }
}

/// Demonstrations as recorded from an expert controller. Every vector except `episode_returns`
/// is indexed by transition.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct ExpertTrajectories {
    pub observations: Vec<Buffer>,
    pub actions: Vec<Buffer>,
    pub rewards: Vec<f32>,
    pub episode_returns: Vec<f32>,
    pub episode_starts: Vec<bool>,
}

impl ExpertTrajectories {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn num_episodes(&self) -> usize {
        self.episode_starts.iter().filter(|s| **s).count()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut bytes = TRAJ_MAGIC.to_vec();
        bytes.extend(bincode::encode_to_vec(self, bincode::config::standard())?);
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(DatasetError::NotFound(path.to_owned()).into());
        }
        let bytes = fs::read(path)?;
        let malformed = |reason: String| DatasetError::Malformed {
            path: path.to_owned(),
            reason,
        };
        let payload = bytes
            .strip_prefix(TRAJ_MAGIC.as_slice())
            .ok_or_else(|| malformed("missing header".to_owned()))?;
        let (trajectories, _): (Self, _) =
            bincode::decode_from_slice(payload, bincode::config::standard())
                .map_err(|err| malformed(err.to_string()))?;
        let n = trajectories.actions.len();
        if trajectories.observations.len() != n
            || trajectories.rewards.len() != n
            || trajectories.episode_starts.len() != n
        {
            return Err(malformed("columns have different lengths".to_owned()).into());
        }
        Ok(trajectories)
    }

    /// Keeps the first `limit` episodes.
    pub fn truncate(&mut self, limit: TrajectoryLimit) {
        let TrajectoryLimit::Limit(limit) = limit else {
            return;
        };
        let cut = self
            .episode_starts
            .iter()
            .enumerate()
            .filter(|(_, start)| **start)
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(self.actions.len());
        self.observations.truncate(cut);
        self.actions.truncate(cut);
        self.rewards.truncate(cut);
        self.episode_starts.truncate(cut);
        self.episode_returns.truncate(limit);
    }
}

/// Plays `n_episodes` with the env's scripted controller and writes them to `path`.
pub fn generate_expert_traj<E: ExpertEnv>(
    env: &mut E,
    path: &Path,
    n_episodes: usize,
    seed: u64,
) -> Result<ExpertTrajectories> {
    let mut env = SeededEnv::new(env, seed);
    let mut trajectories = ExpertTrajectories::default();
    for episode in 0..n_episodes {
        let mut observation = env.reset()?;
        let mut episode_return = 0.;
        let mut start = true;
        loop {
            let action = env.env_mut().expert_action(&observation)?;
            let snapshot = env.env_mut().step(action.clone())?;
            trajectories.observations.push(observation);
            trajectories.actions.push(action);
            trajectories.rewards.push(snapshot.reward);
            trajectories.episode_starts.push(start);
            start = false;
            episode_return += snapshot.reward;
            if snapshot.done() {
                break;
            }
            observation = snapshot.state;
        }
        tracing::info!(episode, episode_return, "recorded expert episode");
        trajectories.episode_returns.push(episode_return);
    }
    trajectories.save(path)?;
    tracing::info!(
        path = %path.display(),
        transitions = trajectories.len(),
        "expert dataset written"
    );
    Ok(trajectories)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetOptions {
    pub traj_limit: TrajectoryLimit,
    /// Share of transitions used for training, the rest is held out for validation.
    pub train_fraction: f32,
    pub batch_size: usize,
    /// Shuffle the split and every epoch.
    pub randomize: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            traj_limit: TrajectoryLimit::All,
            train_fraction: 0.7,
            batch_size: 64,
            randomize: true,
        }
    }
}

impl DatasetOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::ensure_positive("dataset.batch_size", self.batch_size)?;
        if !(self.train_fraction > 0. && self.train_fraction <= 1.) {
            return Err(ConfigError::Invalid {
                field: "dataset.train_fraction",
                reason: format!("must be in (0, 1], got {}", self.train_fraction),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

#[derive(Debug, Clone)]
pub struct ExpertBatch {
    pub observations: Vec<Buffer>,
    pub actions: Vec<Buffer>,
}

/// Demonstrations prepared for supervised learning.
#[derive(Debug, Clone)]
pub struct ExpertDataset {
    path: PathBuf,
    trajectories: ExpertTrajectories,
    train_indices: Vec<usize>,
    val_indices: Vec<usize>,
    options: DatasetOptions,
}

impl ExpertDataset {
    pub fn load(path: &Path, options: DatasetOptions) -> Result<Self> {
        let trajectories = ExpertTrajectories::load(path)?;
        Self::from_trajectories(path.to_owned(), trajectories, options)
    }

    pub fn from_trajectories(
        path: PathBuf,
        mut trajectories: ExpertTrajectories,
        options: DatasetOptions,
    ) -> Result<Self> {
        trajectories.truncate(options.traj_limit);
        if trajectories.is_empty() {
            return Err(DatasetError::Empty(path).into());
        }
        let mut indices: Vec<usize> = (0..trajectories.len()).collect();
        if options.randomize {
            with_rng(|rng| indices.shuffle(rng));
        }
        let split = ((indices.len() as f32 * options.train_fraction.clamp(0., 1.)) as usize)
            .clamp(1, indices.len());
        let val_indices = indices.split_off(split);
        tracing::debug!(
            path = %path.display(),
            train = indices.len(),
            validation = val_indices.len(),
            "expert dataset loaded"
        );
        Ok(Self {
            path,
            trajectories,
            train_indices: indices,
            val_indices,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trajectories(&self) -> &ExpertTrajectories {
        &self.trajectories
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    pub fn len(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train_indices.len(),
            Split::Validation => self.val_indices.len(),
        }
    }

    pub fn observation_size(&self) -> usize {
        self.trajectories.observations[0].len()
    }

    pub fn action_size(&self) -> usize {
        self.trajectories.actions[0].len()
    }

    /// One pass over `split` in batches of the configured size.
    pub fn batches(&self, split: Split) -> Vec<ExpertBatch> {
        let mut indices = match split {
            Split::Train => self.train_indices.clone(),
            Split::Validation => self.val_indices.clone(),
        };
        if self.options.randomize {
            with_rng(|rng| indices.shuffle(rng));
        }
        indices
            .chunks(self.options.batch_size.max(1))
            .map(|chunk| ExpertBatch {
                observations: chunk
                    .iter()
                    .map(|i| self.trajectories.observations[*i].clone())
                    .collect(),
                actions: chunk
                    .iter()
                    .map(|i| self.trajectories.actions[*i].clone())
                    .collect(),
            })
            .collect()
    }

    /// Random training batch, used by adversarial imitation.
    pub fn sample(&self, batch_size: usize) -> ExpertBatch {
        let indices: Vec<usize> = with_rng(|rng| {
            self.train_indices
                .choose_multiple(rng, batch_size.min(self.train_indices.len()))
                .copied()
                .collect()
        });
        ExpertBatch {
            observations: indices
                .iter()
                .map(|i| self.trajectories.observations[*i].clone())
                .collect(),
            actions: indices
                .iter()
                .map(|i| self.trajectories.actions[*i].clone())
                .collect(),
        }
    }
}
