//! Run configuration. Every knob of a training run lives here as data so the different
//! generations of the Nao setup are presets of one type, loadable from TOML.

use crate::algorithm::Algorithm;
use anyhow::Result;
use candle_core::Device;
use nao_agents::{ddpg::DdpgParams, gail::GailParams, ppo::PpoParams};
use nao_core::{
    agents::PretrainOptions,
    error::ConfigError,
    expert::{DatasetOptions, TrajectoryLimit},
    policy::PolicyNetwork,
    vec_env::VecEnvKind,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TrainingSchedule {
    /// One `learn` call over the whole budget.
    Single,
    /// Learn `increment` steps at a time, saving after each chunk and reloading the previous
    /// checkpoint before the next one.
    Incremental { increment: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub models: PathBuf,
    pub pretrain: PathBuf,
    pub logs: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            models: PathBuf::from("models/models_nao"),
            pretrain: PathBuf::from("pretrain/pretrain_nao"),
            logs: PathBuf::from("logs/nao_env"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectOptions {
    pub n_episodes: usize,
    pub gui: bool,
    pub seed: u64,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            n_episodes: 1,
            gui: true,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VisualizeOptions {
    /// Play the policy mean instead of sampling.
    pub deterministic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NaoConfig {
    pub agent: Algorithm,
    pub env_id: String,
    /// Environment with a scripted controller, used to record demonstrations.
    pub expert_env_id: String,
    /// Dataset under `paths.pretrain` that adversarial imitation learns from.
    pub expert_dataset: Option<String>,
    pub paths: Paths,
    pub schedule: TrainingSchedule,
    pub num_env: usize,
    pub vec_env: VecEnvKind,
    /// Worker binary of the subprocess pool, defaults to the one next to the executable.
    pub worker: Option<PathBuf>,
    /// Open the simulator window while training.
    pub gui: bool,
    pub seed: u64,
    pub cuda: bool,
    /// 0 warnings only, 1 progress, 2 and above debug output.
    pub verbose: u8,
    /// Hidden layers per algorithm name, replacing the built in table.
    pub networks: BTreeMap<String, PolicyNetwork>,
    pub ppo: PpoParams,
    pub ddpg: DdpgParams,
    pub gail: GailParams,
    pub pretrain: PretrainOptions,
    pub dataset: DatasetOptions,
    pub collect: CollectOptions,
    pub visualize: VisualizeOptions,
}

impl Default for NaoConfig {
    fn default() -> Self {
        Self {
            agent: Algorithm::Ppo2,
            env_id: "NaoEnv".to_owned(),
            expert_env_id: "NaoEnvPretrained".to_owned(),
            expert_dataset: None,
            paths: Paths::default(),
            schedule: TrainingSchedule::Single,
            num_env: 4,
            vec_env: VecEnvKind::Subproc,
            worker: None,
            gui: false,
            seed: 0,
            cuda: false,
            verbose: 1,
            networks: BTreeMap::new(),
            ppo: PpoParams {
                n_steps: 2048,
                ..Default::default()
            },
            ddpg: DdpgParams::default(),
            gail: GailParams::default(),
            pretrain: PretrainOptions::default(),
            dataset: DatasetOptions::default(),
            collect: CollectOptions::default(),
            visualize: VisualizeOptions::default(),
        }
    }
}

impl NaoConfig {
    /// The first generation: one gui environment, million step chunks with reloads in between,
    /// long PPO2 rollouts and a single demonstration for pretraining.
    pub fn legacy() -> Self {
        Self {
            schedule: TrainingSchedule::Incremental {
                increment: 1_000_000,
            },
            num_env: 1,
            vec_env: VecEnvKind::Dummy,
            gui: true,
            verbose: 2,
            ppo: PpoParams {
                n_steps: 4096,
                ..Default::default()
            },
            dataset: DatasetOptions {
                traj_limit: TrajectoryLimit::Limit(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_env == 0 {
            return Err(ConfigError::Invalid {
                field: "num_env",
                reason: "at least one environment is needed".to_owned(),
            });
        }
        if let TrainingSchedule::Incremental { increment: 0 } = self.schedule {
            return Err(ConfigError::Invalid {
                field: "schedule.increment",
                reason: "increment must be positive".to_owned(),
            });
        }
        for (name, network) in &self.networks {
            name.parse::<Algorithm>()?;
            network.validate()?;
        }
        self.ppo.validate()?;
        self.ddpg.validate()?;
        self.gail.validate()?;
        self.dataset.validate()?;
        ConfigError::ensure_positive("collect.n_episodes", self.collect.n_episodes)
    }

    /// The configured override for `algorithm`, or its entry in the algorithm table.
    pub fn policy_network(&self, algorithm: Algorithm) -> PolicyNetwork {
        self.networks
            .iter()
            .find(|(name, _)| name.parse::<Algorithm>().ok() == Some(algorithm))
            .map(|(_, network)| network.clone())
            .unwrap_or_else(|| algorithm.policy_network())
    }

    pub fn device(&self) -> Result<Device> {
        if self.cuda {
            Ok(Device::cuda_if_available(0)?)
        } else {
            Ok(Device::Cpu)
        }
    }

    /// Default log filter for the configured verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

#[cfg(test)]
mod test {
    use super::{NaoConfig, TrainingSchedule};
    use crate::algorithm::Algorithm;
    use nao_core::{error::ConfigError, expert::TrajectoryLimit, vec_env::VecEnvKind};

    #[test]
    fn reads_partial_toml() {
        let config = NaoConfig::from_toml(
            r#"
            agent = "DDPG"
            num_env = 2
            vec_env = "dummy"

            [schedule]
            kind = "incremental"
            increment = 500

            [dataset]
            traj_limit = -1
            batch_size = 32

            [networks.PPO2]
            hidden_layers = [64, 64]
            "#,
        )
        .unwrap();
        assert_eq!(config.agent, Algorithm::Ddpg);
        assert_eq!(config.vec_env, VecEnvKind::Dummy);
        assert_eq!(
            config.schedule,
            TrainingSchedule::Incremental { increment: 500 }
        );
        assert_eq!(config.dataset.traj_limit, TrajectoryLimit::All);
        assert_eq!(config.dataset.batch_size, 32);
        assert_eq!(config.policy_network(Algorithm::Ppo2).hidden_layers, [64, 64]);
        assert_eq!(config.policy_network(Algorithm::Ddpg).hidden_layers, [1024, 512]);
        assert_eq!(config.ddpg.noise_sigma, 0.5);
    }

    #[test]
    fn rejects_bad_values() {
        let err = NaoConfig::from_toml("agent = \"TRPO\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let err = NaoConfig::from_toml("num_env = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "num_env", .. }));
        let err = NaoConfig::from_toml("[networks.A2C]\nhidden_layers = [8]").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAlgorithm(name) if name == "A2C"));
        let err = NaoConfig::from_toml("[networks.DDPG]\nhidden_layers = []").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyNetwork));
        let err = NaoConfig::from_toml("[ppo]\nn_steps = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "ppo.n_steps", .. }));
        let err = NaoConfig::from_toml("[ddpg]\nnb_rollout_steps = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "ddpg.nb_rollout_steps", .. }));
        let err = NaoConfig::from_toml("[ddpg]\nbatch_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "ddpg.batch_size", .. }));
        let err = NaoConfig::from_toml("[dataset]\nbatch_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "dataset.batch_size", .. }));
    }

    #[test]
    fn legacy_preset_trains_in_million_step_chunks() {
        let legacy = NaoConfig::legacy();
        assert_eq!(
            legacy.schedule,
            TrainingSchedule::Incremental {
                increment: 1_000_000
            }
        );
        assert_eq!(legacy.num_env, 1);
        assert_eq!(legacy.ppo.n_steps, 4096);
        assert_eq!(legacy.dataset.traj_limit, TrajectoryLimit::Limit(1));
        assert_eq!(NaoConfig::default().schedule, TrainingSchedule::Single);
    }
}
