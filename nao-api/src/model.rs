use crate::{algorithm::Algorithm, config::NaoConfig};
use anyhow::Result;
use candle_core::Device;
use nao_agents::{
    checkpoint::Checkpoint,
    ddpg::Ddpg,
    gail::{Gail, GailHooks},
    ppo::{EmptyPpoHooks, Ppo},
};
use nao_core::{
    agents::{Agent, LearnOutcome, LearningHooks, PretrainOptions, PretrainReport},
    env::EnvironmentDescription,
    error::ConfigError,
    expert::ExpertDataset,
    noise::OrnsteinUhlenbeckActionNoise,
    policy::PolicyNetwork,
    tensor::Buffer,
    vec_env::VecEnv,
};
use std::path::{Path, PathBuf};

/// Any trainable agent the algorithm table can produce.
pub enum Model {
    Ppo2(Ppo),
    Ddpg(Ddpg),
    Gail(Gail),
}

/// What an algorithm constructor gets to work with.
pub struct ModelInputs<'a> {
    pub env_description: &'a EnvironmentDescription,
    pub network: &'a PolicyNetwork,
    pub dataset: Option<ExpertDataset>,
    pub config: &'a NaoConfig,
    pub device: &'a Device,
}

fn exploration_noise(
    env_description: &EnvironmentDescription,
    config: &NaoConfig,
) -> OrnsteinUhlenbeckActionNoise {
    OrnsteinUhlenbeckActionNoise::isotropic(
        env_description.action_size(),
        config.ddpg.noise_sigma,
    )
}

pub fn build_ppo2(inputs: ModelInputs<'_>) -> Result<Model> {
    let agent = Ppo::new(
        inputs.env_description,
        inputs.network,
        inputs.config.ppo.clone(),
        inputs.device,
    )?;
    Ok(Model::Ppo2(agent))
}

pub fn build_ddpg(inputs: ModelInputs<'_>) -> Result<Model> {
    let noise = exploration_noise(inputs.env_description, inputs.config);
    let agent = Ddpg::new(
        inputs.env_description,
        inputs.network,
        inputs.config.ddpg.clone(),
        Some(noise),
        inputs.device,
    )?;
    Ok(Model::Ddpg(agent))
}

pub fn build_gail(inputs: ModelInputs<'_>) -> Result<Model> {
    let dataset = inputs
        .dataset
        .ok_or_else(|| ConfigError::MissingDataset(Algorithm::Gail.name().to_owned()))?;
    let hooks = GailHooks::new(
        inputs.env_description,
        dataset,
        inputs.config.gail.clone(),
        inputs.device,
    )?;
    let agent = Gail::with_hooks(
        inputs.env_description,
        inputs.network,
        inputs.config.ppo.clone(),
        inputs.device,
        hooks,
    )?;
    Ok(Model::Gail(agent))
}

impl Model {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Ppo2(_) => Algorithm::Ppo2,
            Self::Ddpg(_) => Algorithm::Ddpg,
            Self::Gail(_) => Algorithm::Gail,
        }
    }

    /// Restores a checkpoint written by `algorithm`. A GAIL checkpoint loaded without its dataset
    /// comes back as the bare PPO2 generator, which is all inference needs.
    pub fn load(
        algorithm: Algorithm,
        path: &Path,
        config: &NaoConfig,
        dataset: Option<ExpertDataset>,
        device: &Device,
    ) -> Result<Self> {
        let network = config.policy_network(algorithm);
        let model = match (algorithm, dataset) {
            (Algorithm::Ppo2, _) => Self::Ppo2(Ppo::load(
                path,
                &network,
                config.ppo.clone(),
                device,
                EmptyPpoHooks,
            )?),
            (Algorithm::Ddpg, _) => {
                let metadata = Checkpoint::metadata(path)?;
                let noise = exploration_noise(&metadata.env_description(), config);
                Self::Ddpg(Ddpg::load(
                    path,
                    &network,
                    config.ddpg.clone(),
                    Some(noise),
                    device,
                )?)
            }
            (Algorithm::Gail, Some(dataset)) => {
                let metadata = Checkpoint::metadata(path)?;
                let hooks = GailHooks::new(
                    &metadata.env_description(),
                    dataset,
                    config.gail.clone(),
                    device,
                )?;
                Self::Gail(Gail::load(path, &network, config.ppo.clone(), device, hooks)?)
            }
            (Algorithm::Gail, None) => {
                tracing::debug!("no expert dataset given, loading the GAIL generator only");
                Self::Ppo2(Ppo::load(
                    path,
                    &network,
                    config.ppo.clone(),
                    device,
                    EmptyPpoHooks,
                )?)
            }
        };
        tracing::info!(path = %path.display(), timesteps = model.num_timesteps(), "model loaded");
        Ok(model)
    }

    fn agent(&self) -> &dyn Agent {
        match self {
            Self::Ppo2(agent) => agent,
            Self::Ddpg(agent) => agent,
            Self::Gail(agent) => agent,
        }
    }

    fn agent_mut(&mut self) -> &mut dyn Agent {
        match self {
            Self::Ppo2(agent) => agent,
            Self::Ddpg(agent) => agent,
            Self::Gail(agent) => agent,
        }
    }
}

impl Agent for Model {
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: usize,
        hooks: &mut dyn LearningHooks,
    ) -> Result<LearnOutcome> {
        self.agent_mut().learn(env, total_timesteps, hooks)
    }

    fn predict(&self, observation: &Buffer, deterministic: bool) -> Result<Buffer> {
        self.agent().predict(observation, deterministic)
    }

    fn pretrain(
        &mut self,
        dataset: &ExpertDataset,
        options: &PretrainOptions,
    ) -> Result<PretrainReport> {
        self.agent_mut().pretrain(dataset, options)
    }

    fn save(&self, path: &Path) -> Result<PathBuf> {
        self.agent().save(path)
    }

    fn num_timesteps(&self) -> usize {
        self.agent().num_timesteps()
    }
}
