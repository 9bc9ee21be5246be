use crate::{
    checkpoint::{Checkpoint, CheckpointMetadata, save_checkpoint},
    optimizer::OptimizerWithMaxGrad,
    ppo::behaviour_cloning,
    tensors::{buffer_to_tensor, stack_buffers, tensor_to_buffer},
    thread_safe_sequential::{ThreadSafeSequential, build_mlp, build_tanh_mlp},
};
use anyhow::{Context, Result, anyhow, bail, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder, VarMap};
use nao_core::{
    agents::{Agent, LearnOutcome, LearningHooks, PretrainOptions, PretrainReport, RolloutStats},
    env::{EnvironmentDescription, Memory, Space},
    error::ConfigError,
    expert::ExpertDataset,
    noise::OrnsteinUhlenbeckActionNoise,
    policy::PolicyNetwork,
    sampler::{EpisodeTracker, mean},
    tensor::Buffer,
    utils::replay_buffer::ReplayBuffer,
    vec_env::VecEnv,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DDPG: &str = "DDPG";

const ACTOR: &str = "actor";
const CRITIC: &str = "critic";
const TARGET_ACTOR: &str = "target_actor";
const TARGET_CRITIC: &str = "target_critic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdpgParams {
    pub gamma: f32,
    /// Polyak coefficient of the target networks.
    pub tau: f32,
    pub batch_size: usize,
    pub buffer_size: usize,
    /// Environment steps between two training phases.
    pub nb_rollout_steps: usize,
    /// Gradient steps per training phase.
    pub nb_train_steps: usize,
    pub actor_lr: f64,
    pub critic_lr: f64,
    pub max_grad_norm: Option<f32>,
    /// Standard deviation of the Ornstein Uhlenbeck exploration noise.
    pub noise_sigma: f32,
}

impl Default for DdpgParams {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            tau: 0.001,
            batch_size: 128,
            buffer_size: 50_000,
            nb_rollout_steps: 100,
            nb_train_steps: 50,
            actor_lr: 1e-4,
            critic_lr: 1e-3,
            max_grad_norm: None,
            noise_sigma: 0.5,
        }
    }
}

impl DdpgParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::ensure_positive("ddpg.nb_rollout_steps", self.nb_rollout_steps)?;
        ConfigError::ensure_positive("ddpg.batch_size", self.batch_size)?;
        ConfigError::ensure_positive("ddpg.buffer_size", self.buffer_size)
    }
}

/// `target = tau * source + (1 - tau) * target` for every variable the two maps share.
pub fn soft_update(target: &VarMap, source: &VarMap, tau: f32) -> Result<()> {
    let source = source
        .data()
        .lock()
        .map_err(|_| anyhow!("source variables are poisoned"))?;
    let target = target
        .data()
        .lock()
        .map_err(|_| anyhow!("target variables are poisoned"))?;
    let tau = tau as f64;
    for (name, var) in target.iter() {
        let src = source
            .get(name)
            .with_context(|| format!("variable {name} missing from the online network"))?;
        let updated = (src.as_tensor().affine(tau, 0.)? + var.as_tensor().affine(1. - tau, 0.)?)?;
        var.set(&updated)?;
    }
    Ok(())
}

/// Maps the actor's `[-1, 1]` output onto the environment's action bounds.
#[derive(Debug, Clone)]
struct ActionScaler {
    low: Tensor,
    high: Tensor,
}

impl ActionScaler {
    fn new(action_space: &Space, device: &Device) -> Result<Option<Self>> {
        let Some((low, high)) = action_space.bounds() else {
            return Ok(None);
        };
        Ok(Some(Self {
            low: buffer_to_tensor(low, device)?,
            high: buffer_to_tensor(high, device)?,
        }))
    }

    fn scale(&self, actions: &Tensor) -> Result<Tensor> {
        let half_range = (&self.high - &self.low)?.affine(0.5, 0.)?;
        let shifted = actions.affine(1., 1.)?;
        Ok(shifted.broadcast_mul(&half_range)?.broadcast_add(&self.low)?)
    }
}

pub struct Ddpg {
    actor: ThreadSafeSequential,
    critic: ThreadSafeSequential,
    target_actor: ThreadSafeSequential,
    target_critic: ThreadSafeSequential,
    actor_optimizer: OptimizerWithMaxGrad,
    critic_optimizer: OptimizerWithMaxGrad,
    target_actor_vars: VarMap,
    target_critic_vars: VarMap,
    scaler: Option<ActionScaler>,
    noise: Option<OrnsteinUhlenbeckActionNoise>,
    replay: ReplayBuffer,
    pub params: DdpgParams,
    network: PolicyNetwork,
    env_description: EnvironmentDescription,
    device: Device,
    num_timesteps: usize,
    observation: Option<Buffer>,
    tracker: EpisodeTracker,
    cycle: usize,
}

impl Ddpg {
    pub fn new(
        env_description: &EnvironmentDescription,
        network: &PolicyNetwork,
        params: DdpgParams,
        noise: Option<OrnsteinUhlenbeckActionNoise>,
        device: &Device,
    ) -> Result<Self> {
        network.validate()?;
        if let Space::Discrete(_) = env_description.action_space {
            bail!("DDPG only supports continuous action spaces");
        }
        let observation_size = env_description.observation_size();
        let action_size = env_description.action_size();
        let hidden = &network.hidden_layers;

        let build_actor = |varmap: &VarMap| {
            let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
            build_tanh_mlp(observation_size, hidden, action_size, &vb, ACTOR)
        };
        let build_critic = |varmap: &VarMap| {
            let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
            build_mlp(observation_size + action_size, hidden, 1, &vb, CRITIC)
        };

        let actor_vars = VarMap::new();
        let critic_vars = VarMap::new();
        let target_actor_vars = VarMap::new();
        let target_critic_vars = VarMap::new();
        let actor = build_actor(&actor_vars)?;
        let critic = build_critic(&critic_vars)?;
        let target_actor = build_actor(&target_actor_vars)?;
        let target_critic = build_critic(&target_critic_vars)?;
        soft_update(&target_actor_vars, &actor_vars, 1.)?;
        soft_update(&target_critic_vars, &critic_vars, 1.)?;

        Ok(Self {
            actor,
            critic,
            target_actor,
            target_critic,
            actor_optimizer: OptimizerWithMaxGrad::adam(
                actor_vars,
                params.actor_lr,
                params.max_grad_norm,
            )?,
            critic_optimizer: OptimizerWithMaxGrad::adam(
                critic_vars,
                params.critic_lr,
                params.max_grad_norm,
            )?,
            target_actor_vars,
            target_critic_vars,
            scaler: ActionScaler::new(&env_description.action_space, device)?,
            noise,
            replay: ReplayBuffer::new(params.buffer_size),
            params,
            network: network.clone(),
            env_description: env_description.clone(),
            device: device.clone(),
            num_timesteps: 0,
            observation: None,
            tracker: EpisodeTracker::new(1),
            cycle: 0,
        })
    }

    pub fn load(
        path: &Path,
        network: &PolicyNetwork,
        params: DdpgParams,
        noise: Option<OrnsteinUhlenbeckActionNoise>,
        device: &Device,
    ) -> Result<Self> {
        let checkpoint = Checkpoint::read(path, device)?;
        checkpoint.metadata.expect_algorithm(&[DDPG])?;
        let env_description = checkpoint.metadata.env_description();
        let mut agent = Self::new(&env_description, network, params, noise, device)?;
        checkpoint.restore(ACTOR, &agent.actor_optimizer.varmap)?;
        checkpoint.restore(CRITIC, &agent.critic_optimizer.varmap)?;
        if checkpoint.has_group(TARGET_ACTOR) && checkpoint.has_group(TARGET_CRITIC) {
            checkpoint.restore(TARGET_ACTOR, &agent.target_actor_vars)?;
            checkpoint.restore(TARGET_CRITIC, &agent.target_critic_vars)?;
        } else {
            agent.sync_targets()?;
        }
        agent.num_timesteps = checkpoint.metadata.timesteps;
        Ok(agent)
    }

    pub fn noise(&self) -> Option<&OrnsteinUhlenbeckActionNoise> {
        self.noise.as_ref()
    }

    fn sync_targets(&self) -> Result<()> {
        soft_update(&self.target_actor_vars, &self.actor_optimizer.varmap, 1.)?;
        soft_update(&self.target_critic_vars, &self.critic_optimizer.varmap, 1.)
    }

    fn scale(&self, actions: &Tensor) -> Result<Tensor> {
        match &self.scaler {
            Some(scaler) => scaler.scale(actions),
            None => Ok(actions.clone()),
        }
    }

    fn q_value(
        critic: &ThreadSafeSequential,
        observations: &Tensor,
        actions: &Tensor,
    ) -> Result<Tensor> {
        let input = Tensor::cat(&[observations, actions], 1)?;
        Ok(critic.forward(&input)?.squeeze(1)?)
    }

    /// Actor output plus exploration noise, in `[-1, 1]`.
    fn explore(&mut self, observation: &Buffer) -> Result<Buffer> {
        let observation = buffer_to_tensor(observation, &self.device)?.unsqueeze(0)?;
        let action = tensor_to_buffer(&self.actor.forward(&observation)?)?;
        let action = match self.noise.as_mut() {
            Some(noise) => {
                let noise = noise.sample();
                Buffer::from_vec(
                    action
                        .data
                        .iter()
                        .zip(noise.data.iter())
                        .map(|(a, n)| (a + n).clamp(-1., 1.))
                        .collect(),
                )
            }
            None => action,
        };
        Ok(action)
    }

    fn train_step(&mut self) -> Result<(f32, f32)> {
        let batch = self.replay.sample(self.params.batch_size);
        let n = batch.len();
        let states: Vec<Buffer> = batch.iter().map(|m| m.state.clone()).collect();
        let next_states: Vec<Buffer> = batch.iter().map(|m| m.next_state.clone()).collect();
        let actions: Vec<Buffer> = batch.iter().map(|m| m.action.clone()).collect();
        let rewards: Vec<f32> = batch.iter().map(|m| m.reward).collect();
        let not_done: Vec<f32> = batch
            .iter()
            .map(|m| if m.terminated { 0. } else { 1. })
            .collect();

        let states = stack_buffers(&states, &self.device)?;
        let next_states = stack_buffers(&next_states, &self.device)?;
        let actions = stack_buffers(&actions, &self.device)?;
        let rewards = Tensor::from_vec(rewards, n, &self.device)?;
        let not_done = Tensor::from_vec(not_done, n, &self.device)?;

        let next_actions = self.target_actor.forward(&next_states)?;
        let next_q = Self::q_value(&self.target_critic, &next_states, &next_actions)?;
        let target_q = (rewards
            + not_done
                .mul(&next_q)?
                .affine(self.params.gamma as f64, 0.)?)?
        .detach();

        let q = Self::q_value(&self.critic, &states, &actions)?;
        let critic_loss = q.sub(&target_q)?.sqr()?.mean_all()?;
        self.critic_optimizer.backward_step(&critic_loss)?;

        let policy_actions = self.actor.forward(&states)?;
        let actor_loss = Self::q_value(&self.critic, &states, &policy_actions)?
            .mean_all()?
            .neg()?;
        self.actor_optimizer.backward_step(&actor_loss)?;

        soft_update(
            &self.target_actor_vars,
            &self.actor_optimizer.varmap,
            self.params.tau,
        )?;
        soft_update(
            &self.target_critic_vars,
            &self.critic_optimizer.varmap,
            self.params.tau,
        )?;
        Ok((
            actor_loss.to_scalar::<f32>()?,
            critic_loss.to_scalar::<f32>()?,
        ))
    }
}

impl Agent for Ddpg {
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: usize,
        hooks: &mut dyn LearningHooks,
    ) -> Result<LearnOutcome> {
        self.params.validate()?;
        ensure!(
            env.num_envs() == 1,
            "DDPG trains on a single environment, got {}",
            env.num_envs()
        );
        let description = env.env_description();
        ensure!(
            description.observation_size() == self.env_description.observation_size()
                && description.action_size() == self.env_description.action_size(),
            "environment does not match the network"
        );
        let mut steps_done = 0;
        while steps_done < total_timesteps {
            let mut total_reward = 0.;
            for _ in 0..self.params.nb_rollout_steps {
                if hooks.should_stop() {
                    return Ok(LearnOutcome::Interrupted);
                }
                let observation = match self.observation.take() {
                    Some(observation) => observation,
                    None => env
                        .reset()?
                        .into_iter()
                        .next()
                        .context("environment returned no observation")?,
                };
                let action = self.explore(&observation)?;
                let env_action = {
                    let action = buffer_to_tensor(&action, &self.device)?;
                    tensor_to_buffer(&self.scale(&action)?)?
                };
                let transition = env
                    .step(vec![env_action])?
                    .into_iter()
                    .next()
                    .context("environment returned no transition")?;
                let done = transition.done();
                let next_state = transition
                    .terminal_state
                    .clone()
                    .unwrap_or_else(|| transition.state.clone());
                self.replay.push(Memory {
                    state: observation,
                    next_state,
                    action,
                    reward: transition.reward,
                    terminated: transition.terminated,
                });
                self.tracker.record(0, transition.reward, done);
                if done {
                    if let Some(noise) = self.noise.as_mut() {
                        noise.reset();
                    }
                }
                self.observation = Some(transition.state);
                total_reward += transition.reward;
                steps_done += 1;
                self.num_timesteps += 1;
                if steps_done >= total_timesteps {
                    break;
                }
            }

            let mut losses = vec![];
            if self.replay.len() >= self.params.batch_size {
                for _ in 0..self.params.nb_train_steps {
                    losses.push(self.train_step()?);
                }
            }
            let finished = self.tracker.drain();
            let stats = RolloutStats {
                rollout: self.cycle,
                timesteps: self.num_timesteps,
                episodes: finished.len(),
                mean_episode_reward: mean(&finished),
                total_reward,
                losses: vec![
                    ("actor_loss", mean(&losses.iter().map(|l| l.0).collect::<Vec<_>>()).unwrap_or(0.)),
                    ("critic_loss", mean(&losses.iter().map(|l| l.1).collect::<Vec<_>>()).unwrap_or(0.)),
                ],
            };
            self.cycle += 1;
            if hooks.on_rollout_end(&stats)? {
                break;
            }
        }
        Ok(LearnOutcome::Completed)
    }

    /// The actor is deterministic, exploration noise is only added while learning.
    fn predict(&self, observation: &Buffer, _deterministic: bool) -> Result<Buffer> {
        let observation = buffer_to_tensor(observation, &self.device)?.unsqueeze(0)?;
        let action = self.actor.forward(&observation)?;
        tensor_to_buffer(&self.scale(&action)?)
    }

    fn pretrain(
        &mut self,
        dataset: &ExpertDataset,
        options: &PretrainOptions,
    ) -> Result<PretrainReport> {
        let report = {
            let actor = &self.actor;
            let scaler = self.scaler.as_ref();
            behaviour_cloning(
                dataset,
                options,
                &self.env_description,
                self.actor_optimizer.varmap.clone(),
                &self.device,
                |observations| {
                    let actions = actor.forward(observations)?;
                    match scaler {
                        Some(scaler) => scaler.scale(&actions),
                        None => Ok(actions),
                    }
                },
            )?
        };
        self.sync_targets()?;
        Ok(report)
    }

    fn save(&self, path: &Path) -> Result<PathBuf> {
        let metadata = CheckpointMetadata::new(
            DDPG,
            &self.env_description,
            &self.network.hidden_layers,
            self.num_timesteps,
        );
        save_checkpoint(
            path,
            &[
                (ACTOR, &self.actor_optimizer.varmap),
                (CRITIC, &self.critic_optimizer.varmap),
                (TARGET_ACTOR, &self.target_actor_vars),
                (TARGET_CRITIC, &self.target_critic_vars),
            ],
            &metadata,
        )
    }

    fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }
}

#[cfg(test)]
mod test {
    use super::{ActionScaler, soft_update};
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder, VarMap};
    use nao_core::env::Space;

    #[test]
    fn soft_update_interpolates() {
        let online = VarMap::new();
        let target = VarMap::new();
        let device = Device::Cpu;
        VarBuilder::from_varmap(&online, DType::F32, &device)
            .get_with_hints(2, "w", Init::Const(1.))
            .unwrap();
        let target_w = VarBuilder::from_varmap(&target, DType::F32, &device)
            .get_with_hints(2, "w", Init::Const(0.))
            .unwrap();
        soft_update(&target, &online, 0.25).unwrap();
        let values: Vec<f32> = target_w.to_vec1().unwrap();
        assert_relative_eq!(values[0], 0.25);
        soft_update(&target, &online, 1.).unwrap();
        let values: Vec<f32> = target_w.to_vec1().unwrap();
        assert_relative_eq!(values[1], 1.);
    }

    #[test]
    fn scaling_maps_unit_interval_to_bounds() {
        let space = Space::bounded(vec![-2., 0.], vec![2., 10.]);
        let scaler = ActionScaler::new(&space, &Device::Cpu).unwrap().unwrap();
        let unit = Tensor::new(&[[-1f32, 1.], [0., 0.]], &Device::Cpu).unwrap();
        let scaled = scaler.scale(&unit).unwrap();
        assert_eq!(
            scaled.to_vec2::<f32>().unwrap(),
            vec![vec![-2., 10.], vec![0., 5.]]
        );
    }
}
