use crate::{
    checkpoint::{Checkpoint, CheckpointMetadata, save_checkpoint},
    distributions::DiagGaussianDistribution,
    optimizer::OptimizerWithMaxGrad,
    tensors::{
        Logp, LogpDiff, PolicyLoss, ValueLoss, ValuesPred, buffer_to_tensor, stack_buffers,
        tensor_to_buffer, tensor_to_buffers,
    },
    thread_safe_sequential::{ThreadSafeSequential, build_mlp},
};
use anyhow::{Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder, VarMap};
use nao_core::{
    agents::{Agent, LearnOutcome, LearningHooks, PretrainOptions, PretrainReport, RolloutStats},
    env::{EnvironmentDescription, Space},
    error::ConfigError,
    expert::{ExpertDataset, Split},
    policy::PolicyNetwork,
    sampler::{Collected, StepBoundSampler, mean},
    tensor::Buffer,
    utils::rollout_buffer::{Advantages, Returns, RolloutBatch, RolloutBatchIterator, RolloutBuffer},
    vec_env::VecEnv,
};
use serde::{Deserialize, Serialize};
use std::{
    ops::Deref,
    path::{Path, PathBuf},
};

pub const PPO2: &str = "PPO2";

/// Algorithms whose checkpoints hold a PPO actor critic.
pub const PPO_FAMILY: [&str; 2] = [PPO2, crate::gail::GAIL];

const GROUP: &str = "ppo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoParams {
    /// Steps per worker and rollout.
    pub n_steps: usize,
    pub gamma: f32,
    pub lambda: f32,
    pub clip_range: f32,
    pub ent_coef: f32,
    pub vf_coef: f32,
    pub learning_rate: f64,
    pub max_grad_norm: Option<f32>,
    pub n_epochs: usize,
    /// Every rollout is split into this many minibatches.
    pub n_minibatches: usize,
}

impl Default for PpoParams {
    fn default() -> Self {
        Self {
            n_steps: 128,
            gamma: 0.99,
            lambda: 0.95,
            clip_range: 0.2,
            ent_coef: 0.01,
            vf_coef: 0.5,
            learning_rate: 2.5e-4,
            max_grad_norm: Some(0.5),
            n_epochs: 4,
            n_minibatches: 4,
        }
    }
}

impl PpoParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::ensure_positive("ppo.n_steps", self.n_steps)?;
        ConfigError::ensure_positive("ppo.n_minibatches", self.n_minibatches)
    }
}

pub enum HookResult {
    Continue,
    Break,
}

pub struct PpoBatchData {
    pub logp: Logp,
    pub values_pred: ValuesPred,
    pub logp_diff: LogpDiff,
    pub ratio: Tensor,
}

/// Extension points of the PPO update. Adversarial imitation plugs in here.
pub trait PpoHooks {
    /// Name written into checkpoints.
    fn algorithm(&self) -> &'static str {
        PPO2
    }

    /// Runs on fresh rollouts before advantages are computed. May rewrite rewards.
    fn before_learning_hook(
        &mut self,
        _core: &mut PpoCore,
        _rollouts: &mut [RolloutBuffer],
    ) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    fn batch_hook(
        &mut self,
        _core: &mut PpoCore,
        _batch: &RolloutBatch,
        _policy_loss: &mut PolicyLoss,
        _value_loss: &mut ValueLoss,
        _data: &PpoBatchData,
    ) -> Result<HookResult> {
        Ok(HookResult::Continue)
    }

    /// Extra numbers reported with every rollout.
    fn losses(&self) -> Vec<(&'static str, f32)> {
        vec![]
    }

    /// Extra variables stored in checkpoints.
    fn checkpoint_groups(&self) -> Vec<(&'static str, &VarMap)> {
        vec![]
    }
}

pub struct EmptyPpoHooks;

impl PpoHooks for EmptyPpoHooks {}

pub struct PpoCore {
    pub distribution: DiagGaussianDistribution,
    pub value_net: ThreadSafeSequential,
    pub optimizer: OptimizerWithMaxGrad,
    pub params: PpoParams,
    pub network: PolicyNetwork,
    pub env_description: EnvironmentDescription,
    pub device: Device,
    pub num_timesteps: usize,
}

impl PpoCore {
    pub fn build(
        env_description: &EnvironmentDescription,
        network: &PolicyNetwork,
        params: PpoParams,
        device: &Device,
    ) -> Result<Self> {
        network.validate()?;
        if let Space::Discrete(_) = env_description.action_space {
            bail!("PPO2 here drives continuous joints, discrete action spaces are not supported");
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let observation_size = env_description.observation_size();
        let distribution = DiagGaussianDistribution::build(
            observation_size,
            &network.hidden_layers,
            env_description.action_size(),
            &vb,
            "policy",
        )?;
        let value_net = build_mlp(observation_size, &network.hidden_layers, 1, &vb, "value")?;
        let optimizer =
            OptimizerWithMaxGrad::adam(varmap, params.learning_rate, params.max_grad_norm)?;
        Ok(Self {
            distribution,
            value_net,
            optimizer,
            params,
            network: network.clone(),
            env_description: env_description.clone(),
            device: device.clone(),
            num_timesteps: 0,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.optimizer.varmap
    }

    pub fn calculate_values(&self, observations: &Tensor) -> Result<Tensor> {
        Ok(self.value_net.forward(observations)?.squeeze(1)?)
    }

    /// Samples one action per observation together with its log probability.
    pub fn act(&self, observations: &[Buffer]) -> Result<Vec<(Buffer, f32)>> {
        let observations = stack_buffers(observations, &self.device)?;
        let actions = self.distribution.sample(&observations)?;
        let logps: Vec<f32> = self
            .distribution
            .log_probs(&observations, &actions)?
            .to_vec1()?;
        Ok(tensor_to_buffers(&actions)?.into_iter().zip(logps).collect())
    }

    fn clip_to_bounds(&self, action: Buffer) -> Buffer {
        match self.env_description.action_space.bounds() {
            Some((low, high)) => action.clamp(low, high),
            None => action,
        }
    }
}

pub struct Ppo<H: PpoHooks = EmptyPpoHooks> {
    pub core: PpoCore,
    pub hooks: H,
    sampler: StepBoundSampler,
    rollout_idx: usize,
}

impl Ppo<EmptyPpoHooks> {
    pub fn new(
        env_description: &EnvironmentDescription,
        network: &PolicyNetwork,
        params: PpoParams,
        device: &Device,
    ) -> Result<Self> {
        Self::with_hooks(env_description, network, params, device, EmptyPpoHooks)
    }
}

impl<H: PpoHooks> Ppo<H> {
    pub fn with_hooks(
        env_description: &EnvironmentDescription,
        network: &PolicyNetwork,
        params: PpoParams,
        device: &Device,
        hooks: H,
    ) -> Result<Self> {
        let core = PpoCore::build(env_description, network, params, device)?;
        Ok(Self {
            core,
            hooks,
            sampler: StepBoundSampler::new(),
            rollout_idx: 0,
        })
    }

    /// Rebuilds the agent with `network` and copies the checkpoint's weights into it.
    pub fn load(
        path: &Path,
        network: &PolicyNetwork,
        params: PpoParams,
        device: &Device,
        hooks: H,
    ) -> Result<Self> {
        let checkpoint = Checkpoint::read(path, device)?;
        checkpoint.metadata.expect_algorithm(&PPO_FAMILY)?;
        let env_description = checkpoint.metadata.env_description();
        let mut agent = Self::with_hooks(&env_description, network, params, device, hooks)?;
        checkpoint.restore(GROUP, agent.core.varmap())?;
        for (group, varmap) in agent.hooks.checkpoint_groups() {
            if checkpoint.has_group(group) {
                checkpoint.restore(group, varmap)?;
            } else {
                tracing::debug!(group, "checkpoint has no weights for group, keeping fresh ones");
            }
        }
        agent.core.num_timesteps = checkpoint.metadata.timesteps;
        Ok(agent)
    }

    fn sample_size(&self, num_envs: usize) -> usize {
        (self.core.params.n_steps * num_envs / self.core.params.n_minibatches.max(1)).max(1)
    }

    fn batching_loop(&mut self, batch_iter: &mut RolloutBatchIterator) -> Result<Vec<(f32, f32)>> {
        let core = &mut self.core;
        let mut losses = vec![];
        for batch in batch_iter {
            let observations = stack_buffers(&batch.observations, &core.device)?;
            let actions = stack_buffers(&batch.actions, &core.device)?;
            let n = batch.returns.len();
            let returns = Tensor::from_slice(&batch.returns, n, &core.device)?;
            let advantages = Tensor::from_slice(&batch.advantages, n, &core.device)?;
            let logp_old = Tensor::from_slice(&batch.logp_old, n, &core.device)?;

            let logp = Logp(core.distribution.log_probs(&observations, &actions)?);
            let values_pred = ValuesPred(core.calculate_values(&observations)?);
            let mut value_loss = ValueLoss(returns.sub(&values_pred)?.sqr()?.mean_all()?);
            let logp_diff = LogpDiff((logp.deref() - &logp_old)?);
            let ratio = logp_diff.exp()?;
            let clip_range = core.params.clip_range as f64;
            let clip_adv = (ratio.clamp(1. - clip_range, 1. + clip_range)? * &advantages)?;
            let mut policy_loss = PolicyLoss(
                Tensor::minimum(&(&ratio * &advantages)?, &clip_adv)?
                    .neg()?
                    .mean_all()?,
            );
            let data = PpoBatchData {
                logp,
                values_pred,
                logp_diff,
                ratio,
            };
            let hook_result =
                self.hooks
                    .batch_hook(core, &batch, &mut policy_loss, &mut value_loss, &data)?;
            let entropy = core.distribution.entropy()?;
            let loss = ((policy_loss.deref() + value_loss.affine(core.params.vf_coef as f64, 0.)?)?
                - entropy.affine(core.params.ent_coef as f64, 0.)?)?;
            core.optimizer.backward_step(&loss)?;
            losses.push((
                policy_loss.to_scalar::<f32>()?,
                value_loss.to_scalar::<f32>()?,
            ));
            if let HookResult::Break = hook_result {
                break;
            }
        }
        Ok(losses)
    }

    fn learning_loop(&mut self, rollouts: &mut Vec<RolloutBuffer>) -> Result<Vec<(f32, f32)>> {
        let mut losses = vec![];
        if let HookResult::Break = self.hooks.before_learning_hook(&mut self.core, rollouts)? {
            return Ok(losses);
        }
        let mut advantages = Vec::with_capacity(rollouts.len());
        let mut returns = Vec::with_capacity(rollouts.len());
        for rollout in rollouts.iter() {
            let states = stack_buffers(&rollout.states, &self.core.device)?;
            let values: Vec<f32> = self.core.calculate_values(&states)?.to_vec1()?;
            let (adv, ret) = rollout.calculate_advantages_and_returns(
                &values,
                self.core.params.gamma,
                self.core.params.lambda,
            )?;
            advantages.push(adv);
            returns.push(ret);
        }
        let mut advantages = Advantages::new(advantages);
        advantages.normalize();
        let returns = Returns::new(returns);
        let sample_size = self.sample_size(rollouts.len());
        for _ in 0..self.core.params.n_epochs {
            let mut batch_iter =
                RolloutBatchIterator::new(rollouts, &advantages, &returns, sample_size);
            losses.extend(self.batching_loop(&mut batch_iter)?);
        }
        Ok(losses)
    }

    fn validate_env(&self, env: &dyn VecEnv) -> Result<()> {
        let description = env.env_description();
        ensure!(
            description.observation_size() == self.core.env_description.observation_size()
                && description.action_size() == self.core.env_description.action_size(),
            "environment does not match the network: observations {} vs {}, actions {} vs {}",
            description.observation_size(),
            self.core.env_description.observation_size(),
            description.action_size(),
            self.core.env_description.action_size()
        );
        Ok(())
    }
}

impl<H: PpoHooks> Agent for Ppo<H> {
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: usize,
        hooks: &mut dyn LearningHooks,
    ) -> Result<LearnOutcome> {
        self.core.params.validate()?;
        self.validate_env(env)?;
        let mut steps_done = 0;
        while steps_done < total_timesteps {
            if hooks.should_stop() {
                return Ok(LearnOutcome::Interrupted);
            }
            let n_steps = self.core.params.n_steps;
            let core = &self.core;
            let collected = self
                .sampler
                .collect(env, n_steps, hooks, |obs| core.act(obs))?;
            let mut rollouts = match collected {
                Collected::Rollouts(rollouts) => rollouts,
                Collected::Interrupted => return Ok(LearnOutcome::Interrupted),
            };
            let rollout_steps: usize = rollouts.iter().map(RolloutBuffer::len).sum();
            steps_done += rollout_steps;
            self.core.num_timesteps += rollout_steps;
            let total_reward = rollouts.iter().flat_map(|r| r.rewards.iter()).sum::<f32>();
            let losses = self.learning_loop(&mut rollouts)?;
            let finished = self.sampler.tracker.drain();
            let mut reported = vec![
                ("policy_loss", mean(&losses.iter().map(|l| l.0).collect::<Vec<_>>()).unwrap_or(0.)),
                ("value_loss", mean(&losses.iter().map(|l| l.1).collect::<Vec<_>>()).unwrap_or(0.)),
                ("std", self.core.distribution.std()?),
            ];
            reported.extend(self.hooks.losses());
            let stats = RolloutStats {
                rollout: self.rollout_idx,
                timesteps: self.core.num_timesteps,
                episodes: finished.len(),
                mean_episode_reward: mean(&finished),
                total_reward,
                losses: reported,
            };
            self.rollout_idx += 1;
            if hooks.on_rollout_end(&stats)? {
                break;
            }
        }
        Ok(LearnOutcome::Completed)
    }

    fn predict(&self, observation: &Buffer, deterministic: bool) -> Result<Buffer> {
        let observation = buffer_to_tensor(observation, &self.core.device)?.unsqueeze(0)?;
        let action = if deterministic {
            self.core.distribution.mean(&observation)?
        } else {
            self.core.distribution.sample(&observation)?
        };
        Ok(self.core.clip_to_bounds(tensor_to_buffer(&action)?))
    }

    fn pretrain(
        &mut self,
        dataset: &ExpertDataset,
        options: &PretrainOptions,
    ) -> Result<PretrainReport> {
        let distribution = &self.core.distribution;
        let varmap = self.core.varmap().clone();
        behaviour_cloning(
            dataset,
            options,
            &self.core.env_description,
            varmap,
            &self.core.device,
            |observations| distribution.mean(observations),
        )
    }

    fn save(&self, path: &Path) -> Result<PathBuf> {
        let metadata = CheckpointMetadata::new(
            self.hooks.algorithm(),
            &self.core.env_description,
            &self.core.network.hidden_layers,
            self.core.num_timesteps,
        );
        let mut groups = vec![(GROUP, self.core.varmap())];
        groups.extend(self.hooks.checkpoint_groups());
        save_checkpoint(path, &groups, &metadata)
    }

    fn num_timesteps(&self) -> usize {
        self.core.num_timesteps
    }
}

/// Supervised regression of `policy` onto the expert's actions with a mean squared error.
pub fn behaviour_cloning<F>(
    dataset: &ExpertDataset,
    options: &PretrainOptions,
    env_description: &EnvironmentDescription,
    varmap: VarMap,
    device: &Device,
    policy: F,
) -> Result<PretrainReport>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    ensure!(
        dataset.observation_size() == env_description.observation_size()
            && dataset.action_size() == env_description.action_size(),
        "dataset {} does not match the environment: observations {} vs {}, actions {} vs {}",
        dataset.path().display(),
        dataset.observation_size(),
        env_description.observation_size(),
        dataset.action_size(),
        env_description.action_size()
    );
    let mut optimizer = OptimizerWithMaxGrad::adam(varmap, options.learning_rate, None)?;
    let mut report = PretrainReport::default();
    for epoch in 0..options.n_epochs {
        let mut epoch_losses = vec![];
        for batch in dataset.batches(Split::Train) {
            let observations = stack_buffers(&batch.observations, device)?;
            let actions = stack_buffers(&batch.actions, device)?;
            let loss = policy(&observations)?.sub(&actions)?.sqr()?.mean_all()?;
            optimizer.backward_step(&loss)?;
            epoch_losses.push(loss.to_scalar::<f32>()?);
        }
        report.epochs = epoch + 1;
        report.train_loss = mean(&epoch_losses).unwrap_or(0.);
        let validate = options.val_interval > 0 && (epoch + 1) % options.val_interval == 0;
        if validate && dataset.len(Split::Validation) > 0 {
            let mut val_losses = vec![];
            for batch in dataset.batches(Split::Validation) {
                let observations = stack_buffers(&batch.observations, device)?;
                let actions = stack_buffers(&batch.actions, device)?;
                let loss = policy(&observations)?.sub(&actions)?.sqr()?.mean_all()?;
                val_losses.push(loss.to_scalar::<f32>()?);
            }
            report.val_loss = mean(&val_losses);
            tracing::info!(
                epoch = epoch + 1,
                train_loss = report.train_loss,
                val_loss = report.val_loss,
                "pretraining"
            );
        }
    }
    Ok(report)
}
