use crate::{
    optimizer::OptimizerWithMaxGrad,
    ppo::{HookResult, Ppo, PpoCore, PpoHooks},
    tensors::stack_buffers,
    thread_safe_sequential::{ThreadSafeSequential, build_mlp},
};
use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder, VarMap, ops::sigmoid};
use nao_core::{
    env::EnvironmentDescription, error::ConfigError, expert::ExpertDataset, rng::with_rng,
    tensor::Buffer,
    utils::rollout_buffer::RolloutBuffer,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const GAIL: &str = "GAIL";

const DISCRIMINATOR: &str = "discriminator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GailParams {
    pub hidden_size_adversary: usize,
    pub adversary_lr: f64,
    /// Discriminator updates per rollout.
    pub d_steps: usize,
    pub adversary_batch_size: usize,
}

impl Default for GailParams {
    fn default() -> Self {
        Self {
            hidden_size_adversary: 100,
            adversary_lr: 3e-4,
            d_steps: 1,
            adversary_batch_size: 64,
        }
    }
}

impl GailParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::ensure_positive("gail.hidden_size_adversary", self.hidden_size_adversary)?;
        ConfigError::ensure_positive("gail.adversary_batch_size", self.adversary_batch_size)
    }
}

/// Generative adversarial imitation: a discriminator learns to tell expert transitions from the
/// policy's, and the policy is rewarded for fooling it.
pub struct GailHooks {
    discriminator: ThreadSafeSequential,
    optimizer: OptimizerWithMaxGrad,
    dataset: ExpertDataset,
    params: GailParams,
    device: Device,
    last_loss: f32,
}

/// PPO generator trained against a discriminator.
pub type Gail = Ppo<GailHooks>;

/// `log(1 + exp(x))` without overflow.
fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1., 1.)?.log()?;
    Ok((xs.relu()? + tail)?)
}

impl GailHooks {
    pub fn new(
        env_description: &EnvironmentDescription,
        dataset: ExpertDataset,
        params: GailParams,
        device: &Device,
    ) -> Result<Self> {
        ensure!(
            dataset.observation_size() == env_description.observation_size()
                && dataset.action_size() == env_description.action_size(),
            "expert dataset {} does not match the environment",
            dataset.path().display()
        );
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let hidden = [params.hidden_size_adversary, params.hidden_size_adversary];
        let discriminator = build_mlp(
            env_description.observation_size() + env_description.action_size(),
            &hidden,
            1,
            &vb,
            DISCRIMINATOR,
        )?;
        let optimizer = OptimizerWithMaxGrad::adam(varmap, params.adversary_lr, None)?;
        Ok(Self {
            discriminator,
            optimizer,
            dataset,
            params,
            device: device.clone(),
            last_loss: 0.,
        })
    }

    pub fn dataset(&self) -> &ExpertDataset {
        &self.dataset
    }

    fn logits(&self, observations: &[Buffer], actions: &[Buffer]) -> Result<Tensor> {
        let observations = stack_buffers(observations, &self.device)?;
        let actions = stack_buffers(actions, &self.device)?;
        let input = Tensor::cat(&[&observations, &actions], 1)?;
        Ok(self.discriminator.forward(&input)?.squeeze(1)?)
    }

    /// Reward of a generator transition, `-log(1 - D(s, a))`.
    pub fn rewards(&self, observations: &[Buffer], actions: &[Buffer]) -> Result<Vec<f32>> {
        let logits = self.logits(observations, actions)?;
        let fake = sigmoid(&logits.neg()?)?;
        Ok(fake.affine(1., 1e-8)?.log()?.neg()?.to_vec1()?)
    }

    fn train_discriminator(&mut self, rollouts: &[RolloutBuffer]) -> Result<f32> {
        let generated: Vec<(usize, usize)> = rollouts
            .iter()
            .enumerate()
            .flat_map(|(i, rollout)| (0..rollout.len()).map(move |j| (i, j)))
            .collect();
        let mut losses = vec![];
        for _ in 0..self.params.d_steps {
            let expert = self.dataset.sample(self.params.adversary_batch_size);
            let picks: Vec<(usize, usize)> = with_rng(|rng| {
                (0..expert.observations.len())
                    .map(|_| generated[rng.random_range(0..generated.len())])
                    .collect()
            });
            let gen_obs: Vec<Buffer> = picks
                .iter()
                .map(|(i, j)| rollouts[*i].states[*j].clone())
                .collect();
            let gen_act: Vec<Buffer> = picks
                .iter()
                .map(|(i, j)| rollouts[*i].actions[*j].clone())
                .collect();
            let expert_logits = self.logits(&expert.observations, &expert.actions)?;
            let generator_logits = self.logits(&gen_obs, &gen_act)?;
            // binary cross entropy, expert labelled 1 and generator 0
            let loss = (softplus(&expert_logits.neg()?)?.mean_all()?
                + softplus(&generator_logits)?.mean_all()?)?;
            self.optimizer.backward_step(&loss)?;
            losses.push(loss.to_scalar::<f32>()?);
        }
        Ok(losses.iter().sum::<f32>() / losses.len().max(1) as f32)
    }
}

impl PpoHooks for GailHooks {
    fn algorithm(&self) -> &'static str {
        GAIL
    }

    fn before_learning_hook(
        &mut self,
        _core: &mut PpoCore,
        rollouts: &mut [RolloutBuffer],
    ) -> Result<HookResult> {
        if rollouts.iter().all(RolloutBuffer::is_empty) {
            return Ok(HookResult::Continue);
        }
        self.last_loss = self.train_discriminator(rollouts)?;
        for rollout in rollouts.iter_mut() {
            if rollout.is_empty() {
                continue;
            }
            let steps = rollout.len();
            rollout.rewards = self.rewards(&rollout.states[..steps], &rollout.actions)?;
        }
        Ok(HookResult::Continue)
    }

    fn losses(&self) -> Vec<(&'static str, f32)> {
        vec![("discriminator_loss", self.last_loss)]
    }

    fn checkpoint_groups(&self) -> Vec<(&'static str, &VarMap)> {
        vec![(DISCRIMINATOR, &self.optimizer.varmap)]
    }
}

#[cfg(test)]
mod test {
    use super::softplus;
    use approx::assert_relative_eq;
    use candle_core::{Device, Tensor};

    #[test]
    fn softplus_is_stable_for_large_inputs() {
        let xs = Tensor::new(&[-100f32, 0., 100.], &Device::Cpu).unwrap();
        let ys: Vec<f32> = softplus(&xs).unwrap().to_vec1().unwrap();
        assert_relative_eq!(ys[0], 0., epsilon = 1e-6);
        assert_relative_eq!(ys[1], 2f32.ln(), epsilon = 1e-6);
        assert_relative_eq!(ys[2], 100., epsilon = 1e-4);
    }
}
