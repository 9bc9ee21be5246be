use crate::{rng::with_rng, tensor::Buffer};
use anyhow::{Result, ensure};
use derive_more::Deref;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Deref)]
pub struct Advantages(Vec<Vec<f32>>);

#[derive(Debug, Clone, Deref)]
pub struct Returns(Vec<Vec<f32>>);

/// Transitions of one worker. `states` holds one more entry than `actions`: the observation the
/// worker will continue from, which bootstraps the value estimate.
#[derive(Debug, Clone, Default)]
pub struct RolloutBuffer {
    pub states: Vec<Buffer>,
    pub actions: Vec<Buffer>,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    pub logps: Vec<f32>,
}

impl RolloutBuffer {
    pub fn push_step(&mut self, state: Buffer, action: Buffer, reward: f32, done: bool, logp: f32) {
        self.states.push(state);
        self.actions.push(action);
        self.rewards.push(reward);
        self.dones.push(done);
        self.logps.push(logp);
    }

    pub fn push_state(&mut self, state: Buffer) {
        self.states.push(state);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Generalized advantage estimation. `values` are the critic's estimates for every entry of
    /// `states`, including the bootstrap state.
    pub fn calculate_advantages_and_returns(
        &self,
        values: &[f32],
        gamma: f32,
        lambda: f32,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let total_steps = self.rewards.len();
        ensure!(
            values.len() == total_steps + 1,
            "expected {} values, got {}",
            total_steps + 1,
            values.len()
        );
        let mut advantages: Vec<f32> = vec![0.; total_steps];
        let mut returns: Vec<f32> = vec![0.; total_steps];
        let mut last_gae_lam: f32 = 0.;
        for i in (0..total_steps).rev() {
            let next_non_terminal = if self.dones[i] {
                last_gae_lam = 0.;
                0f32
            } else {
                1.
            };
            let delta = self.rewards[i] + next_non_terminal * gamma * values[i + 1] - values[i];
            last_gae_lam = delta + next_non_terminal * gamma * lambda * last_gae_lam;
            advantages[i] = last_gae_lam;
            returns[i] = last_gae_lam + values[i];
        }
        Ok((advantages, returns))
    }
}

impl Advantages {
    pub fn new(advantages: Vec<Vec<f32>>) -> Self {
        Self(advantages)
    }

    pub fn normalize(&mut self) {
        let count: usize = self.0.iter().map(Vec::len).sum();
        if count == 0 {
            return;
        }
        let mean = self.0.iter().flatten().sum::<f32>() / count as f32;
        let variance =
            self.0.iter().flatten().map(|x| (*x - mean).powi(2)).sum::<f32>() / count as f32;
        let std = variance.sqrt() + 1e-8;
        for x in self.0.iter_mut().flatten() {
            *x = (*x - mean) / std;
        }
    }
}

impl Returns {
    pub fn new(returns: Vec<Vec<f32>>) -> Self {
        Self(returns)
    }
}

/// One minibatch worth of flattened rollout data.
#[derive(Debug, Clone)]
pub struct RolloutBatch {
    pub observations: Vec<Buffer>,
    pub actions: Vec<Buffer>,
    pub returns: Vec<f32>,
    pub advantages: Vec<f32>,
    pub logp_old: Vec<f32>,
}

/// Shuffled minibatches over every (worker, step) pair of a set of rollouts.
pub struct RolloutBatchIterator<'a> {
    rollouts: &'a [RolloutBuffer],
    advantages: &'a Advantages,
    returns: &'a Returns,
    indices: Vec<(usize, usize)>,
    current: usize,
    sample_size: usize,
}

impl<'a> RolloutBatchIterator<'a> {
    pub fn new(
        rollouts: &'a [RolloutBuffer],
        advantages: &'a Advantages,
        returns: &'a Returns,
        sample_size: usize,
    ) -> Self {
        let mut indices: Vec<(usize, usize)> = rollouts
            .iter()
            .enumerate()
            .flat_map(|(i, rollout)| (0..rollout.len()).map(move |j| (i, j)))
            .collect();
        with_rng(|rng| indices.shuffle(rng));
        Self {
            rollouts,
            advantages,
            returns,
            indices,
            current: 0,
            sample_size: sample_size.max(1),
        }
    }
}

impl Iterator for RolloutBatchIterator<'_> {
    type Item = RolloutBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.indices.len() {
            return None;
        }
        let end = (self.current + self.sample_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current..end];
        self.current = end;
        let mut batch = RolloutBatch {
            observations: Vec::with_capacity(batch_indices.len()),
            actions: Vec::with_capacity(batch_indices.len()),
            returns: Vec::with_capacity(batch_indices.len()),
            advantages: Vec::with_capacity(batch_indices.len()),
            logp_old: Vec::with_capacity(batch_indices.len()),
        };
        for &(i, j) in batch_indices {
            let rollout = &self.rollouts[i];
            batch.observations.push(rollout.states[j].clone());
            batch.actions.push(rollout.actions[j].clone());
            batch.returns.push(self.returns[i][j]);
            batch.advantages.push(self.advantages[i][j]);
            batch.logp_old.push(rollout.logps[j]);
        }
        Some(batch)
    }
}
