use crate::{
    agents::LearningHooks, tensor::Buffer, utils::rollout_buffer::RolloutBuffer, vec_env::VecEnv,
};
use anyhow::{Result, ensure};

/// Running and finished episode returns for every worker of a vectorized env.
#[derive(Debug, Clone, Default)]
pub struct EpisodeTracker {
    running: Vec<f32>,
    finished: Vec<f32>,
    total_episodes: usize,
}

impl EpisodeTracker {
    pub fn new(num_envs: usize) -> Self {
        Self {
            running: vec![0.; num_envs],
            finished: vec![],
            total_episodes: 0,
        }
    }

    pub fn record(&mut self, env_idx: usize, reward: f32, done: bool) {
        self.running[env_idx] += reward;
        if done {
            self.finished.push(self.running[env_idx]);
            self.running[env_idx] = 0.;
            self.total_episodes += 1;
        }
    }

    /// Returns of the episodes finished since the last drain.
    pub fn drain(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.finished)
    }

    pub fn total_episodes(&self) -> usize {
        self.total_episodes
    }
}

pub fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

/// Collects fixed length rollouts from every worker, continuing where the previous rollout
/// stopped.
#[derive(Debug, Default)]
pub struct StepBoundSampler {
    observations: Option<Vec<Buffer>>,
    pub tracker: EpisodeTracker,
}

pub enum Collected {
    Rollouts(Vec<RolloutBuffer>),
    Interrupted,
}

impl StepBoundSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the current observations, the next collection starts with a reset.
    pub fn restart(&mut self) {
        self.observations = None;
    }

    /// Steps every worker `n_steps` times. `act` maps the current observations to one action and
    /// its log probability per worker.
    pub fn collect<F>(
        &mut self,
        env: &mut dyn VecEnv,
        n_steps: usize,
        hooks: &dyn LearningHooks,
        mut act: F,
    ) -> Result<Collected>
    where
        F: FnMut(&[Buffer]) -> Result<Vec<(Buffer, f32)>>,
    {
        let num_envs = env.num_envs();
        if self.tracker.running.len() != num_envs {
            self.tracker = EpisodeTracker::new(num_envs);
        }
        let mut observations = match self.observations.take() {
            Some(observations) if observations.len() == num_envs => observations,
            _ => env.reset()?,
        };
        let mut rollouts = vec![RolloutBuffer::default(); num_envs];
        for _ in 0..n_steps {
            if hooks.should_stop() {
                self.observations = Some(observations);
                return Ok(Collected::Interrupted);
            }
            let sampled = act(&observations)?;
            ensure!(
                sampled.len() == num_envs,
                "policy produced {} actions for {} environments",
                sampled.len(),
                num_envs
            );
            let (actions, logps): (Vec<Buffer>, Vec<f32>) = sampled.into_iter().unzip();
            let transitions = env.step(actions.clone())?;
            let mut next_observations = Vec::with_capacity(num_envs);
            for (idx, ((state, action), (logp, transition))) in observations
                .into_iter()
                .zip(actions)
                .zip(logps.into_iter().zip(transitions))
                .enumerate()
            {
                let done = transition.done();
                self.tracker.record(idx, transition.reward, done);
                rollouts[idx].push_step(state, action, transition.reward, done, logp);
                next_observations.push(transition.state);
            }
            observations = next_observations;
        }
        for (rollout, state) in rollouts.iter_mut().zip(observations.iter()) {
            rollout.push_state(state.clone());
        }
        self.observations = Some(observations);
        Ok(Collected::Rollouts(rollouts))
    }
}
