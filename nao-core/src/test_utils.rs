// In-process environments used by the test suites of every crate in the workspace.

use crate::{
    env::{Env, EnvironmentDescription, ExpertEnv, SnapShot, Space},
    tensor::Buffer,
};
use anyhow::{Result, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

pub const OBS_SIZE: usize = 4;
pub const ACTION_SIZE: usize = 2;

/// Counters shared between a test and the environments it hands out.
#[derive(Debug, Clone, Default)]
pub struct EnvCounters {
    pub closes: Arc<AtomicUsize>,
    pub renders: Arc<AtomicUsize>,
    pub steps: Arc<AtomicUsize>,
    pub reset_seeds: Arc<Mutex<Vec<u64>>>,
}

impl EnvCounters {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn reset_seeds(&self) -> Vec<u64> {
        self.reset_seeds.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// A point that should follow a target derived from its observation. The expert action is that
/// target, so imitation can drive the loss towards zero.
#[derive(Debug)]
pub struct TargetEnv {
    state: Vec<f32>,
    rng: StdRng,
    t: usize,
    episode_len: usize,
    counters: EnvCounters,
    closed: bool,
}

impl TargetEnv {
    pub fn new(episode_len: usize, counters: EnvCounters) -> Self {
        Self {
            state: vec![0.; OBS_SIZE],
            rng: StdRng::seed_from_u64(0),
            t: 0,
            episode_len,
            counters,
            closed: false,
        }
    }

    pub fn target(observation: &[f32]) -> Vec<f32> {
        vec![
            (observation[0] - observation[1]).tanh(),
            (observation[2] + observation[3]).tanh(),
        ]
    }
}

impl Env for TargetEnv {
    fn reset(&mut self, seed: u64) -> Result<Buffer> {
        if let Ok(mut seeds) = self.counters.reset_seeds.lock() {
            seeds.push(seed);
        }
        self.rng = StdRng::seed_from_u64(seed);
        self.state = (0..OBS_SIZE)
            .map(|_| self.rng.random_range(-1f32..1.))
            .collect();
        self.t = 0;
        Ok(Buffer::from_vec(self.state.clone()))
    }

    fn step(&mut self, action: Buffer) -> Result<SnapShot> {
        if self.closed {
            bail!("stepped a closed environment");
        }
        if action.len() != ACTION_SIZE {
            bail!("expected {ACTION_SIZE} actions, got {}", action.len());
        }
        self.counters.steps.fetch_add(1, Ordering::SeqCst);
        let target = Self::target(&self.state);
        let reward = -target
            .iter()
            .zip(action.data.iter())
            .map(|(t, a)| (t - a.clamp(-1., 1.)).powi(2))
            .sum::<f32>();
        let drift: f32 = self.rng.random_range(-0.1..0.1);
        self.state = self.state.iter().map(|x| (x + drift).clamp(-1., 1.)).collect();
        self.t += 1;
        Ok(SnapShot {
            state: Buffer::from_vec(self.state.clone()),
            reward,
            terminated: false,
            truncated: self.t >= self.episode_len,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::bounded(vec![-1.; OBS_SIZE], vec![1.; OBS_SIZE]),
            Space::bounded(vec![-1.; ACTION_SIZE], vec![1.; ACTION_SIZE]),
        )
    }

    fn render(&mut self) -> Result<()> {
        self.counters.renders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl ExpertEnv for TargetEnv {
    fn expert_action(&mut self, observation: &Buffer) -> Result<Buffer> {
        Ok(Buffer::from_vec(Self::target(&observation.data)))
    }
}
