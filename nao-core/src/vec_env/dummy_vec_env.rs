use super::{SeededEnv, Transition, VecEnv, worker_seed};
use crate::{
    env::{BoxedEnv, Env, EnvOptions, EnvironmentDescription},
    env_registry::EnvFactory,
    error::IpcError,
    tensor::Buffer,
};
use anyhow::{Result, ensure};

pub struct DummyVecEnv<E: Env = BoxedEnv> {
    envs: Vec<SeededEnv<E>>,
    env_description: EnvironmentDescription,
    closed: bool,
}

impl<E: Env> DummyVecEnv<E> {
    /// Wraps already constructed environments. Rank `r` is seeded with `base_seed + r`.
    pub fn new(envs: Vec<E>, base_seed: u64) -> Result<Self> {
        ensure!(!envs.is_empty(), "a vectorized env needs at least one worker");
        let env_description = envs[0].env_description();
        let envs = envs
            .into_iter()
            .enumerate()
            .map(|(rank, env)| SeededEnv::new(env, worker_seed(base_seed, rank)))
            .collect();
        Ok(Self {
            envs,
            env_description,
            closed: false,
        })
    }

    pub fn single(env: E, seed: u64) -> Self {
        let env_description = env.env_description();
        Self {
            envs: vec![SeededEnv::new(env, seed)],
            env_description,
            closed: false,
        }
    }

    pub fn envs(&self) -> impl Iterator<Item = &E> {
        self.envs.iter().map(SeededEnv::env)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(IpcError::Closed.into());
        }
        Ok(())
    }
}

impl DummyVecEnv<BoxedEnv> {
    pub fn from_factory(
        factory: &EnvFactory,
        options: &EnvOptions,
        num_envs: usize,
        base_seed: u64,
    ) -> Result<Self> {
        let envs = (0..num_envs)
            .map(|_| factory(options))
            .collect::<Result<Vec<_>>>()?;
        Self::new(envs, base_seed)
    }
}

impl<E: Env> VecEnv for DummyVecEnv<E> {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn seeds(&self) -> Vec<u64> {
        self.envs.iter().map(SeededEnv::seed).collect()
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.env_description.clone()
    }

    fn reset(&mut self) -> Result<Vec<Buffer>> {
        self.ensure_open()?;
        self.envs.iter_mut().map(SeededEnv::reset).collect()
    }

    fn step(&mut self, actions: Vec<Buffer>) -> Result<Vec<Transition>> {
        self.ensure_open()?;
        ensure!(
            actions.len() == self.envs.len(),
            "got {} actions for {} environments",
            actions.len(),
            self.envs.len()
        );
        self.envs
            .iter_mut()
            .zip(actions)
            .map(|(env, action)| env.step(action))
            .collect()
    }

    fn render(&mut self) -> Result<()> {
        self.ensure_open()?;
        for env in self.envs.iter_mut() {
            env.render()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        for env in self.envs.iter_mut() {
            if let Err(err) = env.close() {
                tracing::warn!("failed to close environment: {err}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
