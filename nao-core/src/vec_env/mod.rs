pub mod dummy_vec_env;
pub mod subproc_vec_env;

use crate::{
    env::{Env, EnvironmentDescription},
    rng::with_rng,
    tensor::Buffer,
};
use anyhow::Result;
use bincode::{Decode, Encode};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

pub use dummy_vec_env::DummyVecEnv;
pub use subproc_vec_env::{SubprocOptions, SubprocVecEnv};

/// One step of one worker. When the episode ended the worker has already been reset, `state`
/// holds the first observation of the next episode and `terminal_state` the last one of the
/// finished episode.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Transition {
    pub state: Buffer,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    pub terminal_state: Option<Buffer>,
}

impl Transition {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// A batch of environments stepped in lock step.
pub trait VecEnv {
    fn num_envs(&self) -> usize;

    /// Seed of every worker, indexed by rank.
    fn seeds(&self) -> Vec<u64>;

    fn env_description(&self) -> EnvironmentDescription;

    fn reset(&mut self) -> Result<Vec<Buffer>>;

    fn step(&mut self, actions: Vec<Buffer>) -> Result<Vec<Transition>>;

    fn render(&mut self) -> Result<()>;

    /// Releases every worker. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

impl<V: VecEnv + ?Sized> VecEnv for Box<V> {
    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn seeds(&self) -> Vec<u64> {
        (**self).seeds()
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }

    fn reset(&mut self) -> Result<Vec<Buffer>> {
        (**self).reset()
    }

    fn step(&mut self, actions: Vec<Buffer>) -> Result<Vec<Transition>> {
        (**self).step(actions)
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

pub type BoxedVecEnv = Box<dyn VecEnv + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VecEnvKind {
    /// Environments live in this process and are stepped one after another.
    #[default]
    Dummy,
    /// One worker process per environment.
    Subproc,
}

/// Seed for the worker at `rank`.
pub fn worker_seed(base_seed: u64, rank: usize) -> u64 {
    base_seed.wrapping_add(rank as u64)
}

/// An environment bound to a seed. The first reset uses the seed itself, later resets draw from
/// a generator seeded with it, so a worker's sequence of episodes only depends on its seed.
pub struct SeededEnv<E: Env> {
    env: E,
    seed: u64,
    reseeder: StdRng,
    started: bool,
}

impl<E: Env> SeededEnv<E> {
    pub fn new(env: E, seed: u64) -> Self {
        Self {
            env,
            seed,
            reseeder: StdRng::seed_from_u64(seed),
            started: false,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn reset(&mut self) -> Result<Buffer> {
        let seed = if self.started {
            self.reseeder.random()
        } else {
            self.started = true;
            self.seed
        };
        self.env.reset(seed)
    }

    pub fn step(&mut self, action: Buffer) -> Result<Transition> {
        let snapshot = self.env.step(action)?;
        if snapshot.done() {
            let next = self.reset()?;
            Ok(Transition {
                state: next,
                reward: snapshot.reward,
                terminated: snapshot.terminated,
                truncated: snapshot.truncated,
                terminal_state: Some(snapshot.state),
            })
        } else {
            Ok(Transition {
                state: snapshot.state,
                reward: snapshot.reward,
                terminated: snapshot.terminated,
                truncated: snapshot.truncated,
                terminal_state: None,
            })
        }
    }

    pub fn render(&mut self) -> Result<()> {
        self.env.render()
    }

    pub fn close(&mut self) -> Result<()> {
        self.env.close()
    }

    pub fn into_inner(self) -> E {
        self.env
    }
}

/// Draws a fresh base seed from the process generator.
pub fn random_seed() -> u64 {
    with_rng(|rng| rng.random())
}
