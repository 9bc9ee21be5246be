use crate::tensor::Buffer;
use anyhow::Result;
use bincode::{Decode, Encode};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Space {
    Discrete(usize),
    Continuous {
        min: Option<Buffer>,
        max: Option<Buffer>,
        size: usize,
    },
}

impl Space {
    pub fn continuous_from_dims(dims: Vec<usize>) -> Self {
        Self::Continuous {
            min: None,
            max: None,
            size: dims.iter().product(),
        }
    }

    pub fn bounded(min: Vec<f32>, max: Vec<f32>) -> Self {
        let size = min.len();
        Self::Continuous {
            min: Some(Buffer::from_vec(min)),
            max: Some(Buffer::from_vec(max)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        match &self {
            Self::Discrete(size) => *size,
            Self::Continuous { size, .. } => *size,
        }
    }

    pub fn bounds(&self) -> Option<(&Buffer, &Buffer)> {
        match self {
            Self::Continuous {
                min: Some(min),
                max: Some(max),
                ..
            } => Some((min, max)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct EnvironmentDescription {
    pub observation_space: Space,
    pub action_space: Space,
}

impl EnvironmentDescription {
    pub fn new(observation_space: Space, action_space: Space) -> Self {
        Self {
            observation_space,
            action_space,
        }
    }

    pub fn action_size(&self) -> usize {
        self.action_space.size()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_space.size()
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SnapShot {
    pub state: Buffer,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
}

impl SnapShot {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Transition stored by off policy learners.
#[derive(Debug, Clone)]
pub struct Memory {
    pub state: Buffer,
    pub next_state: Buffer,
    pub action: Buffer,
    pub reward: f32,
    pub terminated: bool,
}

/// Options every environment factory receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOptions {
    /// Open the simulator window and allow `render` to draw.
    pub gui: bool,
}

impl EnvOptions {
    pub fn gui() -> Self {
        Self { gui: true }
    }

    pub fn headless() -> Self {
        Self { gui: false }
    }
}

pub trait Env {
    fn reset(&mut self, seed: u64) -> Result<Buffer>;

    fn step(&mut self, action: Buffer) -> Result<SnapShot>;

    fn env_description(&self) -> EnvironmentDescription;

    fn render(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases simulator resources. Calling it twice must be harmless.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An environment that ships a scripted controller, used to record demonstrations.
pub trait ExpertEnv: Env {
    fn expert_action(&mut self, observation: &Buffer) -> Result<Buffer>;
}

impl<E: Env + ?Sized> Env for Box<E> {
    fn reset(&mut self, seed: u64) -> Result<Buffer> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: Buffer) -> Result<SnapShot> {
        (**self).step(action)
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<E: ExpertEnv + ?Sized> ExpertEnv for Box<E> {
    fn expert_action(&mut self, observation: &Buffer) -> Result<Buffer> {
        (**self).expert_action(observation)
    }
}

impl<E: Env + ?Sized> Env for &mut E {
    fn reset(&mut self, seed: u64) -> Result<Buffer> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: Buffer) -> Result<SnapShot> {
        (**self).step(action)
    }

    fn env_description(&self) -> EnvironmentDescription {
        (**self).env_description()
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<E: ExpertEnv + ?Sized> ExpertEnv for &mut E {
    fn expert_action(&mut self, observation: &Buffer) -> Result<Buffer> {
        (**self).expert_action(observation)
    }
}

pub type BoxedEnv = Box<dyn Env + Send>;

pub type BoxedExpertEnv = Box<dyn ExpertEnv + Send>;
