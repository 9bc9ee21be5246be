use super::Runner;
use crate::{factory::make_single_env, model::Model};
use anyhow::{Result, anyhow};
use nao_core::{
    agents::Agent,
    cancel::CancellationToken,
    env::EnvOptions,
    tensor::Buffer,
    vec_env::{BoxedVecEnv, VecEnv},
};
use std::path::Path;

/// One rendered step of a watched policy.
#[derive(Debug, Clone)]
pub struct Frame {
    pub step: usize,
    /// What the agent saw when it picked `action`.
    pub observation: Buffer,
    pub action: Buffer,
    pub reward: f32,
    /// The episode ended on this step and the environment was reset.
    pub done: bool,
}

/// Plays `agent` in a rendered environment for as long as it is polled. The stream ends once
/// the token is cancelled or a step fails; the environment is closed then, or when the stream
/// is dropped.
pub struct VisualizationStream<A: Agent = Model> {
    agent: A,
    env: BoxedVecEnv,
    token: CancellationToken,
    observation: Option<Buffer>,
    step: usize,
    deterministic: bool,
}

impl<A: Agent> VisualizationStream<A> {
    pub fn new(agent: A, env: BoxedVecEnv, token: CancellationToken, deterministic: bool) -> Self {
        Self {
            agent,
            env,
            token,
            observation: None,
            step: 0,
            deterministic,
        }
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    fn advance(&mut self) -> Result<Frame> {
        let observation = match self.observation.take() {
            Some(observation) => observation,
            None => self
                .env
                .reset()?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("environment returned no observation"))?,
        };
        let action = self.agent.predict(&observation, self.deterministic)?;
        let transition = self
            .env
            .step(vec![action.clone()])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("environment returned no transition"))?;
        self.env.render()?;
        let frame = Frame {
            step: self.step,
            observation,
            action,
            reward: transition.reward,
            done: transition.done(),
        };
        self.observation = Some(transition.state);
        self.step += 1;
        Ok(frame)
    }

    fn end(&mut self) {
        if self.env.is_closed() {
            return;
        }
        if let Err(err) = self.env.close() {
            tracing::warn!("failed to close the visualization environment: {err:#}");
        }
        tracing::info!(steps = self.step, "visualization stopped");
    }
}

impl<A: Agent> Iterator for VisualizationStream<A> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.env.is_closed() {
            return None;
        }
        if self.token.is_cancelled() {
            self.end();
            return None;
        }
        match self.advance() {
            Ok(frame) => Some(Ok(frame)),
            Err(err) => {
                self.end();
                Some(Err(err))
            }
        }
    }
}

impl<A: Agent> Drop for VisualizationStream<A> {
    fn drop(&mut self) {
        self.end();
    }
}

impl Runner {
    /// Loads the model at `model_path` and plays it in a rendered environment.
    pub fn visualize(&self, model_path: &Path) -> Result<VisualizationStream> {
        let model = Model::load(
            self.config.agent,
            model_path,
            &self.config,
            None,
            &self.device,
        )?;
        let env = make_single_env(
            &self.registry,
            &self.config.env_id,
            EnvOptions::gui(),
            self.config.seed,
        )?;
        Ok(VisualizationStream::new(
            model,
            env,
            self.token.clone(),
            self.config.visualize.deterministic,
        ))
    }
}
