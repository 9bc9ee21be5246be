use super::{Runner, checkpoint_name, finish};
use crate::{
    algorithm::Algorithm,
    config::TrainingSchedule,
    factory::{BuiltModel, build_model, make_env},
    hooks::TrainingHooks,
    model::Model,
    progress::ProgressLogger,
};
use anyhow::Result;
use nao_core::{
    agents::{Agent, LearnOutcome},
    env::EnvOptions,
    error::ConfigError,
    expert::ExpertDataset,
    rng::set_seed,
    vec_env::{BoxedVecEnv, VecEnv},
};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub outcome: LearnOutcome,
    pub timesteps: usize,
    /// Every checkpoint written, the final model last.
    pub checkpoints: Vec<PathBuf>,
    pub log_dir: PathBuf,
}

impl Runner {
    /// Trains the configured agent for `num_timesteps` and saves it under `model_path`. An
    /// interrupt stops learning early and the model is saved as it is.
    pub fn train(&self, num_timesteps: usize, seed: u64, model_path: &Path) -> Result<TrainReport> {
        set_seed(seed);
        let algorithm = self.config.agent;
        let dataset = self.training_dataset(algorithm)?;
        let options = EnvOptions {
            gui: self.config.gui,
        };
        let mut env = make_env(&self.registry, &self.config, algorithm, options, seed)?;
        let result = self.train_on(&mut env, algorithm, dataset, num_timesteps, model_path);
        let closed = env.close();
        finish(result, closed)
    }

    /// The expert dataset `algorithm` imitates, checked before any environment is started.
    fn training_dataset(&self, algorithm: Algorithm) -> Result<Option<ExpertDataset>> {
        let spec = algorithm.spec();
        if !spec.requires_dataset {
            return Ok(None);
        }
        let Some(name) = &self.config.expert_dataset else {
            return Err(ConfigError::MissingDataset(spec.name.to_owned()).into());
        };
        let dataset = ExpertDataset::load(&self.dataset_path(name), self.config.dataset.clone())?;
        Ok(Some(dataset))
    }

    fn train_on(
        &self,
        env: &mut BoxedVecEnv,
        algorithm: Algorithm,
        dataset: Option<ExpertDataset>,
        num_timesteps: usize,
        model_path: &Path,
    ) -> Result<TrainReport> {
        let description = env.env_description();
        let BuiltModel { mut model, log_dir } = build_model(
            algorithm,
            &description,
            dataset.clone(),
            algorithm.name(),
            &self.config,
            &self.device,
        )?;
        let mut hooks =
            TrainingHooks::new(self.token.clone()).with_progress(ProgressLogger::new(&log_dir));
        let mut checkpoints: Vec<PathBuf> = vec![];
        // timesteps of the newest checkpoint
        let mut saved_at = None;
        let outcome = match self.config.schedule {
            TrainingSchedule::Single => model.learn(env.as_mut(), num_timesteps, &mut hooks)?,
            TrainingSchedule::Incremental { increment } => {
                let mut outcome = LearnOutcome::Completed;
                while model.num_timesteps() < num_timesteps {
                    if let Some(previous) = checkpoints.last() {
                        model = Model::load(
                            algorithm,
                            previous,
                            &self.config,
                            dataset.clone(),
                            &self.device,
                        )?;
                    }
                    outcome = model.learn(env.as_mut(), increment, &mut hooks)?;
                    if outcome == LearnOutcome::Interrupted {
                        break;
                    }
                    let reached = model.num_timesteps();
                    let name = checkpoint_name(model_path, algorithm, &reached.to_string());
                    checkpoints.push(model.save(&name)?);
                    saved_at = Some(reached);
                }
                outcome
            }
        };
        if outcome == LearnOutcome::Interrupted {
            tracing::warn!(
                timesteps = model.num_timesteps(),
                "training interrupted, saving the model as it is"
            );
        }
        let reached = model.num_timesteps();
        if saved_at != Some(reached) {
            let name = checkpoint_name(model_path, algorithm, &reached.to_string());
            checkpoints.push(model.save(&name)?);
        }
        tracing::info!(
            path = %checkpoints.last().map(|p| p.display().to_string()).unwrap_or_default(),
            "model saved"
        );
        Ok(TrainReport {
            outcome,
            timesteps: model.num_timesteps(),
            checkpoints,
            log_dir,
        })
    }
}
