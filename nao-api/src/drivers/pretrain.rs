use super::{Runner, checkpoint_name, finish};
use crate::{
    algorithm::Algorithm,
    factory::{BuiltModel, build_model, make_env},
};
use anyhow::Result;
use nao_core::{
    agents::{Agent, PretrainReport},
    env::{Env, EnvOptions},
    expert::{ExpertDataset, TRAJ_EXTENSION, generate_expert_traj},
    rng::set_seed,
    vec_env::{BoxedVecEnv, VecEnv},
};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct PretrainOutcome {
    pub report: PretrainReport,
    pub checkpoint: PathBuf,
}

impl Runner {
    /// Plays the expert environment's scripted controller and records its episodes as the
    /// dataset `dataset_name`.
    pub fn collect_pretrained_dataset(&self, dataset_name: &str) -> Result<PathBuf> {
        let collect = &self.config.collect;
        let options = EnvOptions { gui: collect.gui };
        let mut env = self
            .registry
            .make_expert(&self.config.expert_env_id, &options)?;
        let path = self.dataset_path(dataset_name);
        let result = generate_expert_traj(&mut env, &path, collect.n_episodes, collect.seed);
        let closed = env.close();
        let trajectories = finish(result, closed)?;
        tracing::info!(
            path = %path.display(),
            episodes = trajectories.num_episodes(),
            transitions = trajectories.len(),
            "demonstrations recorded"
        );
        Ok(path)
    }

    /// Behaviour clones a fresh agent on the dataset `dataset_name` and saves it as
    /// `<models>/<AGENT>_<dataset_name>`.
    pub fn pretrained_model_and_save(&self, dataset_name: &str) -> Result<PretrainOutcome> {
        set_seed(self.config.seed);
        let algorithm = self.config.agent;
        let dataset = ExpertDataset::load(
            &self.dataset_path(dataset_name),
            self.config.dataset.clone(),
        )?;
        let mut env = make_env(
            &self.registry,
            &self.config,
            algorithm,
            EnvOptions::headless(),
            self.config.seed,
        )?;
        let result = self.pretrain_on(&env, algorithm, dataset, dataset_name);
        let closed = env.close();
        finish(result, closed)
    }

    fn pretrain_on(
        &self,
        env: &BoxedVecEnv,
        algorithm: Algorithm,
        dataset: ExpertDataset,
        dataset_name: &str,
    ) -> Result<PretrainOutcome> {
        let description = env.env_description();
        let imitation_dataset = algorithm
            .spec()
            .requires_dataset
            .then(|| dataset.clone());
        let BuiltModel { mut model, .. } = build_model(
            algorithm,
            &description,
            imitation_dataset,
            algorithm.name(),
            &self.config,
            &self.device,
        )?;
        let report = model.pretrain(&dataset, &self.config.pretrain)?;
        let name = dataset_name
            .strip_suffix(&format!(".{TRAJ_EXTENSION}"))
            .unwrap_or(dataset_name);
        let checkpoint = model.save(&checkpoint_name(&self.config.paths.models, algorithm, name))?;
        tracing::info!(
            epochs = report.epochs,
            train_loss = report.train_loss,
            val_loss = report.val_loss,
            path = %checkpoint.display(),
            "pretrained model saved"
        );
        Ok(PretrainOutcome { report, checkpoint })
    }
}
