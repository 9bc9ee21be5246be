use crate::{
    algorithm::Algorithm,
    config::NaoConfig,
    model::{Model, ModelInputs},
};
use anyhow::Result;
use candle_core::Device;
use chrono::{DateTime, Local};
use nao_core::{
    env::{EnvOptions, EnvironmentDescription},
    env_registry::EnvRegistry,
    error::ConfigError,
    expert::ExpertDataset,
    vec_env::{
        BoxedVecEnv, VecEnvKind,
        dummy_vec_env::DummyVecEnv,
        subproc_vec_env::{SubprocOptions, SubprocVecEnv},
    },
};
use std::path::{Path, PathBuf};

/// `<logs>/<tag>Agent/<YYYYmmdd-HHMMSS>`. Only the path is computed here.
pub fn log_dir(logs: &Path, tag: &str, at: DateTime<Local>) -> PathBuf {
    logs.join(format!("{tag}Agent"))
        .join(at.format("%Y%m%d-%H%M%S").to_string())
}

/// Number of workers `algorithm` is trained with when `requested` were configured.
pub fn worker_count(algorithm: Algorithm, requested: usize) -> usize {
    if requested > 1 && !algorithm.spec().supports_vectorized {
        tracing::warn!(
            %algorithm,
            requested,
            "algorithm trains on a single environment, ignoring num_env"
        );
        1
    } else {
        requested.max(1)
    }
}

/// The training environment for `algorithm`: `num_env` workers seeded `seed..seed + num_env`,
/// in this process or in worker processes as configured.
pub fn make_env(
    registry: &EnvRegistry,
    config: &NaoConfig,
    algorithm: Algorithm,
    options: EnvOptions,
    seed: u64,
) -> Result<BoxedVecEnv> {
    let num_envs = worker_count(algorithm, config.num_env);
    let env: BoxedVecEnv = match config.vec_env {
        VecEnvKind::Subproc if num_envs > 1 => {
            // fail before spawning anything for ids the workers would not know either
            registry.factory(&config.env_id)?;
            let worker = match &config.worker {
                Some(worker) => worker.clone(),
                None => SubprocOptions::default_worker()?,
            };
            Box::new(SubprocVecEnv::spawn(&SubprocOptions {
                worker,
                env_id: config.env_id.clone(),
                num_envs,
                base_seed: seed,
                gui: options.gui,
                connect_timeout: SubprocOptions::DEFAULT_CONNECT_TIMEOUT,
            })?)
        }
        _ => {
            let factory = registry.factory(&config.env_id)?;
            Box::new(DummyVecEnv::from_factory(&factory, &options, num_envs, seed)?)
        }
    };
    tracing::debug!(env = %config.env_id, num_envs, seed, kind = ?config.vec_env, "environment ready");
    Ok(env)
}

/// One interactive environment, as used for watching a trained policy.
pub fn make_single_env(
    registry: &EnvRegistry,
    env_id: &str,
    options: EnvOptions,
    seed: u64,
) -> Result<BoxedVecEnv> {
    let env = registry.make(env_id, &options)?;
    Ok(Box::new(DummyVecEnv::single(env, seed)))
}

pub struct BuiltModel {
    pub model: Model,
    pub log_dir: PathBuf,
}

/// Builds a fresh `algorithm` agent for `env_description` through the algorithm table.
pub fn build_model(
    algorithm: Algorithm,
    env_description: &EnvironmentDescription,
    dataset: Option<ExpertDataset>,
    tag: &str,
    config: &NaoConfig,
    device: &Device,
) -> Result<BuiltModel> {
    let spec = algorithm.spec();
    if spec.requires_dataset && dataset.is_none() {
        return Err(ConfigError::MissingDataset(spec.name.to_owned()).into());
    }
    let network = config.policy_network(algorithm);
    network.validate()?;
    let model = (spec.build)(ModelInputs {
        env_description,
        network: &network,
        dataset,
        config,
        device,
    })?;
    let log_dir = log_dir(&config.paths.logs, tag, Local::now());
    tracing::info!(
        %algorithm,
        hidden_layers = ?network.hidden_layers,
        log_dir = %log_dir.display(),
        "model built"
    );
    Ok(BuiltModel { model, log_dir })
}

#[cfg(test)]
mod test {
    use super::{log_dir, worker_count};
    use crate::algorithm::Algorithm;
    use chrono::{Local, TimeZone};
    use std::path::{Path, PathBuf};

    #[test]
    fn log_dir_is_stamped_with_the_run_start() {
        let at = Local.with_ymd_and_hms(2019, 5, 3, 14, 7, 9).unwrap();
        assert_eq!(
            log_dir(Path::new("logs/nao_env"), "PPO2", at),
            PathBuf::from("logs/nao_env/PPO2Agent/20190503-140709")
        );
    }

    #[test]
    fn single_instance_algorithms_fall_back_to_one_worker() {
        assert_eq!(worker_count(Algorithm::Ddpg, 8), 1);
        assert_eq!(worker_count(Algorithm::Ppo2, 8), 8);
        assert_eq!(worker_count(Algorithm::Gail, 0), 1);
    }
}
