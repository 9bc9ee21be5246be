//! Entry points of a training session: train, record demonstrations, pretrain from them and
//! watch a saved policy. Each driver owns the environment it builds and closes it on every
//! exit path.

mod pretrain;
mod train;
mod visualize;

pub use pretrain::PretrainOutcome;
pub use train::TrainReport;
pub use visualize::{Frame, VisualizationStream};

use crate::{algorithm::Algorithm, config::NaoConfig};
use anyhow::Result;
use candle_core::Device;
use nao_core::{
    cancel::CancellationToken, env_registry::EnvRegistry, expert::TRAJ_EXTENSION,
};
use std::path::{Path, PathBuf};

/// `<dir>/<agent>_<suffix>`, the name every checkpoint is saved under.
pub fn checkpoint_name(dir: &Path, algorithm: Algorithm, suffix: &str) -> PathBuf {
    dir.join(format!("{}_{suffix}", algorithm.name()))
}

/// `<pretrain_dir>/<name>.traj`.
pub fn dataset_path(pretrain_dir: &Path, name: &str) -> PathBuf {
    let path = pretrain_dir.join(name);
    if path.extension().is_some_and(|ext| ext == TRAJ_EXTENSION) {
        path
    } else {
        pretrain_dir.join(format!("{name}.{TRAJ_EXTENSION}"))
    }
}

/// Outcome of a driver whose environment was closed afterwards. The driver's own error wins
/// over the close error.
fn finish<T>(work: Result<T>, close: Result<()>) -> Result<T> {
    match (work, close) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), close) => {
            if let Err(close_err) = close {
                tracing::warn!("closing the environment failed as well: {close_err:#}");
            }
            Err(err)
        }
    }
}

pub struct Runner {
    config: NaoConfig,
    registry: EnvRegistry,
    token: CancellationToken,
    device: Device,
}

impl Runner {
    pub fn new(config: NaoConfig, registry: EnvRegistry, token: CancellationToken) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        Ok(Self {
            config,
            registry,
            token,
            device,
        })
    }

    pub fn config(&self) -> &NaoConfig {
        &self.config
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn dataset_path(&self, name: &str) -> PathBuf {
        dataset_path(&self.config.paths.pretrain, name)
    }
}

#[cfg(test)]
mod test {
    use super::{checkpoint_name, dataset_path, finish};
    use crate::algorithm::Algorithm;
    use anyhow::anyhow;
    use std::path::{Path, PathBuf};

    #[test]
    fn names_follow_the_directory_layout() {
        assert_eq!(
            checkpoint_name(Path::new("models/models_nao"), Algorithm::Ddpg, "2000000"),
            PathBuf::from("models/models_nao/DDPG_2000000")
        );
        assert_eq!(
            dataset_path(Path::new("pretrain/pretrain_nao"), "walk"),
            PathBuf::from("pretrain/pretrain_nao/walk.traj")
        );
        assert_eq!(
            dataset_path(Path::new("pretrain"), "walk.traj"),
            PathBuf::from("pretrain/walk.traj")
        );
    }

    #[test]
    fn work_error_takes_precedence() {
        let err = finish::<()>(Err(anyhow!("learn")), Err(anyhow!("close"))).unwrap_err();
        assert_eq!(err.to_string(), "learn");
        let err = finish(Ok(1), Err(anyhow!("close"))).unwrap_err();
        assert_eq!(err.to_string(), "close");
        assert_eq!(finish(Ok(1), Ok(())).unwrap(), 1);
    }
}
