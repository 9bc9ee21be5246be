// algorithm table + drivers built on top of it
pub mod algorithm;
pub mod config;
pub mod drivers;
pub mod factory;
pub mod hooks;
pub mod model;
pub mod progress;

use config::NaoConfig;
use nao_core::env_registry::EnvRegistry;

/// The environments a run with `config` can ask for.
#[cfg(feature = "python")]
pub fn default_registry(config: &NaoConfig) -> EnvRegistry {
    nao_gym::default_registry([config.env_id.as_str(), config.expert_env_id.as_str()])
}

#[cfg(not(feature = "python"))]
pub fn default_registry(config: &NaoConfig) -> EnvRegistry {
    tracing::warn!(
        env = %config.env_id,
        "built without the python feature, no environment is registered"
    );
    EnvRegistry::new()
}
