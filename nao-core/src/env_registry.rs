use crate::{
    env::{BoxedEnv, BoxedExpertEnv, EnvOptions},
    error::ConfigError,
};
use anyhow::Result;
use std::{collections::BTreeMap, sync::Arc};

pub type EnvFactory = Arc<dyn Fn(&EnvOptions) -> Result<BoxedEnv> + Send + Sync>;

pub type ExpertEnvFactory = Arc<dyn Fn(&EnvOptions) -> Result<BoxedExpertEnv> + Send + Sync>;

/// Explicit table of the environments this process can build, keyed by identifier.
#[derive(Clone, Default)]
pub struct EnvRegistry {
    envs: BTreeMap<String, EnvFactory>,
    experts: BTreeMap<String, ExpertEnvFactory>,
}

impl std::fmt::Debug for EnvRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvRegistry")
            .field("envs", &self.envs.keys().collect::<Vec<_>>())
            .field("experts", &self.experts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EnvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&EnvOptions) -> Result<BoxedEnv> + Send + Sync + 'static,
    {
        self.envs.insert(id.into(), Arc::new(factory));
        self
    }

    /// Registers an environment that also carries a scripted expert. It becomes available
    /// through both [`EnvRegistry::make`] and [`EnvRegistry::make_expert`].
    pub fn register_expert<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&EnvOptions) -> Result<BoxedExpertEnv> + Send + Sync + 'static,
    {
        let id = id.into();
        let factory: ExpertEnvFactory = Arc::new(factory);
        let plain = factory.clone();
        self.envs.insert(
            id.clone(),
            Arc::new(move |options: &EnvOptions| {
                let env = plain(options)?;
                Ok(Box::new(ExpertAsEnv(env)) as BoxedEnv)
            }),
        );
        self.experts.insert(id, factory);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.envs.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.envs.keys().map(String::as_str)
    }

    pub fn factory(&self, id: &str) -> Result<EnvFactory> {
        self.envs
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEnvironment(id.to_owned()).into())
    }

    pub fn make(&self, id: &str, options: &EnvOptions) -> Result<BoxedEnv> {
        let factory = self.factory(id)?;
        factory(options)
    }

    pub fn make_expert(&self, id: &str, options: &EnvOptions) -> Result<BoxedExpertEnv> {
        match self.experts.get(id) {
            Some(factory) => factory(options),
            None if self.envs.contains_key(id) => Err(ConfigError::NoExpert(id.to_owned()).into()),
            None => Err(ConfigError::UnknownEnvironment(id.to_owned()).into()),
        }
    }
}

struct ExpertAsEnv(BoxedExpertEnv);

impl crate::env::Env for ExpertAsEnv {
    fn reset(&mut self, seed: u64) -> Result<crate::tensor::Buffer> {
        self.0.reset(seed)
    }

    fn step(&mut self, action: crate::tensor::Buffer) -> Result<crate::env::SnapShot> {
        self.0.step(action)
    }

    fn env_description(&self) -> crate::env::EnvironmentDescription {
        self.0.env_description()
    }

    fn render(&mut self) -> Result<()> {
        self.0.render()
    }

    fn close(&mut self) -> Result<()> {
        self.0.close()
    }
}
