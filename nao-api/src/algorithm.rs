use crate::model::{self, Model, ModelInputs};
use anyhow::Result;
use nao_core::{
    error::ConfigError,
    policy::{FeatureExtraction, PolicyNetwork},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "PPO2")]
    Ppo2,
    #[serde(rename = "DDPG")]
    Ddpg,
    /// Adversarial imitation of an expert dataset with a PPO2 generator.
    #[serde(rename = "GAIL")]
    Gail,
}

/// Everything that differs between algorithms, looked up instead of branched on.
pub struct AlgorithmSpec {
    pub algorithm: Algorithm,
    pub name: &'static str,
    pub hidden_layers: &'static [usize],
    pub requires_dataset: bool,
    /// Whether the learner can step several workers at once.
    pub supports_vectorized: bool,
    pub build: fn(ModelInputs<'_>) -> Result<Model>,
}

impl fmt::Debug for AlgorithmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmSpec")
            .field("name", &self.name)
            .field("hidden_layers", &self.hidden_layers)
            .field("requires_dataset", &self.requires_dataset)
            .field("supports_vectorized", &self.supports_vectorized)
            .finish()
    }
}

static ALGORITHMS: [AlgorithmSpec; 3] = [
    AlgorithmSpec {
        algorithm: Algorithm::Ppo2,
        name: nao_agents::ppo::PPO2,
        hidden_layers: &[1024, 512, 512, 64],
        requires_dataset: false,
        supports_vectorized: true,
        build: model::build_ppo2,
    },
    AlgorithmSpec {
        algorithm: Algorithm::Ddpg,
        name: nao_agents::ddpg::DDPG,
        hidden_layers: &[1024, 512],
        requires_dataset: false,
        supports_vectorized: false,
        build: model::build_ddpg,
    },
    AlgorithmSpec {
        algorithm: Algorithm::Gail,
        name: nao_agents::gail::GAIL,
        hidden_layers: &[1024, 512, 512, 64],
        requires_dataset: true,
        supports_vectorized: true,
        build: model::build_gail,
    },
];

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Ppo2, Algorithm::Ddpg, Algorithm::Gail];

    pub fn spec(self) -> &'static AlgorithmSpec {
        &ALGORITHMS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Network layout the algorithm is trained with unless the configuration overrides it.
    pub fn policy_network(self) -> PolicyNetwork {
        PolicyNetwork {
            hidden_layers: self.spec().hidden_layers.to_vec(),
            feature_extraction: FeatureExtraction::Mlp,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownAlgorithm(s.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use super::Algorithm;

    #[test]
    fn table_is_indexed_by_variant() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.spec().algorithm, algorithm);
            assert_eq!(algorithm.name().parse::<Algorithm>().unwrap(), algorithm);
        }
    }
}
