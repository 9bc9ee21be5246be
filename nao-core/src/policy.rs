use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureExtraction {
    /// Fully connected layers on the flat observation.
    #[default]
    Mlp,
}

/// Layout of the hidden layers shared by every network an agent builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyNetwork {
    pub hidden_layers: Vec<usize>,
    #[serde(default)]
    pub feature_extraction: FeatureExtraction,
}

impl PolicyNetwork {
    pub fn mlp(hidden_layers: Vec<usize>) -> Result<Self, ConfigError> {
        let network = Self {
            hidden_layers,
            feature_extraction: FeatureExtraction::Mlp,
        };
        network.validate()?;
        Ok(network)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden_layers.is_empty() {
            return Err(ConfigError::EmptyNetwork);
        }
        if self.hidden_layers.contains(&0) {
            return Err(ConfigError::Invalid {
                field: "hidden_layers",
                reason: "layer widths must be positive".to_owned(),
            });
        }
        Ok(())
    }
}
