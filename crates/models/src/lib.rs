//! Burn speaker-classification models for voicemap.
//!
//! - `BaselineClassifier`: four convolutional blocks, pooled into a linear embedding.
//! - `ResidualClassifier`: ResNet-style stages of basic residual blocks.
//!
//! Both take `[batch, rows, time]` inputs and run either 1-D convolutions over
//! time (rows are channels) or 2-D convolutions over a single-channel
//! `rows x time` image; see [`ConvDim`].

pub mod baseline;
pub mod conv;
pub mod residual;

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use baseline::BaselineClassifier;
pub use conv::{ConvDim, WindowMaxPool};
pub use residual::ResidualClassifier;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("unsupported convolution dimensionality {0} (expected 1 or 2)")]
    UnsupportedDim(usize),
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Baseline,
    Resnet,
}

/// Everything needed to rebuild a classifier; stored next to checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub architecture: Architecture,
    pub in_channels: usize,
    pub filters: usize,
    pub num_classes: usize,
    pub dim: usize,
    /// Embedding width of the baseline model.
    pub embedding_dim: usize,
    /// Residual blocks per stage of the residual model.
    pub layers: [usize; 4],
    /// Additive margin subtracted from the target logit during training.
    #[serde(default)]
    pub margin: f64,
}

impl ClassifierConfig {
    pub fn baseline(in_channels: usize, filters: usize, num_classes: usize, dim: usize) -> Self {
        Self {
            architecture: Architecture::Baseline,
            in_channels,
            filters,
            num_classes,
            dim,
            embedding_dim: 256,
            layers: [2, 2, 2, 2],
            margin: 0.0,
        }
    }

    pub fn residual(in_channels: usize, filters: usize, num_classes: usize, dim: usize) -> Self {
        Self {
            architecture: Architecture::Resnet,
            ..Self::baseline(in_channels, filters, num_classes, dim)
        }
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    pub fn conv_dim(&self) -> Result<ConvDim, ModelError> {
        ConvDim::try_from(self.dim)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let dim = self.conv_dim()?;
        if dim == ConvDim::Two && self.in_channels != 1 {
            return Err(ModelError::InvalidConfig(format!(
                "2-D models take single-channel input, got in_channels={}",
                self.in_channels
            )));
        }
        for (name, value) in [
            ("in_channels", self.in_channels),
            ("filters", self.filters),
            ("num_classes", self.num_classes),
            ("embedding_dim", self.embedding_dim),
        ] {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.layers.contains(&0) {
            return Err(ModelError::InvalidConfig(
                "every residual stage needs at least one block".into(),
            ));
        }
        Ok(())
    }

    /// Width of the vectors returned by [`SpeakerModel::embed`].
    pub fn embedding_width(&self) -> usize {
        match self.architecture {
            Architecture::Baseline => self.embedding_dim,
            Architecture::Resnet => self.filters * 8,
        }
    }
}

/// Shared interface of the speaker classifiers.
pub trait SpeakerModel<B: Backend>: Module<B> + Sized {
    /// Build a freshly initialised model; `config` must have passed
    /// [`ClassifierConfig::validate`].
    fn init(config: &ClassifierConfig, device: &B::Device) -> Self;

    /// `[batch, rows, time]` to `[batch, embedding]`.
    fn embed(&self, input: Tensor<B, 3>) -> Tensor<B, 2>;

    /// Logits from embeddings.
    fn classify(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2>;

    fn margin(&self) -> f64 {
        0.0
    }

    fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        self.classify(self.embed(input))
    }

    /// Training forward pass: logits with the margin subtracted at each target class.
    fn forward_with_targets(&self, input: Tensor<B, 3>, targets: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let logits = self.forward(input);
        let margin = self.margin();
        if margin <= 0.0 {
            return logits;
        }
        let [_, classes] = logits.dims();
        let mask = targets.one_hot::<2>(classes).float();
        logits - mask.mul_scalar(margin)
    }
}

pub mod prelude {
    pub use super::{
        Architecture, BaselineClassifier, ClassifierConfig, ConvDim, ModelError,
        ResidualClassifier, SpeakerModel,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(ClassifierConfig::baseline(161, 32, 10, 1).validate().is_ok());
        assert_eq!(
            ClassifierConfig::baseline(161, 32, 10, 3).validate(),
            Err(ModelError::UnsupportedDim(3))
        );
        assert!(ClassifierConfig::residual(161, 32, 10, 2).validate().is_err());
        assert!(ClassifierConfig::residual(1, 32, 10, 2).validate().is_ok());
        assert!(ClassifierConfig::baseline(1, 0, 10, 1).validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = ClassifierConfig::residual(1, 16, 40, 2).with_margin(0.2);
        let text = serde_json::to_string(&cfg).unwrap();
        assert!(text.contains("\"resnet\""));
        let back: ClassifierConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.embedding_width(), 128);
    }
}
