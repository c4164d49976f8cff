//! Model configuration for the Perceiver architecture.
//!
//! The configuration carries every hyperparameter the architecture modules
//! need: latent array shape, attention head counts, block structure, and the
//! modality-specific sizes used by the task models. Defaults match the
//! pretrained language-model checkpoints.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::{PerceiverError, Result};

/// Activation used inside the position-wise feed-forward blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    Gelu,
    Relu,
    Silu,
}

impl HiddenAct {
    pub fn apply(&self, xs: &candle_core::Tensor) -> candle_core::Result<candle_core::Tensor> {
        match self {
            HiddenAct::Gelu => xs.gelu_erf(),
            HiddenAct::Relu => xs.relu(),
            HiddenAct::Silu => xs.silu(),
        }
    }
}

/// Which side's width the cross-attention q/k projections default to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossAttentionShape {
    /// Default qk_channels to the query width
    Q,
    /// Default qk_channels to the key/value width
    Kv,
}

/// Root configuration for all Perceiver models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceiverConfig {
    /// Number of latent tokens in the learned latent array
    pub num_latents: usize,

    /// Channel width of the latent array
    pub d_latents: usize,

    /// Channel width the preprocessed inputs must have
    pub d_model: usize,

    /// How many times the self-attention block is applied (weight-shared)
    pub num_blocks: usize,

    /// Number of self-attention layers per block
    pub num_self_attends_per_block: usize,

    /// Head count for latent self-attention
    pub num_self_attention_heads: usize,

    /// Head count for the encoder cross-attention
    pub num_cross_attention_heads: usize,

    /// Query/key projection width; defaults to the query width when absent
    #[serde(default)]
    pub qk_channels: Option<usize>,

    /// Value projection width; defaults to qk_channels when absent
    #[serde(default)]
    pub v_channels: Option<usize>,

    /// Default width rule for cross-attention q/k projections
    #[serde(default = "default_cross_attention_shape")]
    pub cross_attention_shape_for_attention: CrossAttentionShape,

    /// Feed-forward widening factor for self-attention layers
    pub self_attention_widening_factor: usize,

    /// Feed-forward widening factor for cross-attention layers
    pub cross_attention_widening_factor: usize,

    /// Feed-forward activation
    #[serde(default = "default_hidden_act")]
    pub hidden_act: HiddenAct,

    /// Dropout probability on attention weights
    #[serde(default)]
    pub attention_probs_dropout_prob: f32,

    /// Stddev of the truncated-normal weight initializer
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,

    /// Whether the encoder cross-attention adds a residual from the latents
    #[serde(default = "default_true")]
    pub use_query_residual: bool,

    /// Vocabulary size (text models)
    pub vocab_size: usize,

    /// Maximum text sequence length
    pub max_position_embeddings: usize,

    /// Input image side length (image models)
    pub image_size: usize,

    /// Training resolution (height, width) for optical flow
    pub train_size: (usize, usize),

    /// Number of video frames (multimodal autoencoding)
    pub num_frames: usize,

    /// Audio samples per video frame
    pub audio_samples_per_frame: usize,

    /// Audio samples folded into one token
    pub samples_per_patch: usize,

    /// Video decoder output shape (time, height, width)
    pub output_shape: Vec<usize>,

    /// Number of classification labels
    pub num_labels: usize,

    /// Whether forward calls collect attention maps by default
    #[serde(default)]
    pub output_attentions: bool,

    /// Whether forward calls collect per-layer hidden states by default
    #[serde(default)]
    pub output_hidden_states: bool,
}

fn default_cross_attention_shape() -> CrossAttentionShape {
    CrossAttentionShape::Kv
}

fn default_hidden_act() -> HiddenAct {
    HiddenAct::Gelu
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_true() -> bool {
    true
}

impl Default for PerceiverConfig {
    fn default() -> Self {
        Self {
            num_latents: 256,
            d_latents: 1280,
            d_model: 768,
            num_blocks: 1,
            num_self_attends_per_block: 26,
            num_self_attention_heads: 8,
            num_cross_attention_heads: 8,
            qk_channels: None,
            v_channels: None,
            cross_attention_shape_for_attention: CrossAttentionShape::Kv,
            self_attention_widening_factor: 1,
            cross_attention_widening_factor: 1,
            hidden_act: HiddenAct::Gelu,
            attention_probs_dropout_prob: 0.1,
            initializer_range: 0.02,
            use_query_residual: true,
            vocab_size: 262,
            max_position_embeddings: 2048,
            image_size: 56,
            train_size: (368, 496),
            num_frames: 16,
            audio_samples_per_frame: 1920,
            samples_per_patch: 16,
            output_shape: vec![16, 224, 224],
            num_labels: 1000,
            output_attentions: false,
            output_hidden_states: false,
        }
    }
}

impl PerceiverConfig {
    /// Load a configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PerceiverError::config(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| PerceiverError::config(format!("failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast construction-time checks
    pub fn validate(&self) -> Result<()> {
        if self.num_latents == 0 {
            return Err(PerceiverError::config("num_latents must be positive"));
        }
        if self.num_blocks == 0 || self.num_self_attends_per_block == 0 {
            return Err(PerceiverError::config(
                "num_blocks and num_self_attends_per_block must be positive",
            ));
        }
        if self.d_latents % self.num_self_attention_heads != 0 {
            return Err(PerceiverError::config(format!(
                "d_latents ({}) must be divisible by num_self_attention_heads ({})",
                self.d_latents, self.num_self_attention_heads
            )));
        }
        if self.d_latents % self.num_cross_attention_heads != 0 {
            return Err(PerceiverError::config(format!(
                "d_latents ({}) must be divisible by num_cross_attention_heads ({})",
                self.d_latents, self.num_cross_attention_heads
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PerceiverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_latents, 256);
        assert_eq!(config.d_latents, 1280);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = PerceiverConfig {
            d_latents: 10,
            num_self_attention_heads: 3,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = PerceiverConfig {
            num_latents: 32,
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: PerceiverConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.num_latents, 32);
        assert_eq!(back.hidden_act, HiddenAct::Gelu);
    }
}
