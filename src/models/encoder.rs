//! The Perceiver encoder: one cross-attention from the latent array into
//! the input tokens, followed by a block of latent self-attention layers.
//!
//! Depth comes from applying the same self-attention block `num_blocks`
//! times. The block is a single owned layer stack, so weight sharing across
//! repetitions is structural and the parameter count is independent of the
//! effective depth.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::PerceiverConfig;
use crate::core::{PerceiverError, Result};
use crate::models::attention::{LayerParams, PerceiverLayer};

/// Encoder output with optionally collected intermediate state
pub struct EncoderOutput {
    pub last_hidden_state: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

pub struct PerceiverEncoder {
    cross_attention: PerceiverLayer,
    self_attends: Vec<PerceiverLayer>,
    num_blocks: usize,
}

impl PerceiverEncoder {
    /// `kv_dim` is the width of the preprocessed inputs the latents attend
    /// to (normally `config.d_model`).
    pub fn new(config: &PerceiverConfig, kv_dim: usize, vb: VarBuilder) -> Result<Self> {
        if config.d_latents % config.num_self_attention_heads != 0 {
            return Err(PerceiverError::config(format!(
                "d_latents ({}) must be divisible by num_self_attention_heads ({})",
                config.d_latents, config.num_self_attention_heads
            )));
        }
        if config.d_latents % config.num_cross_attention_heads != 0 {
            return Err(PerceiverError::config(format!(
                "d_latents ({}) must be divisible by num_cross_attention_heads ({})",
                config.d_latents, config.num_cross_attention_heads
            )));
        }

        let cross_params = LayerParams {
            is_cross_attention: true,
            qk_channels: config.qk_channels,
            v_channels: config.v_channels,
            num_heads: config.num_cross_attention_heads,
            q_dim: config.d_latents,
            kv_dim,
            widening_factor: config.cross_attention_widening_factor,
            use_query_residual: config.use_query_residual,
        };
        let cross_attention = PerceiverLayer::new(config, &cross_params, vb.pp("cross_attention"))?;

        // One block of self-attention layers; depth is obtained by applying
        // this block more than once.
        let self_params = LayerParams::self_attention(config, config.d_latents);
        let mut self_attends = Vec::with_capacity(config.num_self_attends_per_block);
        for i in 0..config.num_self_attends_per_block {
            self_attends.push(PerceiverLayer::new(
                config,
                &self_params,
                vb.pp(format!("self_attends.{i}")),
            )?);
        }

        Ok(Self {
            cross_attention,
            self_attends,
            num_blocks: config.num_blocks,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        inputs: &Tensor,
        inputs_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
        output_hidden_states: bool,
    ) -> Result<EncoderOutput> {
        let mut all_hidden_states = output_hidden_states.then(Vec::new);
        let mut all_self_attentions = output_attentions.then(Vec::new);
        let mut all_cross_attentions = output_attentions.then(Vec::new);

        // Latents attend to the preprocessed inputs once.
        let (mut hidden_states, cross_attn) = self.cross_attention.forward(
            hidden_states,
            Some(inputs),
            inputs_mask,
            None,
            output_attentions,
        )?;
        if let (Some(all), Some(attn)) = (all_cross_attentions.as_mut(), cross_attn) {
            all.push(attn);
        }

        // Apply the shared block of self-attention layers num_blocks times.
        for _ in 0..self.num_blocks {
            for layer in &self.self_attends {
                if let Some(all) = all_hidden_states.as_mut() {
                    all.push(hidden_states.clone());
                }
                let (next, attn) =
                    layer.forward(&hidden_states, None, None, head_mask, output_attentions)?;
                hidden_states = next;
                if let (Some(all), Some(attn)) = (all_self_attentions.as_mut(), attn) {
                    all.push(attn);
                }
            }
            if let Some(all) = all_hidden_states.as_mut() {
                all.push(hidden_states.clone());
            }
        }

        Ok(EncoderOutput {
            last_hidden_state: hidden_states,
            hidden_states: all_hidden_states,
            attentions: all_self_attentions,
            cross_attentions: all_cross_attentions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn small_config(num_blocks: usize) -> PerceiverConfig {
        PerceiverConfig {
            num_latents: 4,
            d_latents: 16,
            d_model: 12,
            num_blocks,
            num_self_attends_per_block: 2,
            num_self_attention_heads: 2,
            num_cross_attention_heads: 2,
            attention_probs_dropout_prob: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_parameter_count_independent_of_num_blocks() {
        let device = Device::Cpu;
        let counts: Vec<usize> = [1usize, 4]
            .iter()
            .map(|&num_blocks| {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
                let config = small_config(num_blocks);
                PerceiverEncoder::new(&config, config.d_model, vb).unwrap();
                varmap.all_vars().len()
            })
            .collect();
        assert_eq!(
            counts[0], counts[1],
            "self-attention block must be weight-shared across repetitions"
        );
    }

    #[test]
    fn test_encoder_forward_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = small_config(2);
        let encoder = PerceiverEncoder::new(&config, config.d_model, vb).unwrap();

        let latents = Tensor::randn(0f32, 1.0, (2, 4, 16), &device).unwrap();
        let inputs = Tensor::randn(0f32, 1.0, (2, 10, 12), &device).unwrap();
        let out = encoder
            .forward(&latents, &inputs, None, None, true, true)
            .unwrap();

        assert_eq!(out.last_hidden_state.dims(), &[2, 4, 16]);
        // 2 blocks x 2 layers of self-attention maps, plus 1 cross map.
        assert_eq!(out.attentions.as_ref().unwrap().len(), 4);
        assert_eq!(out.cross_attentions.as_ref().unwrap().len(), 1);
        // One state before each layer plus one at the end of each block.
        assert_eq!(out.hidden_states.as_ref().unwrap().len(), 6);
    }

    #[test]
    fn test_indivisible_latent_width_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = PerceiverConfig {
            d_latents: 15,
            num_self_attention_heads: 2,
            ..small_config(1)
        };
        assert!(PerceiverEncoder::new(&config, config.d_model, vb).is_err());
    }
}
