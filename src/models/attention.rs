//! Multi-head {self, cross}-attention and the Perceiver transformer layer.
//!
//! The same block serves three roles: encoder cross-attention from the
//! latent array into the input tokens, latent self-attention, and decoder
//! cross-attention from the output query into the latents. Query and
//! key/value sides may have different widths; the projection widths
//! (`qk_channels`, `v_channels`) are configurable independently of both.

use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, Module, VarBuilder};

use crate::config::{CrossAttentionShape, PerceiverConfig};
use crate::core::{PerceiverError, Result};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Construction parameters for one attention layer
#[derive(Debug, Clone)]
pub struct LayerParams {
    pub is_cross_attention: bool,
    pub qk_channels: Option<usize>,
    pub v_channels: Option<usize>,
    pub num_heads: usize,
    pub q_dim: usize,
    pub kv_dim: usize,
    pub widening_factor: usize,
    pub use_query_residual: bool,
}

impl LayerParams {
    pub fn self_attention(config: &PerceiverConfig, dim: usize) -> Self {
        Self {
            is_cross_attention: false,
            qk_channels: config.qk_channels,
            v_channels: config.v_channels,
            num_heads: config.num_self_attention_heads,
            q_dim: dim,
            kv_dim: dim,
            widening_factor: config.self_attention_widening_factor,
            use_query_residual: true,
        }
    }
}

/// Multi-headed attention core: normalization, projection, scaled
/// dot-product, softmax, head merge
pub struct PerceiverSelfAttention {
    layernorm1: LayerNorm,
    layernorm2: Option<LayerNorm>,
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    num_heads: usize,
    qk_channels_per_head: usize,
    v_channels: usize,
    v_channels_per_head: usize,
}

impl PerceiverSelfAttention {
    pub fn new(
        config: &PerceiverConfig,
        is_cross_attention: bool,
        qk_channels: usize,
        v_channels: usize,
        num_heads: usize,
        q_dim: usize,
        kv_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 {
            return Err(PerceiverError::config("num_heads must be positive"));
        }
        if qk_channels % num_heads != 0 {
            return Err(PerceiverError::config(format!(
                "qk_channels ({}) must be divisible by num_heads ({})",
                qk_channels, num_heads
            )));
        }
        if v_channels % num_heads != 0 {
            return Err(PerceiverError::config(format!(
                "v_channels ({}) must be divisible by num_heads ({})",
                v_channels, num_heads
            )));
        }

        // The key/value side keeps its own normalization only when it is a
        // separate sequence.
        let layernorm1 = layer_norm(q_dim, LAYER_NORM_EPS, vb.pp("layernorm1"))?;
        let layernorm2 = if is_cross_attention {
            Some(layer_norm(kv_dim, LAYER_NORM_EPS, vb.pp("layernorm2"))?)
        } else {
            None
        };

        let query = linear(q_dim, qk_channels, vb.pp("query"))?;
        let key = linear(kv_dim, qk_channels, vb.pp("key"))?;
        let value = linear(kv_dim, v_channels, vb.pp("value"))?;
        let dropout = Dropout::new(config.attention_probs_dropout_prob);

        Ok(Self {
            layernorm1,
            layernorm2,
            query,
            key,
            value,
            dropout,
            num_heads,
            qk_channels_per_head: qk_channels / num_heads,
            v_channels,
            v_channels_per_head: v_channels / num_heads,
        })
    }

    fn transpose_for_scores(&self, x: &Tensor, channels_per_head: usize) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        Ok(x.reshape((batch_size, seq_len, self.num_heads, channels_per_head))?
            .permute((0, 2, 1, 3))?
            .contiguous()?)
    }

    /// Returns the merged-head context and, when requested, the attention
    /// probabilities `[batch, heads, q_len, kv_len]`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        inputs: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let normed_queries = self.layernorm1.forward(hidden_states)?;
        let normed_kv = match (inputs, &self.layernorm2) {
            (Some(inputs), Some(norm)) => norm.forward(inputs)?,
            (Some(inputs), None) => inputs.clone(),
            (None, _) => normed_queries.clone(),
        };

        let queries = self.query.forward(&normed_queries)?;
        let keys = self.key.forward(&normed_kv)?;
        let values = self.value.forward(&normed_kv)?;

        let queries = self.transpose_for_scores(&queries, self.qk_channels_per_head)?;
        let keys = self.transpose_for_scores(&keys, self.qk_channels_per_head)?;
        let values = self.transpose_for_scores(&values, self.v_channels_per_head)?;

        let scale = (self.qk_channels_per_head as f64).sqrt();
        let scores = queries.matmul(&keys.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let scores = (scores / scale)?;
        let scores = match attention_mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };

        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = self.dropout.forward(&probs, false)?;
        let probs = match head_mask {
            Some(mask) => probs.broadcast_mul(mask)?,
            None => probs,
        };

        let context = probs.matmul(&values)?;
        let (batch_size, _, q_len, _) = context.dims4()?;
        let context = context
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch_size, q_len, self.v_channels))?;

        let attentions = output_attentions.then(|| probs.clone());
        Ok((context, attentions))
    }
}

/// Attention module: the attention core plus output projection and the
/// optional residual from the un-normalized query input
pub struct PerceiverAttention {
    inner: PerceiverSelfAttention,
    output: Linear,
    use_query_residual: bool,
}

impl PerceiverAttention {
    pub fn new(config: &PerceiverConfig, params: &LayerParams, vb: VarBuilder) -> Result<Self> {
        // Q and K must share a width; default to the side the configuration
        // selects for cross-attention, and to the query side otherwise.
        let qk_channels = match params.qk_channels {
            Some(c) => c,
            None if params.is_cross_attention => {
                match config.cross_attention_shape_for_attention {
                    CrossAttentionShape::Q => params.q_dim,
                    CrossAttentionShape::Kv => params.kv_dim,
                }
            }
            None => params.q_dim,
        };
        let v_channels = params.v_channels.unwrap_or(qk_channels);

        let inner = PerceiverSelfAttention::new(
            config,
            params.is_cross_attention,
            qk_channels,
            v_channels,
            params.num_heads,
            params.q_dim,
            params.kv_dim,
            vb.pp("self"),
        )?;

        // Cross-attention projects back to the query width so the residual
        // lines up; self-attention keeps the value width.
        let output_channels = if params.is_cross_attention {
            params.q_dim
        } else {
            v_channels
        };
        let output = linear(v_channels, output_channels, vb.pp("output"))?;

        Ok(Self {
            inner,
            output,
            use_query_residual: params.use_query_residual,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        inputs: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (context, attentions) = self.inner.forward(
            hidden_states,
            inputs,
            attention_mask,
            head_mask,
            output_attentions,
        )?;
        let mut attention_output = self.output.forward(&context)?;

        // Omit the residual when query and output semantics differ, e.g.
        // queries are positions and outputs are pixels.
        if self.use_query_residual {
            attention_output = (attention_output + hidden_states)?;
        }
        Ok((attention_output, attentions))
    }
}

/// Position-wise two-layer feed-forward block
pub struct PerceiverMlp {
    dense1: Linear,
    dense2: Linear,
    act: crate::config::HiddenAct,
}

impl PerceiverMlp {
    pub fn new(
        config: &PerceiverConfig,
        input_size: usize,
        widening_factor: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = widening_factor * input_size;
        Ok(Self {
            dense1: linear(input_size, hidden, vb.pp("dense1"))?,
            dense2: linear(hidden, input_size, vb.pp("dense2"))?,
            act: config.hidden_act,
        })
    }

    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense1.forward(hidden_states)?;
        let hidden_states = self.act.apply(&hidden_states)?;
        Ok(self.dense2.forward(&hidden_states)?)
    }
}

/// One transformer layer: attention followed by a feed-forward block, each
/// with its own residual connection
pub struct PerceiverLayer {
    attention: PerceiverAttention,
    layernorm: LayerNorm,
    mlp: PerceiverMlp,
}

impl PerceiverLayer {
    pub fn new(config: &PerceiverConfig, params: &LayerParams, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: PerceiverAttention::new(config, params, vb.pp("attention"))?,
            layernorm: layer_norm(params.q_dim, LAYER_NORM_EPS, vb.pp("layernorm"))?,
            mlp: PerceiverMlp::new(config, params.q_dim, params.widening_factor, vb.pp("mlp"))?,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        inputs: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (attention_output, attentions) = self.attention.forward(
            hidden_states,
            inputs,
            attention_mask,
            head_mask,
            output_attentions,
        )?;
        let layer_output = self.layernorm.forward(&attention_output)?;
        let layer_output = self.mlp.forward(&layer_output)?;
        let layer_output = (layer_output + attention_output)?;
        Ok((layer_output, attentions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::{VarBuilder, VarMap};

    fn small_config() -> PerceiverConfig {
        PerceiverConfig {
            num_latents: 4,
            d_latents: 16,
            d_model: 12,
            num_blocks: 1,
            num_self_attends_per_block: 1,
            num_self_attention_heads: 2,
            num_cross_attention_heads: 2,
            attention_probs_dropout_prob: 0.0,
            ..Default::default()
        }
    }

    fn vb(device: &Device) -> (VarMap, VarBuilder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_indivisible_qk_channels_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let err = PerceiverSelfAttention::new(&config, false, 7, 8, 2, 16, 16, vb.clone())
            .err()
            .expect("qk_channels 7 with 2 heads must fail");
        assert!(err.to_string().contains("qk_channels"));

        let err = PerceiverSelfAttention::new(&config, false, 8, 9, 2, 16, 16, vb)
            .err()
            .expect("v_channels 9 with 2 heads must fail");
        assert!(err.to_string().contains("v_channels"));
    }

    #[test]
    fn test_cross_attention_with_asymmetric_widths() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let params = LayerParams {
            is_cross_attention: true,
            qk_channels: None,
            v_channels: None,
            num_heads: 2,
            q_dim: 16,
            kv_dim: 12,
            widening_factor: 1,
            use_query_residual: true,
        };
        let layer = PerceiverLayer::new(&config, &params, vb).unwrap();

        let latents = Tensor::randn(0f32, 1.0, (2, 4, 16), &device).unwrap();
        let inputs = Tensor::randn(0f32, 1.0, (2, 9, 12), &device).unwrap();
        let (out, attn) = layer
            .forward(&latents, Some(&inputs), None, None, true)
            .unwrap();
        assert_eq!(out.dims(), &[2, 4, 16]);
        assert_eq!(attn.unwrap().dims(), &[2, 2, 4, 9]);
    }

    #[test]
    fn test_additive_mask_suppresses_keys() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let params = LayerParams {
            is_cross_attention: true,
            qk_channels: Some(8),
            v_channels: Some(8),
            num_heads: 2,
            q_dim: 16,
            kv_dim: 12,
            widening_factor: 1,
            use_query_residual: false,
        };
        let layer = PerceiverLayer::new(&config, &params, vb).unwrap();

        let latents = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        let inputs = Tensor::randn(0f32, 1.0, (1, 6, 12), &device).unwrap();

        // Mask out the last two key positions.
        let mask_values: Vec<f32> = vec![0.0, 0.0, 0.0, 0.0, -1e9, -1e9];
        let mask = Tensor::from_vec(mask_values, (1, 1, 1, 6), &device).unwrap();
        let (masked_out, _) = layer
            .forward(&latents, Some(&inputs), Some(&mask), None, false)
            .unwrap();

        let truncated = inputs.i((.., 0..4, ..)).unwrap().contiguous().unwrap();
        let (trunc_out, _) = layer
            .forward(&latents, Some(&truncated), None, None, false)
            .unwrap();

        let diff = (masked_out - trunc_out)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "masked attention diverged: {diff}");
    }

    #[test]
    fn test_self_attention_preserves_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let params = LayerParams::self_attention(&config, 16);
        let layer = PerceiverLayer::new(&config, &params, vb).unwrap();

        let latents = Tensor::randn(0f32, 1.0, (3, 4, 16), &device).unwrap();
        let (out, _) = layer.forward(&latents, None, None, None, false).unwrap();
        assert_eq!(out.dims(), &[3, 4, 16]);
    }
}
