//! Cross-attention decoders: output queries attend to the latent array.
//!
//! All decoders are built around one cross-attention read-out with
//! configurable query construction. The composite multimodal decoder pads
//! per-modality queries to a common width and shares a single
//! cross-attention across modalities.

use std::collections::BTreeMap;

use candle_core::{Tensor, D};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};

use crate::config::PerceiverConfig;
use crate::core::{PerceiverError, Result};
use crate::models::attention::{LayerParams, PerceiverLayer};
use crate::models::modality::{restructure, ModalitySizes};
use crate::models::position::{
    build_position_encoding, project_positions, projected_size, PositionEncoding,
    PositionEncodingConfig,
};
use crate::models::preprocessor::InputsWithoutPos;

/// Flat output indices to decode, either for a single output space or per
/// modality
#[derive(Debug, Clone)]
pub enum SubsampledPoints {
    Indices(Vec<usize>),
    Modalities(BTreeMap<String, Vec<usize>>),
}

/// Decoder read-out and the cross-attention maps when requested
pub struct DecoderOutput {
    pub logits: Tensor,
    pub cross_attentions: Option<Vec<Tensor>>,
}

/// Converts flat row-major indices into [-1, 1] coordinates over the given
/// index space, matching the coordinates of the dense grid
fn unravel_to_coordinates(indices: &[usize], index_dims: &[usize]) -> Result<Vec<f32>> {
    let total: usize = index_dims.iter().product();
    let mut coords = Vec::with_capacity(indices.len() * index_dims.len());
    for &flat in indices {
        if flat >= total {
            return Err(PerceiverError::shape_mismatch(
                "subsampled output points",
                format!("indices below {total}"),
                format!("{flat}"),
            ));
        }
        let mut remainder = flat;
        let mut per_axis = vec![0usize; index_dims.len()];
        for (axis, &n) in index_dims.iter().enumerate().rev() {
            per_axis[axis] = remainder % n;
            remainder /= n;
        }
        for (axis, &c) in per_axis.iter().enumerate() {
            let n = index_dims[axis];
            let x = if n > 1 {
                -1.0 + 2.0 * c as f32 / (n - 1) as f32
            } else {
                -1.0
            };
            coords.push(x);
        }
    }
    Ok(coords)
}

/// Construction parameters for the basic decoder
#[derive(Debug, Clone)]
pub struct BasicDecoderConfig {
    pub output_num_channels: usize,
    pub position_encoding: PositionEncodingConfig,
    pub project_pos_dim: Option<usize>,
    pub output_index_dims: Option<Vec<usize>>,
    /// Query width; ignored when the position encoding is `None`
    pub num_channels: usize,
    pub qk_channels: Option<usize>,
    pub v_channels: Option<usize>,
    pub num_heads: usize,
    pub widening_factor: usize,
    pub use_query_residual: bool,
    pub concat_preprocessed_input: bool,
    pub final_project: bool,
    /// Build only the query machinery, no cross-attention or projection
    pub position_encoding_only: bool,
}

impl Default for BasicDecoderConfig {
    fn default() -> Self {
        Self {
            output_num_channels: 128,
            position_encoding: PositionEncodingConfig::None,
            project_pos_dim: None,
            output_index_dims: None,
            num_channels: 128,
            qk_channels: None,
            v_channels: None,
            num_heads: 1,
            widening_factor: 1,
            use_query_residual: false,
            concat_preprocessed_input: false,
            final_project: true,
            position_encoding_only: false,
        }
    }
}

/// Cross-attention decoder with position-encoding query construction
pub struct BasicDecoder {
    cfg: BasicDecoderConfig,
    output_position_encodings: Option<PositionEncoding>,
    positions_projection: Option<Linear>,
    decoding_cross_attention: Option<PerceiverLayer>,
    final_layer: Option<Linear>,
}

impl BasicDecoder {
    pub fn new(config: &PerceiverConfig, cfg: BasicDecoderConfig, vb: VarBuilder) -> Result<Self> {
        let (output_position_encodings, positions_projection) = build_position_encoding(
            &cfg.position_encoding,
            cfg.project_pos_dim,
            config.initializer_range,
            vb.pp("output_position_encodings"),
        )?;

        let (decoding_cross_attention, final_layer) = if cfg.position_encoding_only {
            (None, None)
        } else {
            let params = LayerParams {
                is_cross_attention: true,
                qk_channels: cfg.qk_channels,
                v_channels: cfg.v_channels,
                num_heads: cfg.num_heads,
                q_dim: cfg.num_channels,
                kv_dim: config.d_latents,
                widening_factor: cfg.widening_factor,
                use_query_residual: cfg.use_query_residual,
            };
            let layer = PerceiverLayer::new(config, &params, vb.pp("decoding_cross_attention"))?;
            let final_layer = if cfg.final_project {
                Some(linear(
                    cfg.num_channels,
                    cfg.output_num_channels,
                    vb.pp("final_layer"),
                )?)
            } else {
                None
            };
            (Some(layer), final_layer)
        };

        Ok(Self {
            cfg,
            output_position_encodings,
            positions_projection,
            decoding_cross_attention,
            final_layer,
        })
    }

    /// Width of the queries this decoder produces
    pub fn num_query_channels(&self) -> Result<usize> {
        let encoding = self.output_position_encodings.as_ref().ok_or_else(|| {
            PerceiverError::config(
                "query width is unknown when the decoder builds no position encoding",
            )
        })?;
        if self.cfg.position_encoding_only {
            return Ok(projected_size(encoding, self.cfg.project_pos_dim));
        }
        if self.cfg.final_project {
            Ok(self.cfg.output_num_channels)
        } else {
            Ok(self.cfg.num_channels)
        }
    }

    /// Builds the decoder query from position encodings, optionally at a
    /// subsampled set of output points
    pub fn decoder_query(
        &self,
        inputs: &Tensor,
        inputs_without_pos: Option<&Tensor>,
        subsampled_points: Option<&[usize]>,
    ) -> Result<Tensor> {
        let encoding = self.output_position_encodings.as_ref().ok_or_else(|| {
            PerceiverError::config(
                "cannot construct decoder queries without a position encoding",
            )
        })?;
        let batch_size = inputs.dim(0)?;
        let device = inputs.device();

        let pos_emb = match subsampled_points {
            Some(points) => {
                let index_dims = self.cfg.output_index_dims.as_ref().ok_or_else(|| {
                    PerceiverError::config("subsampling requires output_index_dims")
                })?;
                match encoding {
                    PositionEncoding::Trainable(enc) => enc.select(points, batch_size)?,
                    PositionEncoding::Fourier(enc) => {
                        let coords = unravel_to_coordinates(points, index_dims)?;
                        let pos = Tensor::from_vec(
                            coords,
                            (points.len(), index_dims.len()),
                            device,
                        )?
                        .unsqueeze(0)?
                        .broadcast_as((batch_size, points.len(), index_dims.len()))?
                        .contiguous()?;
                        enc.forward(index_dims, batch_size, device, Some(&pos))?
                    }
                }
            }
            None => match encoding {
                PositionEncoding::Trainable(enc) => enc.forward(batch_size)?,
                PositionEncoding::Fourier(enc) => {
                    let index_dims = self.cfg.output_index_dims.as_ref().ok_or_else(|| {
                        PerceiverError::config("dense queries require output_index_dims")
                    })?;
                    enc.forward(index_dims, batch_size, device, None)?
                }
            },
        };
        let pos_emb = project_positions(self.positions_projection.as_ref(), &pos_emb)?;

        if self.cfg.concat_preprocessed_input {
            let without_pos = inputs_without_pos.ok_or_else(|| {
                PerceiverError::config(
                    "inputs_without_pos is required when concat_preprocessed_input is set",
                )
            })?;
            return Ok(Tensor::cat(&[without_pos.clone(), pos_emb], D::Minus1)?);
        }
        Ok(pos_emb)
    }

    pub fn forward(
        &self,
        query: &Tensor,
        latents: &Tensor,
        query_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        let cross_attention = self.decoding_cross_attention.as_ref().ok_or_else(|| {
            PerceiverError::config("decoder was built for query construction only")
        })?;
        let (output, attn) =
            cross_attention.forward(query, Some(latents), query_mask, None, output_attentions)?;
        let logits = match &self.final_layer {
            Some(proj) => proj.forward(&output)?,
            None => output,
        };
        Ok(DecoderOutput {
            logits,
            cross_attentions: attn.map(|a| vec![a]),
        })
    }
}

/// Classification read-out: a single learned query produces one logit row
/// per example
pub struct ClassificationDecoder {
    decoder: BasicDecoder,
}

impl ClassificationDecoder {
    pub fn new(config: &PerceiverConfig, cfg: BasicDecoderConfig, vb: VarBuilder) -> Result<Self> {
        let cfg = BasicDecoderConfig {
            output_num_channels: config.num_labels,
            output_index_dims: Some(vec![1]),
            ..cfg
        };
        Ok(Self {
            decoder: BasicDecoder::new(config, cfg, vb.pp("decoder"))?,
        })
    }

    pub fn num_query_channels(&self) -> Result<usize> {
        self.decoder.num_query_channels()
    }

    pub fn decoder_query(
        &self,
        inputs: &Tensor,
        inputs_without_pos: Option<&Tensor>,
        subsampled_points: Option<&[usize]>,
    ) -> Result<Tensor> {
        self.decoder
            .decoder_query(inputs, inputs_without_pos, subsampled_points)
    }

    pub fn forward(
        &self,
        query: &Tensor,
        latents: &Tensor,
        query_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        let outputs = self
            .decoder
            .forward(query, latents, query_mask, output_attentions)?;
        // [batch, 1, num_labels] -> [batch, num_labels]
        let logits = outputs.logits.squeeze(1)?;
        Ok(DecoderOutput {
            logits,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

/// Dense flow read-out: queries are the preprocessed inputs themselves and
/// predictions are rescaled and reshaped to the image grid
pub struct FlowDecoder {
    decoder: BasicDecoder,
    output_image_shape: (usize, usize),
    output_num_channels: usize,
    rescale_factor: f64,
}

impl FlowDecoder {
    pub fn new(
        config: &PerceiverConfig,
        cfg: BasicDecoderConfig,
        output_image_shape: (usize, usize),
        rescale_factor: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let output_num_channels = cfg.output_num_channels;
        Ok(Self {
            decoder: BasicDecoder::new(config, cfg, vb.pp("decoder"))?,
            output_image_shape,
            output_num_channels,
            rescale_factor,
        })
    }

    pub fn num_query_channels(&self) -> Result<usize> {
        self.decoder.num_query_channels()
    }

    pub fn decoder_query(
        &self,
        inputs: &Tensor,
        subsampled_points: Option<&[usize]>,
    ) -> Result<Tensor> {
        if subsampled_points.is_some() {
            return Err(PerceiverError::unimplemented(
                "subsampled flow decoding",
            ));
        }
        Ok(inputs.clone())
    }

    pub fn forward(
        &self,
        query: &Tensor,
        latents: &Tensor,
        query_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        let outputs = self
            .decoder
            .forward(query, latents, query_mask, output_attentions)?;
        let preds = (outputs.logits / self.rescale_factor)?;
        let batch_size = preds.dim(0)?;
        let (h, w) = self.output_image_shape;
        let logits = preds.reshape((batch_size, h, w, self.output_num_channels))?;
        Ok(DecoderOutput {
            logits,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

/// Video read-out: dense decoding reshaped to `[batch, t, h, w, channels]`
pub struct VideoAutoencodingDecoder {
    decoder: BasicDecoder,
    output_shape: Vec<usize>,
}

impl VideoAutoencodingDecoder {
    /// `output_shape` is the `[t, h, w]` grid of decoded video positions
    pub fn new(
        config: &PerceiverConfig,
        cfg: BasicDecoderConfig,
        output_shape: Vec<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if output_shape.len() != 3 {
            return Err(PerceiverError::config(format!(
                "video output shape must be [t, h, w], got {output_shape:?}"
            )));
        }
        let cfg = BasicDecoderConfig {
            output_index_dims: Some(output_shape.clone()),
            ..cfg
        };
        Ok(Self {
            decoder: BasicDecoder::new(config, cfg, vb.pp("decoder"))?,
            output_shape,
        })
    }

    pub fn num_query_channels(&self) -> Result<usize> {
        self.decoder.num_query_channels()
    }

    pub fn decoder_query(
        &self,
        inputs: &Tensor,
        inputs_without_pos: Option<&Tensor>,
        subsampled_points: Option<&[usize]>,
    ) -> Result<Tensor> {
        self.decoder
            .decoder_query(inputs, inputs_without_pos, subsampled_points)
    }

    pub fn forward(
        &self,
        query: &Tensor,
        latents: &Tensor,
        query_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        let outputs = self
            .decoder
            .forward(query, latents, query_mask, output_attentions)?;
        let dims = outputs.logits.dims();
        let (batch_size, channels) = (dims[0], dims[dims.len() - 1]);
        let (t, h, w) = (
            self.output_shape[0],
            self.output_shape[1],
            self.output_shape[2],
        );
        let logits = outputs.logits.reshape((batch_size, t, h, w, channels))?;
        Ok(DecoderOutput {
            logits,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

/// Composes per-modality query builders with one shared cross-attention.
///
/// Sub-decoders only construct queries (`position_encoding_only`); their
/// queries are padded with a learned per-modality vector to a common width
/// and concatenated alphabetically before the shared read-out.
pub struct MultimodalDecoder {
    modalities: BTreeMap<String, PerceiverDecoder>,
    decoder: BasicDecoder,
    padding: BTreeMap<String, Tensor>,
    subsampled_index_dims: Option<BTreeMap<String, usize>>,
    num_outputs: usize,
    num_query_channels: usize,
}

impl MultimodalDecoder {
    pub fn new(
        config: &PerceiverConfig,
        modalities: BTreeMap<String, PerceiverDecoder>,
        num_outputs: usize,
        output_num_channels: usize,
        min_padding_size: usize,
        subsampled_index_dims: Option<BTreeMap<String, usize>>,
        cfg: BasicDecoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if modalities.is_empty() {
            return Err(PerceiverError::config(
                "multimodal decoder needs at least one modality",
            ));
        }
        let mut max_channels = 0;
        for decoder in modalities.values() {
            max_channels = max_channels.max(decoder.num_query_channels()?);
        }
        let num_query_channels = max_channels + min_padding_size;

        let decoder = BasicDecoder::new(
            config,
            BasicDecoderConfig {
                output_index_dims: Some(vec![num_outputs]),
                output_num_channels,
                position_encoding: PositionEncodingConfig::None,
                num_channels: num_query_channels,
                ..cfg
            },
            vb.pp("decoder"),
        )?;

        let init = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };
        let mut padding = BTreeMap::new();
        for (name, sub) in &modalities {
            let pad_width = num_query_channels - sub.num_query_channels()?;
            if pad_width > 0 {
                let pad = vb.get_with_hints((1, pad_width), &format!("padding.{name}"), init)?;
                padding.insert(name.clone(), pad);
            }
        }

        Ok(Self {
            modalities,
            decoder,
            padding,
            subsampled_index_dims,
            num_outputs,
            num_query_channels,
        })
    }

    pub fn num_query_channels(&self) -> usize {
        self.num_query_channels
    }

    /// Per-modality output token counts, used to partition the decoded
    /// sequence for postprocessing
    pub fn output_modality_sizes(&self) -> Option<ModalitySizes> {
        self.subsampled_index_dims.clone().or_else(|| {
            let mut sizes = ModalitySizes::new();
            let mut remaining = self.num_outputs;
            // Without subsampling the partition is unknown per modality
            // unless there is exactly one.
            if self.modalities.len() == 1 {
                for name in self.modalities.keys() {
                    sizes.insert(name.clone(), remaining);
                    remaining = 0;
                }
                Some(sizes)
            } else {
                None
            }
        })
    }

    pub fn decoder_query(
        &self,
        inputs: &Tensor,
        modality_sizes: &ModalitySizes,
        inputs_without_pos: Option<&BTreeMap<String, Tensor>>,
        subsampled_points: Option<&BTreeMap<String, Vec<usize>>>,
    ) -> Result<Tensor> {
        let inputs = restructure(modality_sizes, inputs)?;

        let mut queries = BTreeMap::new();
        for (modality, decoder) in &self.modalities {
            let modality_inputs = inputs.get(modality).ok_or_else(|| {
                PerceiverError::shape_mismatch(
                    "multimodal decoder",
                    format!("a preprocessed modality '{modality}'"),
                    "missing entry",
                )
            })?;
            let without_pos = inputs_without_pos.and_then(|m| m.get(modality));
            let points = subsampled_points.and_then(|m| m.get(modality));
            let query = decoder.modality_query(
                modality_inputs,
                without_pos,
                points.map(|p| p.as_slice()),
            )?;

            // Flatten any index structure and pad to the common width.
            let dims = query.dims().to_vec();
            let batch_size = dims[0];
            let num_tokens: usize = dims[1..dims.len() - 1].iter().product();
            let channels = dims[dims.len() - 1];
            let mut query = query.reshape((batch_size, num_tokens, channels))?;
            if let Some(pad) = self.padding.get(modality) {
                let pad = pad
                    .unsqueeze(0)?
                    .broadcast_as((batch_size, num_tokens, self.num_query_channels - channels))?
                    .contiguous()?;
                query = Tensor::cat(&[query, pad], D::Minus1)?;
            }
            queries.insert(modality.clone(), query);
        }

        let pieces: Vec<Tensor> = queries.into_values().collect();
        Ok(Tensor::cat(&pieces, 1)?)
    }

    pub fn forward(
        &self,
        query: &Tensor,
        latents: &Tensor,
        query_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        self.decoder
            .forward(query, latents, query_mask, output_attentions)
    }
}

/// Closed set of decoder kinds
pub enum PerceiverDecoder {
    Basic(BasicDecoder),
    Classification(ClassificationDecoder),
    Flow(FlowDecoder),
    VideoAutoencoding(VideoAutoencodingDecoder),
    Multimodal(MultimodalDecoder),
}

impl PerceiverDecoder {
    pub fn num_query_channels(&self) -> Result<usize> {
        match self {
            PerceiverDecoder::Basic(d) => d.num_query_channels(),
            PerceiverDecoder::Classification(d) => d.num_query_channels(),
            PerceiverDecoder::Flow(d) => d.num_query_channels(),
            PerceiverDecoder::VideoAutoencoding(d) => d.num_query_channels(),
            PerceiverDecoder::Multimodal(d) => Ok(d.num_query_channels()),
        }
    }

    /// Query construction for single-modality decoders; the multimodal
    /// decoder builds its queries through `MultimodalDecoder::decoder_query`
    fn modality_query(
        &self,
        inputs: &Tensor,
        inputs_without_pos: Option<&Tensor>,
        subsampled_points: Option<&[usize]>,
    ) -> Result<Tensor> {
        match self {
            PerceiverDecoder::Basic(d) => {
                d.decoder_query(inputs, inputs_without_pos, subsampled_points)
            }
            PerceiverDecoder::Classification(d) => {
                d.decoder_query(inputs, inputs_without_pos, subsampled_points)
            }
            PerceiverDecoder::Flow(d) => d.decoder_query(inputs, subsampled_points),
            PerceiverDecoder::VideoAutoencoding(d) => {
                d.decoder_query(inputs, inputs_without_pos, subsampled_points)
            }
            PerceiverDecoder::Multimodal(_) => Err(PerceiverError::config(
                "a multimodal decoder cannot be nested as a modality",
            )),
        }
    }

    /// Builds the decoder query for the preprocessed inputs
    pub fn decoder_query(
        &self,
        inputs: &Tensor,
        modality_sizes: Option<&ModalitySizes>,
        inputs_without_pos: Option<&InputsWithoutPos>,
        subsampled_points: Option<&SubsampledPoints>,
    ) -> Result<Tensor> {
        match self {
            PerceiverDecoder::Multimodal(d) => {
                let sizes = modality_sizes.ok_or_else(|| {
                    PerceiverError::config(
                        "multimodal decoding requires recorded modality sizes",
                    )
                })?;
                let without_pos = match inputs_without_pos {
                    Some(InputsWithoutPos::Modalities(map)) => Some(map),
                    Some(InputsWithoutPos::Tensor(_)) => {
                        return Err(PerceiverError::shape_mismatch(
                            "multimodal decoder query",
                            "per-modality inputs_without_pos",
                            "a single tensor",
                        ))
                    }
                    None => None,
                };
                let points = match subsampled_points {
                    Some(SubsampledPoints::Modalities(map)) => Some(map),
                    Some(SubsampledPoints::Indices(_)) => {
                        return Err(PerceiverError::shape_mismatch(
                            "multimodal decoder query",
                            "per-modality subsampled points",
                            "a flat index list",
                        ))
                    }
                    None => None,
                };
                d.decoder_query(inputs, sizes, without_pos, points)
            }
            _ => {
                let without_pos = match inputs_without_pos {
                    Some(InputsWithoutPos::Tensor(t)) => Some(t),
                    Some(InputsWithoutPos::Modalities(_)) => {
                        return Err(PerceiverError::shape_mismatch(
                            "decoder query",
                            "a single inputs_without_pos tensor",
                            "a modality map",
                        ))
                    }
                    None => None,
                };
                let points = match subsampled_points {
                    Some(SubsampledPoints::Indices(idx)) => Some(idx.as_slice()),
                    Some(SubsampledPoints::Modalities(_)) => {
                        return Err(PerceiverError::shape_mismatch(
                            "decoder query",
                            "a flat index list",
                            "per-modality subsampled points",
                        ))
                    }
                    None => None,
                };
                self.modality_query(inputs, without_pos, points)
            }
        }
    }

    pub fn forward(
        &self,
        query: &Tensor,
        latents: &Tensor,
        query_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<DecoderOutput> {
        match self {
            PerceiverDecoder::Basic(d) => d.forward(query, latents, query_mask, output_attentions),
            PerceiverDecoder::Classification(d) => {
                d.forward(query, latents, query_mask, output_attentions)
            }
            PerceiverDecoder::Flow(d) => d.forward(query, latents, query_mask, output_attentions),
            PerceiverDecoder::VideoAutoencoding(d) => {
                d.forward(query, latents, query_mask, output_attentions)
            }
            PerceiverDecoder::Multimodal(d) => {
                d.forward(query, latents, query_mask, output_attentions)
            }
        }
    }
}
