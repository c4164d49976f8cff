//! Modality preprocessors: raw inputs to common-width token sequences.
//!
//! Each preprocessor maps one modality's raw tensor into a `[batch, seq,
//! channels]` token sequence with position features fused in, and reports
//! its output width so composite preprocessors can pad modalities to a
//! common width before concatenation.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, embedding, linear, BatchNorm, Conv2d, Conv2dConfig, Embedding, Init,
    Linear, Module, ModuleT, VarBuilder,
};

use crate::config::PerceiverConfig;
use crate::core::{PerceiverError, Result};
use crate::models::modality::ModalitySizes;
use crate::models::position::{
    build_position_encoding, project_positions, projected_size, PositionEncoding,
    PositionEncodingConfig,
};

/// Raw model input: a single tensor, or one tensor per modality
#[derive(Debug, Clone)]
pub enum ModelInputs {
    Tensor(Tensor),
    Modalities(BTreeMap<String, Tensor>),
}

impl ModelInputs {
    fn tensor(&self) -> Result<&Tensor> {
        match self {
            ModelInputs::Tensor(t) => Ok(t),
            ModelInputs::Modalities(_) => Err(PerceiverError::shape_mismatch(
                "preprocessor input",
                "a single tensor",
                "a modality map",
            )),
        }
    }
}

/// Preprocessed tokens without position features, used for decoder queries
#[derive(Debug, Clone)]
pub enum InputsWithoutPos {
    Tensor(Tensor),
    Modalities(BTreeMap<String, Tensor>),
}

/// The (tokens, modality sizes, tokens without position) triple every
/// preprocessor returns
pub struct PreprocessorOutput {
    pub inputs: Tensor,
    pub modality_sizes: Option<ModalitySizes>,
    pub inputs_without_pos: Option<InputsWithoutPos>,
}

/// Whether position features are concatenated onto or added into the tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatOrAdd {
    Concat,
    Add,
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Token embedding lookup plus absolute position embeddings
pub struct TextPreprocessor {
    embeddings: Embedding,
    position_embeddings: Embedding,
    d_model: usize,
    max_position_embeddings: usize,
}

impl TextPreprocessor {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embeddings: embedding(config.vocab_size, config.d_model, vb.pp("embeddings"))?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.d_model,
                vb.pp("position_embeddings"),
            )?,
            d_model: config.d_model,
            max_position_embeddings: config.max_position_embeddings,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.d_model
    }

    /// Embedding table, exposed for weight-tied output heads
    pub fn embedding_weights(&self) -> &Tensor {
        self.embeddings.embeddings()
    }

    /// `inputs` are token ids of shape `[batch, seq_len]`
    pub fn forward(&self, inputs: &Tensor) -> Result<PreprocessorOutput> {
        let seq_len = inputs.dim(1)?;
        if seq_len > self.max_position_embeddings {
            return Err(PerceiverError::shape_mismatch(
                "text preprocessor",
                format!("sequence length <= {}", self.max_position_embeddings),
                format!("{seq_len}"),
            ));
        }
        let embeddings = self.embeddings.forward(inputs)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, inputs.device())?;
        let position_embeddings = self.position_embeddings.forward(&position_ids)?;
        let embeddings = embeddings.broadcast_add(&position_embeddings)?;
        Ok(PreprocessorOutput {
            inputs: embeddings,
            modality_sizes: None,
            inputs_without_pos: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Space-to-depth patch flattening.
///
/// Rank-4 `[b, c, h, w]` becomes `[b, h/s, w/s, s*s*c]`; rank-5
/// `[b, t, c, h, w]` becomes `[b, t/dt, h/s, w/s, dt*s*s*c]`.
pub fn space_to_depth(
    frames: &Tensor,
    temporal_block_size: usize,
    spatial_block_size: usize,
) -> Result<Tensor> {
    let dims = frames.dims();
    match dims.len() {
        4 => {
            let (b, c, h, w) = frames.dims4()?;
            let (dh, dw) = (spatial_block_size, spatial_block_size);
            if h % dh != 0 || w % dw != 0 {
                return Err(PerceiverError::shape_mismatch(
                    "space_to_depth",
                    format!("spatial dims divisible by {dh}"),
                    format!("{h}x{w}"),
                ));
            }
            let out = frames
                .reshape((b, c, h / dh, dh, w / dw, dw))?
                .permute((0, 2, 4, 3, 5, 1))?
                .contiguous()?
                .reshape((b, h / dh, w / dw, dh * dw * c))?;
            Ok(out)
        }
        5 => {
            let (b, t, c, h, w) = frames.dims5()?;
            let dt = temporal_block_size;
            let (dh, dw) = (spatial_block_size, spatial_block_size);
            if t % dt != 0 || h % dh != 0 || w % dw != 0 {
                return Err(PerceiverError::shape_mismatch(
                    "space_to_depth",
                    format!("dims divisible by ({dt}, {dh}, {dw})"),
                    format!("{t}x{h}x{w}"),
                ));
            }
            let out = frames
                .reshape(vec![b, t / dt, dt, c, h / dh, dh, w / dw, dw])?
                .permute([0, 1, 4, 6, 2, 5, 7, 3])?
                .contiguous()?
                .reshape((b, t / dt, h / dh, w / dw, dt * dh * dw * c))?;
            Ok(out)
        }
        _ => Err(PerceiverError::shape_mismatch(
            "space_to_depth",
            "rank 4 (b, c, h, w) or rank 5 (b, t, c, h, w)",
            format!("rank {}", dims.len()),
        )),
    }
}

/// 4x spatial downsampling: 7x7/2 same-padded conv, batchnorm, relu, then
/// 3x3/2 max pooling
struct Conv2dDownsample {
    conv: Conv2d,
    batchnorm: Option<BatchNorm>,
}

impl Conv2dDownsample {
    fn new(
        in_channels: usize,
        out_channels: usize,
        use_batchnorm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 7, cfg, vb.pp("conv"))?;
        let batchnorm = if use_batchnorm {
            Some(batch_norm(out_channels, 1e-5, vb.pp("batchnorm"))?)
        } else {
            None
        };
        Ok(Self { conv, batchnorm })
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let out = self.conv.forward(inputs)?;
        let out = match &self.batchnorm {
            Some(bn) => bn.forward_t(&out, false)?,
            None => out,
        };
        let out = out.relu()?;
        Ok(out.max_pool2d_with_stride(3, 2)?)
    }
}

/// Image front-end selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePrepKind {
    /// Strided convolution stack, 4x spatial downsample
    Conv,
    /// Single 1x1 convolution, stride = spatial downsample
    Conv1x1,
    /// Raw pixels, optionally strided
    Pixels,
    /// Space-to-depth patches, optional post-patch linear projection
    Patches,
}

/// Construction parameters for the image preprocessor
#[derive(Debug, Clone)]
pub struct ImagePreprocessorConfig {
    pub prep_type: ImagePrepKind,
    pub spatial_downsample: usize,
    pub temporal_downsample: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub conv_after_patching: bool,
    pub conv_after_patching_in_channels: usize,
    pub conv2d_use_batchnorm: bool,
    pub concat_or_add_pos: ConcatOrAdd,
    pub project_pos_dim: Option<usize>,
    pub position_encoding: PositionEncodingConfig,
}

impl Default for ImagePreprocessorConfig {
    fn default() -> Self {
        Self {
            prep_type: ImagePrepKind::Conv,
            spatial_downsample: 4,
            temporal_downsample: 1,
            in_channels: 3,
            out_channels: 64,
            conv_after_patching: false,
            conv_after_patching_in_channels: 54,
            conv2d_use_batchnorm: true,
            concat_or_add_pos: ConcatOrAdd::Concat,
            project_pos_dim: None,
            position_encoding: PositionEncodingConfig::None,
        }
    }
}

/// Image preprocessing: front-end, flatten to tokens, fuse positions
pub struct ImagePreprocessor {
    prep: ImagePreprocessorConfig,
    convnet: Option<Conv2dDownsample>,
    convnet_1x1: Option<Conv2d>,
    conv_after_patches: Option<Linear>,
    position_encoding: PositionEncoding,
    positions_projection: Option<Linear>,
}

impl ImagePreprocessor {
    pub fn new(
        config: &PerceiverConfig,
        prep: ImagePreprocessorConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut convnet = None;
        let mut convnet_1x1 = None;
        let mut conv_after_patches = None;

        match prep.prep_type {
            ImagePrepKind::Conv => {
                // The conv front-end downsamples by a fixed factor of 4.
                if prep.spatial_downsample != 4 || prep.temporal_downsample != 1 {
                    return Err(PerceiverError::config(format!(
                        "conv front-end downsamples 4x spatially and 1x temporally, \
                         got spatial {} temporal {}",
                        prep.spatial_downsample, prep.temporal_downsample
                    )));
                }
                convnet = Some(Conv2dDownsample::new(
                    prep.in_channels,
                    prep.out_channels,
                    prep.conv2d_use_batchnorm,
                    vb.pp("convnet"),
                )?);
            }
            ImagePrepKind::Conv1x1 => {
                if prep.temporal_downsample != 1 {
                    return Err(PerceiverError::config(
                        "conv1x1 front-end does not downsample in time",
                    ));
                }
                let cfg = Conv2dConfig {
                    stride: prep.spatial_downsample,
                    ..Default::default()
                };
                convnet_1x1 = Some(conv2d(
                    prep.in_channels,
                    prep.out_channels,
                    1,
                    cfg,
                    vb.pp("convnet_1x1"),
                )?);
            }
            ImagePrepKind::Pixels => {}
            ImagePrepKind::Patches => {
                if prep.conv_after_patching {
                    conv_after_patches = Some(linear(
                        prep.conv_after_patching_in_channels,
                        prep.out_channels,
                        vb.pp("conv_after_patches"),
                    )?);
                }
            }
        }

        let (position_encoding, positions_projection) = build_position_encoding(
            &prep.position_encoding,
            prep.project_pos_dim,
            config.initializer_range,
            vb.pp("position_embeddings"),
        )?;
        let position_encoding = position_encoding.ok_or_else(|| {
            PerceiverError::config("image preprocessor requires a position encoding")
        })?;

        Ok(Self {
            prep,
            convnet,
            convnet_1x1,
            conv_after_patches,
            position_encoding,
            positions_projection,
        })
    }

    /// Output token width: front-end channels plus (or replaced by, when
    /// adding) the position-encoding width
    pub fn num_channels(&self) -> usize {
        let is_temporal = self.position_encoding.num_dimensions() > 2;
        let pos_dim = projected_size(&self.position_encoding, self.prep.project_pos_dim);
        if self.prep.concat_or_add_pos == ConcatOrAdd::Add {
            return pos_dim;
        }

        let inp_dim = match self.prep.prep_type {
            ImagePrepKind::Conv | ImagePrepKind::Conv1x1 => self.prep.out_channels,
            ImagePrepKind::Pixels => self.prep.in_channels,
            ImagePrepKind::Patches => {
                if self.prep.conv_after_patching {
                    self.prep.out_channels
                } else {
                    let mut dim = self.prep.in_channels * self.prep.spatial_downsample.pow(2);
                    if is_temporal {
                        dim *= self.prep.temporal_downsample;
                    }
                    dim
                }
            }
        };
        inp_dim + pos_dim
    }

    fn downsample_pixels(&self, inputs: &Tensor) -> Result<Tensor> {
        let stride = |dim_len: usize, step: usize, device| -> Result<Tensor> {
            Ok(Tensor::arange_step(0u32, dim_len as u32, step as u32, device)?)
        };
        let device = inputs.device();
        match inputs.dims().len() {
            4 => {
                let (_, _, h, w) = inputs.dims4()?;
                let sd = self.prep.spatial_downsample;
                let out = inputs
                    .index_select(&stride(h, sd, device)?, 2)?
                    .index_select(&stride(w, sd, device)?, 3)?;
                Ok(out)
            }
            5 => {
                let (_, t, _, h, w) = inputs.dims5()?;
                let (td, sd) = (self.prep.temporal_downsample, self.prep.spatial_downsample);
                let out = inputs
                    .index_select(&stride(t, td, device)?, 1)?
                    .index_select(&stride(h, sd, device)?, 3)?
                    .index_select(&stride(w, sd, device)?, 4)?;
                Ok(out)
            }
            n => Err(PerceiverError::shape_mismatch(
                "pixels front-end",
                "rank 4 or 5 input",
                format!("rank {n}"),
            )),
        }
    }

    /// Moves channels to the last axis for rank-4/5 front-end outputs
    fn channels_last(inputs: &Tensor) -> Result<Tensor> {
        match inputs.dims().len() {
            4 => Ok(inputs.permute((0, 2, 3, 1))?.contiguous()?),
            5 => Ok(inputs.permute((0, 1, 3, 4, 2))?.contiguous()?),
            n => Err(PerceiverError::shape_mismatch(
                "image front-end output",
                "rank 4 or 5",
                format!("rank {n}"),
            )),
        }
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<PreprocessorOutput> {
        let features = match self.prep.prep_type {
            ImagePrepKind::Conv => {
                let convnet = self
                    .convnet
                    .as_ref()
                    .ok_or_else(|| PerceiverError::config("conv front-end was not built"))?;
                Self::channels_last(&convnet.forward(inputs)?)?
            }
            ImagePrepKind::Conv1x1 => {
                let conv = self
                    .convnet_1x1
                    .as_ref()
                    .ok_or_else(|| PerceiverError::config("conv1x1 front-end was not built"))?;
                Self::channels_last(&conv.forward(inputs)?)?
            }
            ImagePrepKind::Pixels => Self::channels_last(&self.downsample_pixels(inputs)?)?,
            ImagePrepKind::Patches => {
                let mut patched = space_to_depth(
                    inputs,
                    self.prep.temporal_downsample,
                    self.prep.spatial_downsample,
                )?;
                // A single remaining frame collapses to the image layout.
                if patched.dims().len() == 5 && patched.dim(1)? == 1 {
                    patched = patched.squeeze(1)?;
                }
                match &self.conv_after_patches {
                    Some(proj) => proj.forward(&patched)?,
                    None => patched,
                }
            }
        };

        // Flatten all spatial axes into one token axis.
        let dims = features.dims().to_vec();
        let batch_size = dims[0];
        let index_dims = &dims[1..dims.len() - 1];
        let num_tokens: usize = index_dims.iter().product();
        let channels = dims[dims.len() - 1];
        let flat = features.reshape((batch_size, num_tokens, channels))?;

        let pos_enc = match &self.position_encoding {
            PositionEncoding::Trainable(enc) => enc.forward(batch_size)?,
            PositionEncoding::Fourier(enc) => {
                enc.forward(index_dims, batch_size, flat.device(), None)?
            }
        };
        let pos_enc = project_positions(self.positions_projection.as_ref(), &pos_enc)?;

        let fused = match self.prep.concat_or_add_pos {
            ConcatOrAdd::Concat => Tensor::cat(&[flat.clone(), pos_enc], D::Minus1)?,
            ConcatOrAdd::Add => flat.broadcast_add(&pos_enc)?,
        };

        Ok(PreprocessorOutput {
            inputs: fused,
            modality_sizes: None,
            inputs_without_pos: Some(InputsWithoutPos::Tensor(flat)),
        })
    }
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Construction parameters for the audio preprocessor
#[derive(Debug, Clone)]
pub struct AudioPreprocessorConfig {
    pub samples_per_patch: usize,
    pub concat_or_add_pos: ConcatOrAdd,
    pub project_pos_dim: Option<usize>,
    pub position_encoding: PositionEncodingConfig,
}

/// Audio preprocessing: raw samples to fixed-size patches with positions
pub struct AudioPreprocessor {
    samples_per_patch: usize,
    concat_or_add_pos: ConcatOrAdd,
    project_pos_dim: Option<usize>,
    position_encoding: PositionEncoding,
    positions_projection: Option<Linear>,
}

impl AudioPreprocessor {
    pub fn new(
        config: &PerceiverConfig,
        prep: AudioPreprocessorConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if prep.samples_per_patch == 0 {
            return Err(PerceiverError::config("samples_per_patch must be positive"));
        }
        let (position_encoding, positions_projection) = build_position_encoding(
            &prep.position_encoding,
            prep.project_pos_dim,
            config.initializer_range,
            vb.pp("position_embeddings"),
        )?;
        let position_encoding = position_encoding.ok_or_else(|| {
            PerceiverError::config("audio preprocessor requires a position encoding")
        })?;
        Ok(Self {
            samples_per_patch: prep.samples_per_patch,
            concat_or_add_pos: prep.concat_or_add_pos,
            project_pos_dim: prep.project_pos_dim,
            position_encoding,
            positions_projection,
        })
    }

    pub fn num_channels(&self) -> usize {
        let pos_dim = projected_size(&self.position_encoding, self.project_pos_dim);
        match self.concat_or_add_pos {
            ConcatOrAdd::Add => pos_dim,
            ConcatOrAdd::Concat => self.samples_per_patch + pos_dim,
        }
    }

    /// `inputs` are raw samples of shape `[batch, num_samples]` (a trailing
    /// channel axis of size 1 is accepted)
    pub fn forward(&self, inputs: &Tensor) -> Result<PreprocessorOutput> {
        let batch_size = inputs.dim(0)?;
        let num_samples: usize = inputs.dims()[1..].iter().product();
        if num_samples % self.samples_per_patch != 0 {
            return Err(PerceiverError::shape_mismatch(
                "audio preprocessor",
                format!("sample count divisible by {}", self.samples_per_patch),
                format!("{num_samples}"),
            ));
        }
        let num_patches = num_samples / self.samples_per_patch;
        let patches = inputs.reshape((batch_size, num_patches, self.samples_per_patch))?;

        let pos_enc = match &self.position_encoding {
            PositionEncoding::Trainable(enc) => enc.forward(batch_size)?,
            PositionEncoding::Fourier(enc) => {
                enc.forward(&[num_patches], batch_size, patches.device(), None)?
            }
        };
        let pos_enc = project_positions(self.positions_projection.as_ref(), &pos_enc)?;

        let fused = match self.concat_or_add_pos {
            ConcatOrAdd::Concat => Tensor::cat(&[patches.clone(), pos_enc], D::Minus1)?,
            ConcatOrAdd::Add => patches.broadcast_add(&pos_enc)?,
        };

        Ok(PreprocessorOutput {
            inputs: fused,
            modality_sizes: None,
            inputs_without_pos: Some(InputsWithoutPos::Tensor(patches)),
        })
    }
}

// ---------------------------------------------------------------------------
// One-hot
// ---------------------------------------------------------------------------

/// Label conditioning: inserts a singleton sequence axis, no positions
pub struct OneHotPreprocessor {
    num_labels: usize,
}

impl OneHotPreprocessor {
    pub fn new(config: &PerceiverConfig) -> Self {
        Self {
            num_labels: config.num_labels,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_labels
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<PreprocessorOutput> {
        let with_axis = inputs.unsqueeze(1)?;
        Ok(PreprocessorOutput {
            inputs: with_axis.clone(),
            modality_sizes: None,
            inputs_without_pos: Some(InputsWithoutPos::Tensor(with_axis)),
        })
    }
}

// ---------------------------------------------------------------------------
// Multimodal composite
// ---------------------------------------------------------------------------

/// Runs sub-preprocessors, pads every modality to a common width with a
/// learned per-modality pad vector, optionally masks tokens, and
/// concatenates alphabetically by modality name
pub struct MultimodalPreprocessor {
    modalities: BTreeMap<String, Preprocessor>,
    mask_probs: BTreeMap<String, f64>,
    padding: BTreeMap<String, Tensor>,
    mask_tokens: BTreeMap<String, Tensor>,
    num_channels: usize,
}

impl MultimodalPreprocessor {
    pub fn new(
        config: &PerceiverConfig,
        modalities: BTreeMap<String, Preprocessor>,
        mask_probs: BTreeMap<String, f64>,
        min_padding_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if modalities.is_empty() {
            return Err(PerceiverError::config(
                "multimodal preprocessor needs at least one modality",
            ));
        }
        let max_channels = modalities
            .values()
            .map(|p| p.num_channels())
            .max()
            .unwrap_or(0);
        let num_channels = max_channels + min_padding_size;

        let init = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };
        let mut padding = BTreeMap::new();
        for (name, preprocessor) in &modalities {
            let pad_width = num_channels - preprocessor.num_channels();
            if pad_width > 0 {
                let pad = vb.get_with_hints((1, pad_width), &format!("padding.{name}"), init)?;
                padding.insert(name.clone(), pad);
            }
        }
        let mut mask_tokens = BTreeMap::new();
        for name in mask_probs.keys() {
            if !modalities.contains_key(name) {
                return Err(PerceiverError::config(format!(
                    "mask probability given for unknown modality '{name}'"
                )));
            }
            let token = vb.get_with_hints((1, num_channels), &format!("mask.{name}"), init)?;
            mask_tokens.insert(name.clone(), token);
        }

        Ok(Self {
            modalities,
            mask_probs,
            padding,
            mask_tokens,
            num_channels,
        })
    }

    /// Common width: max of the sub-preprocessor widths plus the minimum
    /// padding size
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn forward(&self, inputs: &BTreeMap<String, Tensor>) -> Result<PreprocessorOutput> {
        let mut padded = BTreeMap::new();
        let mut modality_sizes = ModalitySizes::new();
        let mut inputs_without_pos = BTreeMap::new();

        for (modality, preprocessor) in &self.modalities {
            let raw = inputs.get(modality).ok_or_else(|| {
                PerceiverError::shape_mismatch(
                    "multimodal preprocessor",
                    format!("an input for modality '{modality}'"),
                    "missing entry",
                )
            })?;
            let output = preprocessor.forward(&ModelInputs::Tensor(raw.clone()))?;
            if let Some(InputsWithoutPos::Tensor(t)) = output.inputs_without_pos {
                inputs_without_pos.insert(modality.clone(), t);
            }

            let (batch_size, num_tokens, channels) = output.inputs.dims3()?;
            let mut tokens = output.inputs;
            if let Some(pad) = self.padding.get(modality) {
                let pad = pad
                    .unsqueeze(0)?
                    .broadcast_as((batch_size, num_tokens, self.num_channels - channels))?
                    .contiguous()?;
                tokens = Tensor::cat(&[tokens, pad], D::Minus1)?;
            }

            if let Some(&prob) = self.mask_probs.get(modality) {
                let token = &self.mask_tokens[modality];
                let uniform =
                    Tensor::rand(0f32, 1f32, (batch_size, num_tokens, 1), tokens.device())?;
                let mask = uniform.lt(prob)?.to_dtype(DType::F32)?;
                let kept = tokens.broadcast_mul(&mask.affine(-1.0, 1.0)?)?;
                let replaced = mask.broadcast_mul(&token.unsqueeze(0)?)?;
                tokens = (kept + replaced)?;
            }

            modality_sizes.insert(modality.clone(), num_tokens);
            padded.insert(modality.clone(), tokens);
        }

        // BTreeMap iteration gives the alphabetical concatenation order.
        let pieces: Vec<Tensor> = padded.into_values().collect();
        let final_inputs = Tensor::cat(&pieces, 1)?;

        Ok(PreprocessorOutput {
            inputs: final_inputs,
            modality_sizes: Some(modality_sizes),
            inputs_without_pos: Some(InputsWithoutPos::Modalities(inputs_without_pos)),
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Closed set of preprocessor kinds
pub enum Preprocessor {
    Text(TextPreprocessor),
    Image(ImagePreprocessor),
    Audio(AudioPreprocessor),
    OneHot(OneHotPreprocessor),
    Multimodal(MultimodalPreprocessor),
}

impl Preprocessor {
    pub fn num_channels(&self) -> usize {
        match self {
            Preprocessor::Text(p) => p.num_channels(),
            Preprocessor::Image(p) => p.num_channels(),
            Preprocessor::Audio(p) => p.num_channels(),
            Preprocessor::OneHot(p) => p.num_channels(),
            Preprocessor::Multimodal(p) => p.num_channels(),
        }
    }

    pub fn forward(&self, inputs: &ModelInputs) -> Result<PreprocessorOutput> {
        match self {
            Preprocessor::Text(p) => p.forward(inputs.tensor()?),
            Preprocessor::Image(p) => p.forward(inputs.tensor()?),
            Preprocessor::Audio(p) => p.forward(inputs.tensor()?),
            Preprocessor::OneHot(p) => p.forward(inputs.tensor()?),
            Preprocessor::Multimodal(p) => match inputs {
                ModelInputs::Modalities(map) => p.forward(map),
                ModelInputs::Tensor(_) => Err(PerceiverError::shape_mismatch(
                    "multimodal preprocessor",
                    "a modality map",
                    "a single tensor",
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};
    use candle_nn::{VarBuilder, VarMap};

    fn small_config() -> PerceiverConfig {
        PerceiverConfig {
            vocab_size: 50,
            max_position_embeddings: 16,
            d_model: 24,
            num_labels: 7,
            samples_per_patch: 4,
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
    fn test_text_preprocessor_shapes() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let prep = TextPreprocessor::new(&config, vb).unwrap();
        assert_eq!(prep.num_channels(), 24);

        let ids = Tensor::zeros((2, 9), DType::U32, &device).unwrap();
        let out = prep.forward(&ids).unwrap();
        assert_eq!(out.inputs.dims(), &[2, 9, 24]);
        assert!(out.modality_sizes.is_none());
    }

    #[test]
    fn test_space_to_depth_rank4() {
        let device = Device::Cpu;
        let frames = Tensor::arange(0f32, (2 * 3 * 4 * 4) as f32, &device)
            .unwrap()
            .reshape((2, 3, 4, 4))
            .unwrap();
        let out = space_to_depth(&frames, 1, 2).unwrap();
        assert_eq!(out.dims(), &[2, 2, 2, 12]);
    }

    #[test]
    fn test_space_to_depth_rank5_merges_time_first() {
        let device = Device::Cpu;
        // Two 2x2 single-channel frames; merging in time pairs each pixel
        // with its counterpart from the next frame.
        let frames = Tensor::arange(0f32, 8.0, &device)
            .unwrap()
            .reshape((1, 2, 1, 2, 2))
            .unwrap();
        let out = space_to_depth(&frames, 2, 1).unwrap();
        assert_eq!(out.dims(), &[1, 1, 2, 2, 2]);
        let first: Vec<f32> = out.i((0, 0, 0, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![0.0, 4.0]);
    }

    #[test]
    fn test_image_preprocessor_pixels_fourier_width() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let prep = ImagePreprocessor::new(
            &config,
            ImagePreprocessorConfig {
                prep_type: ImagePrepKind::Pixels,
                spatial_downsample: 1,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 4,
                    max_resolution: vec![8, 8],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
            vb,
        )
        .unwrap();

        // 3 pixel channels + (4 bands * 2 dims * 2 phases + 2 raw coords).
        assert_eq!(prep.num_channels(), 3 + 18);
        let image = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &device).unwrap();
        let out = prep.forward(&image).unwrap();
        assert_eq!(out.inputs.dims(), &[1, 64, 21]);
        match out.inputs_without_pos {
            Some(InputsWithoutPos::Tensor(t)) => assert_eq!(t.dims(), &[1, 64, 3]),
            _ => panic!("expected per-tensor inputs_without_pos"),
        }
    }

    #[test]
    fn test_image_preprocessor_conv_rejects_bad_downsample() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let result = ImagePreprocessor::new(
            &config,
            ImagePreprocessorConfig {
                prep_type: ImagePrepKind::Conv,
                spatial_downsample: 3,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 4,
                    max_resolution: vec![8, 8],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
            vb,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_audio_preprocessor_patches() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let prep = AudioPreprocessor::new(
            &config,
            AudioPreprocessorConfig {
                samples_per_patch: 4,
                concat_or_add_pos: ConcatOrAdd::Concat,
                project_pos_dim: None,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 8,
                    max_resolution: vec![32],
                    concat_pos: true,
                    sine_only: false,
                },
            },
            vb,
        )
        .unwrap();

        // 4 samples + (8 bands * 2 phases + 1 raw coord).
        assert_eq!(prep.num_channels(), 4 + 17);
        let audio = Tensor::randn(0f32, 1.0, (2, 32), &device).unwrap();
        let out = prep.forward(&audio).unwrap();
        assert_eq!(out.inputs.dims(), &[2, 8, 21]);
    }

    #[test]
    fn test_multimodal_pads_to_common_width_and_records_sizes() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();

        let audio = AudioPreprocessor::new(
            &config,
            AudioPreprocessorConfig {
                samples_per_patch: 4,
                concat_or_add_pos: ConcatOrAdd::Concat,
                project_pos_dim: None,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 8,
                    max_resolution: vec![32],
                    concat_pos: true,
                    sine_only: false,
                },
            },
            vb.pp("audio"),
        )
        .unwrap();
        let label = OneHotPreprocessor::new(&config);

        let mut modalities = BTreeMap::new();
        modalities.insert("audio".to_string(), Preprocessor::Audio(audio));
        modalities.insert("label".to_string(), Preprocessor::OneHot(label));
        let mut mask_probs = BTreeMap::new();
        mask_probs.insert("label".to_string(), 1.0);

        let prep =
            MultimodalPreprocessor::new(&config, modalities, mask_probs, 2, vb.pp("multimodal"))
                .unwrap();
        // audio is widest at 21 channels; common width is 21 + 2.
        assert_eq!(prep.num_channels(), 23);

        let mut inputs = BTreeMap::new();
        inputs.insert(
            "audio".to_string(),
            Tensor::randn(0f32, 1.0, (2, 32), &device).unwrap(),
        );
        inputs.insert(
            "label".to_string(),
            Tensor::zeros((2, 7), DType::F32, &device).unwrap(),
        );
        let out = prep.forward(&inputs).unwrap();

        assert_eq!(out.inputs.dims(), &[2, 9, 23]);
        let sizes = out.modality_sizes.unwrap();
        assert_eq!(sizes["audio"], 8);
        assert_eq!(sizes["label"], 1);
        assert_eq!(sizes.values().sum::<usize>(), out.inputs.dim(1).unwrap());

        // Audio tokens come first (alphabetical order): the raw patch
        // samples survive in the first 4 channels.
        let first_tokens = out.inputs.i((0, 0..8, 0..4)).unwrap();
        assert_eq!(first_tokens.dims(), &[8, 4]);
    }
}
