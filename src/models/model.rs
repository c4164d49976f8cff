//! The Perceiver model: preprocess, encode into latents, decode, postprocess.
//!
//! `PerceiverModel` wires the optional preprocessor, the latent encoder,
//! the optional decoder and the optional postprocessor together. The task
//! structs below assemble full configurations for masked language
//! modeling, image classification, optical flow and multimodal
//! autoencoding.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};
use candle_nn::{loss, Init, VarBuilder};
use tracing::{debug, warn};

use crate::config::PerceiverConfig;
use crate::core::{PerceiverError, Result};
use crate::models::decoder::{
    BasicDecoder, BasicDecoderConfig, ClassificationDecoder, FlowDecoder, MultimodalDecoder,
    PerceiverDecoder, SubsampledPoints, VideoAutoencodingDecoder,
};
use crate::models::encoder::PerceiverEncoder;
use crate::models::modality::ModalitySizes;
use crate::models::position::PositionEncodingConfig;
use crate::models::postprocessor::{
    AudioPostprocessor, ClassificationPostprocessor, MultimodalPostprocessor, Postprocessor,
    PostprocessorOutput, ProjectionPostprocessor,
};
use crate::models::preprocessor::{
    AudioPreprocessor, AudioPreprocessorConfig, ConcatOrAdd, ImagePrepKind, ImagePreprocessor,
    ImagePreprocessorConfig, ModelInputs, MultimodalPreprocessor, OneHotPreprocessor,
    Preprocessor, TextPreprocessor,
};

/// The learned latent array, broadcast across the batch
pub struct PerceiverEmbeddings {
    latents: Tensor,
}

impl PerceiverEmbeddings {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let latents = vb.get_with_hints(
            (config.num_latents, config.d_latents),
            "latents",
            Init::Randn {
                mean: 0.0,
                stdev: config.initializer_range,
            },
        )?;
        Ok(Self { latents })
    }

    pub fn forward(&self, batch_size: usize) -> Result<Tensor> {
        let (n, d) = self.latents.dims2()?;
        Ok(self
            .latents
            .unsqueeze(0)?
            .broadcast_as((batch_size, n, d))?
            .contiguous()?)
    }
}

/// Model output: decoded logits plus the final latent state and optionally
/// collected attention maps
#[derive(Debug)]
pub struct PerceiverModelOutput {
    pub logits: Option<PostprocessorOutput>,
    pub last_hidden_state: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

pub struct PerceiverModel {
    config: PerceiverConfig,
    input_preprocessor: Option<Preprocessor>,
    output_postprocessor: Option<Postprocessor>,
    embeddings: PerceiverEmbeddings,
    encoder: PerceiverEncoder,
    decoder: Option<PerceiverDecoder>,
}

impl PerceiverModel {
    pub fn new(
        config: &PerceiverConfig,
        decoder: Option<PerceiverDecoder>,
        input_preprocessor: Option<Preprocessor>,
        output_postprocessor: Option<Postprocessor>,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let kv_dim = match &input_preprocessor {
            Some(preprocessor) => {
                let width = preprocessor.num_channels();
                if width != config.d_model {
                    warn!(
                        preprocessor_width = width,
                        d_model = config.d_model,
                        "preprocessor width differs from d_model; forward will reject inputs"
                    );
                }
                width
            }
            None => config.d_model,
        };
        Ok(Self {
            config: config.clone(),
            input_preprocessor,
            output_postprocessor,
            embeddings: PerceiverEmbeddings::new(config, vb.pp("embeddings"))?,
            encoder: PerceiverEncoder::new(config, kv_dim, vb.pp("encoder"))?,
            decoder,
        })
    }

    pub fn input_preprocessor(&self) -> Option<&Preprocessor> {
        self.input_preprocessor.as_ref()
    }

    /// Turns a `[batch, seq]` mask of ones and zeros into an additive
    /// `[batch, 1, 1, seq]` bias of 0 for kept and -1e9 for masked keys
    fn invert_attention_mask(mask: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len) = mask.dims2()?;
        let mask = mask.to_dtype(DType::F32)?;
        Ok(mask
            .affine(1e9, -1e9)?
            .reshape((batch_size, 1, 1, seq_len))?)
    }

    pub fn forward(
        &self,
        inputs: &ModelInputs,
        attention_mask: Option<&Tensor>,
        subsampled_output_points: Option<&SubsampledPoints>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
        output_hidden_states: bool,
    ) -> Result<PerceiverModelOutput> {
        let (inputs, modality_sizes, inputs_without_pos) = match &self.input_preprocessor {
            Some(preprocessor) => {
                let out = preprocessor.forward(inputs)?;
                (out.inputs, out.modality_sizes, out.inputs_without_pos)
            }
            None => match inputs {
                ModelInputs::Tensor(t) => (t.clone(), None, None),
                ModelInputs::Modalities(_) => {
                    return Err(PerceiverError::config(
                        "multimodal inputs require an input preprocessor",
                    ))
                }
            },
        };

        let (batch_size, seq_len, input_channels) = inputs.dims3()?;
        if input_channels != self.config.d_model {
            return Err(PerceiverError::shape_mismatch(
                "encoder inputs",
                format!("trailing dimension d_model = {}", self.config.d_model),
                format!("{input_channels}"),
            ));
        }
        debug!(batch_size, seq_len, input_channels, "encoding inputs");

        let extended_attention_mask = match attention_mask {
            Some(mask) => Self::invert_attention_mask(mask)?,
            None => Self::invert_attention_mask(&Tensor::ones(
                (batch_size, seq_len),
                DType::F32,
                inputs.device(),
            )?)?,
        };

        let embedding_output = self.embeddings.forward(batch_size)?;
        let encoder_outputs = self.encoder.forward(
            &embedding_output,
            &inputs,
            Some(&extended_attention_mask),
            head_mask,
            output_attentions,
            output_hidden_states,
        )?;
        let sequence_output = encoder_outputs.last_hidden_state;
        let mut cross_attentions = encoder_outputs.cross_attentions;

        let mut logits = None;
        if let Some(decoder) = &self.decoder {
            let output_modality_sizes = decoder
                .output_modality_sizes()
                .or_else(|| modality_sizes.clone());
            let query = decoder.decoder_query(
                &inputs,
                modality_sizes.as_ref(),
                inputs_without_pos.as_ref(),
                subsampled_output_points,
            )?;
            let decoder_outputs =
                decoder.forward(&query, &sequence_output, None, output_attentions)?;
            if let (Some(all), Some(extra)) =
                (cross_attentions.as_mut(), decoder_outputs.cross_attentions)
            {
                all.extend(extra);
            }

            logits = Some(match &self.output_postprocessor {
                Some(postprocessor) => postprocessor
                    .forward(&decoder_outputs.logits, output_modality_sizes.as_ref())?,
                None => PostprocessorOutput::Tensor(decoder_outputs.logits),
            });
        }

        Ok(PerceiverModelOutput {
            logits,
            last_hidden_state: sequence_output,
            hidden_states: encoder_outputs.hidden_states,
            attentions: encoder_outputs.attentions,
            cross_attentions,
        })
    }
}

impl PerceiverDecoder {
    /// Per-modality output partition when the decoder defines one
    fn output_modality_sizes(&self) -> Option<ModalitySizes> {
        match self {
            PerceiverDecoder::Multimodal(d) => d.output_modality_sizes(),
            _ => None,
        }
    }
}

/// Projects latent-width decodings onto the vocabulary with the tied input
/// embedding table
pub struct EmbeddingDecoder {
    bias: Tensor,
    vocab_size: usize,
}

impl EmbeddingDecoder {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let bias = vb.get_with_hints(config.vocab_size, "bias", Init::Const(0.0))?;
        Ok(Self {
            bias,
            vocab_size: config.vocab_size,
        })
    }

    pub fn forward(&self, hidden_states: &Tensor, embedding_weights: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, d_model) = hidden_states.dims3()?;
        let output = hidden_states
            .reshape((batch_size * seq_len, d_model))?
            .matmul(&embedding_weights.t()?)?
            .broadcast_add(&self.bias)?;
        Ok(output.reshape((batch_size, seq_len, self.vocab_size))?)
    }
}

/// Output of a task head with an optional training loss
pub struct TaskOutput {
    pub loss: Option<Tensor>,
    pub logits: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

/// Output of the multimodal autoencoding head, one tensor per modality
pub struct MultimodalTaskOutput {
    pub logits: BTreeMap<String, Tensor>,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

fn take_tensor_logits(output: Option<PostprocessorOutput>) -> Result<Tensor> {
    output
        .ok_or_else(|| PerceiverError::config("model was built without a decoder"))?
        .tensor()
}

/// Masked language modeling with a text preprocessor, a latent-width basic
/// decoder and a weight-tied vocabulary projection
pub struct PerceiverForMaskedLM {
    perceiver: PerceiverModel,
    embedding_decoder: EmbeddingDecoder,
    vocab_size: usize,
}

impl PerceiverForMaskedLM {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let vb_model = vb.pp("perceiver");
        let preprocessor =
            TextPreprocessor::new(config, vb_model.pp("input_preprocessor"))?;
        let decoder = BasicDecoder::new(
            config,
            BasicDecoderConfig {
                output_num_channels: config.d_latents,
                output_index_dims: Some(vec![config.max_position_embeddings]),
                num_channels: config.d_model,
                position_encoding: PositionEncodingConfig::Trainable {
                    index_dims: vec![config.max_position_embeddings],
                    num_channels: config.d_model,
                },
                qk_channels: Some(8 * 32),
                v_channels: Some(config.d_model),
                num_heads: 8,
                use_query_residual: false,
                final_project: false,
                ..Default::default()
            },
            vb_model.pp("decoder"),
        )?;
        let perceiver = PerceiverModel::new(
            config,
            Some(PerceiverDecoder::Basic(decoder)),
            Some(Preprocessor::Text(preprocessor)),
            None,
            vb_model,
        )?;
        Ok(Self {
            perceiver,
            embedding_decoder: EmbeddingDecoder::new(config, vb.pp("embedding_decoder"))?,
            vocab_size: config.vocab_size,
        })
    }

    fn embedding_weights(&self) -> Result<&Tensor> {
        match self.perceiver.input_preprocessor() {
            Some(Preprocessor::Text(p)) => Ok(p.embedding_weights()),
            _ => Err(PerceiverError::config(
                "masked language modeling requires a text preprocessor",
            )),
        }
    }

    /// `inputs` are token ids `[batch, seq]`; `labels`, when given, are
    /// target ids of the same shape
    pub fn forward(
        &self,
        inputs: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
        output_attentions: bool,
        output_hidden_states: bool,
    ) -> Result<TaskOutput> {
        let outputs = self.perceiver.forward(
            &ModelInputs::Tensor(inputs.clone()),
            attention_mask,
            None,
            None,
            output_attentions,
            output_hidden_states,
        )?;
        let decoded = take_tensor_logits(outputs.logits)?;
        let logits = self
            .embedding_decoder
            .forward(&decoded, self.embedding_weights()?)?;

        let loss = match labels {
            Some(labels) => {
                let (batch_size, seq_len, _) = logits.dims3()?;
                let flat = logits.reshape((batch_size * seq_len, self.vocab_size))?;
                let targets = labels.reshape((batch_size * seq_len,))?;
                Some(loss::cross_entropy(&flat, &targets)?)
            }
            None => None,
        };

        Ok(TaskOutput {
            loss,
            logits,
            hidden_states: outputs.hidden_states,
            attentions: outputs.attentions,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

/// Image front-end for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageClassificationKind {
    /// 1x1 convolution with learned, projected position embeddings
    Learned,
    /// Raw pixels with 2D Fourier features
    Fourier,
    /// Convolutional downsampling with 2D Fourier features
    Conv,
}

/// Image classification with a single learned classification query
pub struct PerceiverForImageClassification {
    perceiver: PerceiverModel,
    num_labels: usize,
}

impl PerceiverForImageClassification {
    pub fn new(
        config: &PerceiverConfig,
        kind: ImageClassificationKind,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb_model = vb.pp("perceiver");
        let prep = match kind {
            ImageClassificationKind::Learned => ImagePreprocessorConfig {
                prep_type: ImagePrepKind::Conv1x1,
                spatial_downsample: 1,
                out_channels: 256,
                concat_or_add_pos: ConcatOrAdd::Concat,
                project_pos_dim: Some(256),
                position_encoding: PositionEncodingConfig::Trainable {
                    index_dims: vec![config.image_size * config.image_size],
                    num_channels: 256,
                },
                ..Default::default()
            },
            ImageClassificationKind::Fourier => ImagePreprocessorConfig {
                prep_type: ImagePrepKind::Pixels,
                spatial_downsample: 1,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 64,
                    max_resolution: vec![224, 224],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
            ImageClassificationKind::Conv => ImagePreprocessorConfig {
                prep_type: ImagePrepKind::Conv,
                spatial_downsample: 4,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 64,
                    max_resolution: vec![56, 56],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
        };
        let preprocessor =
            ImagePreprocessor::new(config, prep, vb_model.pp("input_preprocessor"))?;
        let decoder = ClassificationDecoder::new(
            config,
            BasicDecoderConfig {
                num_channels: config.d_latents,
                position_encoding: PositionEncodingConfig::Trainable {
                    index_dims: vec![1],
                    num_channels: config.d_latents,
                },
                use_query_residual: true,
                ..Default::default()
            },
            vb_model.pp("decoder"),
        )?;
        let perceiver = PerceiverModel::new(
            config,
            Some(PerceiverDecoder::Classification(decoder)),
            Some(Preprocessor::Image(preprocessor)),
            None,
            vb_model,
        )?;
        Ok(Self {
            perceiver,
            num_labels: config.num_labels,
        })
    }

    /// `inputs` is a `[batch, channels, height, width]` image batch
    pub fn forward(
        &self,
        inputs: &Tensor,
        labels: Option<&Tensor>,
        output_attentions: bool,
        output_hidden_states: bool,
    ) -> Result<TaskOutput> {
        let outputs = self.perceiver.forward(
            &ModelInputs::Tensor(inputs.clone()),
            None,
            None,
            None,
            output_attentions,
            output_hidden_states,
        )?;
        let logits = take_tensor_logits(outputs.logits)?;

        let loss = match labels {
            Some(labels) if self.num_labels == 1 => {
                Some(loss::mse(&logits.flatten_all()?, &labels.flatten_all()?)?)
            }
            Some(labels) => Some(loss::cross_entropy(&logits, &labels.flatten_all()?)?),
            None => None,
        };

        Ok(TaskOutput {
            loss,
            logits,
            hidden_states: outputs.hidden_states,
            attentions: outputs.attentions,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

/// Dense optical flow over stacked frame pairs
pub struct PerceiverForOpticalFlow {
    perceiver: PerceiverModel,
}

impl PerceiverForOpticalFlow {
    pub fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let vb_model = vb.pp("perceiver");
        let (train_h, train_w) = config.train_size;
        let preprocessor = ImagePreprocessor::new(
            config,
            ImagePreprocessorConfig {
                prep_type: ImagePrepKind::Patches,
                spatial_downsample: 1,
                temporal_downsample: 2,
                conv_after_patching: true,
                conv_after_patching_in_channels: 54,
                out_channels: 64,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 64,
                    max_resolution: vec![train_h, train_w],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
            vb_model.pp("input_preprocessor"),
        )?;
        let decoder = FlowDecoder::new(
            config,
            BasicDecoderConfig {
                output_num_channels: 2,
                num_channels: config.d_model,
                use_query_residual: false,
                position_encoding: PositionEncodingConfig::Fourier {
                    num_bands: 64,
                    max_resolution: vec![train_h, train_w],
                    concat_pos: true,
                    sine_only: false,
                },
                ..Default::default()
            },
            (train_h, train_w),
            100.0,
            vb_model.pp("decoder"),
        )?;
        let perceiver = PerceiverModel::new(
            config,
            Some(PerceiverDecoder::Flow(decoder)),
            Some(Preprocessor::Image(preprocessor)),
            None,
            vb_model,
        )?;
        Ok(Self { perceiver })
    }

    /// `inputs` is a `[batch, 2, channels, height, width]` frame pair with
    /// per-pixel patch context in the channel axis
    pub fn forward(
        &self,
        inputs: &Tensor,
        labels: Option<&Tensor>,
        output_attentions: bool,
        output_hidden_states: bool,
    ) -> Result<TaskOutput> {
        if labels.is_some() {
            return Err(PerceiverError::unimplemented("optical flow training"));
        }
        let outputs = self.perceiver.forward(
            &ModelInputs::Tensor(inputs.clone()),
            None,
            None,
            None,
            output_attentions,
            output_hidden_states,
        )?;
        Ok(TaskOutput {
            loss: None,
            logits: take_tensor_logits(outputs.logits)?,
            hidden_states: outputs.hidden_states,
            attentions: outputs.attentions,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

/// Joint video, audio and label autoencoding with subsampled decoding
pub struct PerceiverForMultimodalAutoencoding {
    perceiver: PerceiverModel,
}

impl PerceiverForMultimodalAutoencoding {
    /// `subsampled_index_dims` gives the number of decoded output points
    /// per forward pass for the audio and image modalities
    pub fn new(
        config: &PerceiverConfig,
        subsampled_index_dims: &BTreeMap<String, usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb_model = vb.pp("perceiver");
        let n_audio_samples = config.num_frames * config.audio_samples_per_frame;

        let mut preprocessors = BTreeMap::new();
        preprocessors.insert(
            "audio".to_string(),
            Preprocessor::Audio(AudioPreprocessor::new(
                config,
                AudioPreprocessorConfig {
                    samples_per_patch: config.samples_per_patch,
                    concat_or_add_pos: ConcatOrAdd::Concat,
                    project_pos_dim: None,
                    position_encoding: PositionEncodingConfig::Fourier {
                        num_bands: 192,
                        max_resolution: vec![n_audio_samples],
                        concat_pos: true,
                        sine_only: false,
                    },
                },
                vb_model.pp("input_preprocessor.audio"),
            )?),
        );
        preprocessors.insert(
            "image".to_string(),
            Preprocessor::Image(ImagePreprocessor::new(
                config,
                ImagePreprocessorConfig {
                    prep_type: ImagePrepKind::Patches,
                    spatial_downsample: 4,
                    temporal_downsample: 1,
                    position_encoding: PositionEncodingConfig::Fourier {
                        num_bands: 32,
                        max_resolution: vec![
                            config.num_frames,
                            config.image_size,
                            config.image_size,
                        ],
                        concat_pos: true,
                        sine_only: false,
                    },
                    ..Default::default()
                },
                vb_model.pp("input_preprocessor.image"),
            )?),
        );
        preprocessors.insert(
            "label".to_string(),
            Preprocessor::OneHot(OneHotPreprocessor::new(config)),
        );
        let mut mask_probs = BTreeMap::new();
        mask_probs.insert("audio".to_string(), 0.0);
        mask_probs.insert("image".to_string(), 0.0);
        mask_probs.insert("label".to_string(), 1.0);
        let preprocessor = MultimodalPreprocessor::new(
            config,
            preprocessors,
            mask_probs,
            4,
            vb_model.pp("input_preprocessor"),
        )?;

        let mut sub_decoders = BTreeMap::new();
        sub_decoders.insert(
            "audio".to_string(),
            PerceiverDecoder::Basic(BasicDecoder::new(
                config,
                BasicDecoderConfig {
                    output_num_channels: 512,
                    output_index_dims: Some(vec![n_audio_samples / config.samples_per_patch]),
                    use_query_residual: false,
                    position_encoding_only: true,
                    position_encoding: PositionEncodingConfig::Fourier {
                        num_bands: 192,
                        max_resolution: vec![n_audio_samples],
                        concat_pos: true,
                        sine_only: false,
                    },
                    ..Default::default()
                },
                vb_model.pp("decoder.modalities.audio"),
            )?),
        );
        sub_decoders.insert(
            "image".to_string(),
            PerceiverDecoder::VideoAutoencoding(VideoAutoencodingDecoder::new(
                config,
                BasicDecoderConfig {
                    output_num_channels: 512,
                    use_query_residual: false,
                    position_encoding_only: true,
                    position_encoding: PositionEncodingConfig::Fourier {
                        num_bands: 32,
                        max_resolution: vec![
                            config.num_frames,
                            config.image_size,
                            config.image_size,
                        ],
                        concat_pos: true,
                        sine_only: false,
                    },
                    ..Default::default()
                },
                config.output_shape.clone(),
                vb_model.pp("decoder.modalities.image"),
            )?),
        );
        sub_decoders.insert(
            "label".to_string(),
            PerceiverDecoder::Classification(ClassificationDecoder::new(
                config,
                BasicDecoderConfig {
                    use_query_residual: false,
                    position_encoding_only: true,
                    position_encoding: PositionEncodingConfig::Trainable {
                        index_dims: vec![1],
                        num_channels: 1024,
                    },
                    ..Default::default()
                },
                vb_model.pp("decoder.modalities.label"),
            )?),
        );

        let mut output_sizes = ModalitySizes::new();
        for name in ["audio", "image"] {
            let n = subsampled_index_dims.get(name).copied().ok_or_else(|| {
                PerceiverError::config(format!(
                    "subsampled_index_dims must give a point count for '{name}'"
                ))
            })?;
            output_sizes.insert(name.to_string(), n);
        }
        output_sizes.insert("label".to_string(), 1);
        let num_outputs: usize = output_sizes.values().sum();

        let decoder = MultimodalDecoder::new(
            config,
            sub_decoders,
            num_outputs,
            512,
            2,
            Some(output_sizes),
            BasicDecoderConfig {
                use_query_residual: false,
                ..Default::default()
            },
            vb_model.pp("decoder"),
        )?;

        let mut postprocessors = BTreeMap::new();
        postprocessors.insert(
            "audio".to_string(),
            Postprocessor::Audio(AudioPostprocessor::new(
                config,
                512,
                vb_model.pp("output_postprocessor.audio"),
            )?),
        );
        postprocessors.insert(
            "image".to_string(),
            Postprocessor::Projection(ProjectionPostprocessor::new(
                512,
                3,
                vb_model.pp("output_postprocessor.image"),
            )?),
        );
        postprocessors.insert(
            "label".to_string(),
            Postprocessor::Classification(ClassificationPostprocessor::new(
                config,
                512,
                vb_model.pp("output_postprocessor.label"),
            )?),
        );
        let postprocessor = MultimodalPostprocessor::new(postprocessors)?;

        let perceiver = PerceiverModel::new(
            config,
            Some(PerceiverDecoder::Multimodal(decoder)),
            Some(Preprocessor::Multimodal(preprocessor)),
            Some(Postprocessor::Multimodal(postprocessor)),
            vb_model,
        )?;
        Ok(Self { perceiver })
    }

    pub fn forward(
        &self,
        inputs: &BTreeMap<String, Tensor>,
        subsampled_output_points: Option<&BTreeMap<String, Vec<usize>>>,
        labels: Option<&Tensor>,
        output_attentions: bool,
        output_hidden_states: bool,
    ) -> Result<MultimodalTaskOutput> {
        if labels.is_some() {
            return Err(PerceiverError::unimplemented(
                "multimodal autoencoding training",
            ));
        }
        let subsampled = subsampled_output_points
            .map(|points| SubsampledPoints::Modalities(points.clone()));
        let outputs = self.perceiver.forward(
            &ModelInputs::Modalities(inputs.clone()),
            None,
            subsampled.as_ref(),
            None,
            output_attentions,
            output_hidden_states,
        )?;
        let logits = match outputs.logits {
            Some(PostprocessorOutput::Modalities(map)) => map,
            _ => {
                return Err(PerceiverError::shape_mismatch(
                    "multimodal autoencoding output",
                    "per-modality logits",
                    "a single tensor",
                ))
            }
        };
        Ok(MultimodalTaskOutput {
            logits,
            hidden_states: outputs.hidden_states,
            attentions: outputs.attentions,
            cross_attentions: outputs.cross_attentions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};
    use candle_nn::{VarBuilder, VarMap};

    fn vb(device: &Device) -> (VarMap, VarBuilder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn small_config() -> PerceiverConfig {
        PerceiverConfig {
            num_latents: 4,
            d_latents: 16,
            d_model: 24,
            num_blocks: 1,
            num_self_attends_per_block: 2,
            num_self_attention_heads: 2,
            num_cross_attention_heads: 2,
            vocab_size: 50,
            max_position_embeddings: 16,
            attention_probs_dropout_prob: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_latents_broadcast_across_batch() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let embeddings = PerceiverEmbeddings::new(&config, vb).unwrap();
        let out = embeddings.forward(3).unwrap();
        assert_eq!(out.dims(), &[3, 4, 16]);

        let first: Vec<f32> = out.i((0, 0)).unwrap().to_vec1().unwrap();
        let third: Vec<f32> = out.i((2, 0)).unwrap().to_vec1().unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_model_rejects_wrong_input_width() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let model = PerceiverModel::new(&config, None, None, None, vb).unwrap();

        let inputs = Tensor::zeros((1, 5, 7), DType::F32, &device).unwrap();
        let err = model
            .forward(&ModelInputs::Tensor(inputs), None, None, None, false, false)
            .unwrap_err();
        assert!(err.to_string().contains("d_model"));
    }

    #[test]
    fn test_masked_lm_shapes_and_loss() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = small_config();
        let model = PerceiverForMaskedLM::new(&config, vb).unwrap();

        let ids = Tensor::zeros((1, 16), DType::U32, &device).unwrap();
        let labels = Tensor::ones((1, 16), DType::U32, &device).unwrap();
        let out = model
            .forward(&ids, None, Some(&labels), false, false)
            .unwrap();
        assert_eq!(out.logits.dims(), &[1, 16, 50]);
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }
}
