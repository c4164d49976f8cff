//! Modality postprocessors: decoded token sequences back to task outputs.

use std::collections::BTreeMap;

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::PerceiverConfig;
use crate::core::{PerceiverError, Result};
use crate::models::modality::{restructure, ModalitySizes};

/// Postprocessed output: a single tensor or one per modality
#[derive(Debug, Clone)]
pub enum PostprocessorOutput {
    Tensor(Tensor),
    Modalities(BTreeMap<String, Tensor>),
}

impl PostprocessorOutput {
    /// Unwraps the single-tensor case
    pub fn tensor(self) -> Result<Tensor> {
        match self {
            PostprocessorOutput::Tensor(t) => Ok(t),
            PostprocessorOutput::Modalities(_) => Err(PerceiverError::shape_mismatch(
                "postprocessor output",
                "a single tensor",
                "a modality map",
            )),
        }
    }
}

/// Classifies on the first decoded token: `[b, n, c] -> [b, num_labels]`
pub struct ClassificationPostprocessor {
    classifier: Linear,
}

impl ClassificationPostprocessor {
    pub fn new(config: &PerceiverConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            classifier: linear(in_channels, config.num_labels, vb.pp("classifier"))?,
        })
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let logits = self.classifier.forward(inputs)?;
        Ok(logits.narrow(1, 0, 1)?.squeeze(1)?)
    }
}

/// Expands decoded patches back into raw samples: `[b, n, c] -> [b, n * spp]`
pub struct AudioPostprocessor {
    classifier: Linear,
    samples_per_patch: usize,
}

impl AudioPostprocessor {
    pub fn new(config: &PerceiverConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            classifier: linear(in_channels, config.samples_per_patch, vb.pp("classifier"))?,
            samples_per_patch: config.samples_per_patch,
        })
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let logits = self.classifier.forward(inputs)?;
        let (batch_size, num_patches, _) = logits.dims3()?;
        Ok(logits.reshape((batch_size, num_patches * self.samples_per_patch))?)
    }
}

/// Plain channel projection on the last axis
pub struct ProjectionPostprocessor {
    classifier: Linear,
}

impl ProjectionPostprocessor {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            classifier: linear(in_channels, out_channels, vb.pp("classifier"))?,
        })
    }

    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        Ok(self.classifier.forward(inputs)?)
    }
}

/// Partitions the decoded sequence by modality and applies each modality's
/// postprocessor to its slice
pub struct MultimodalPostprocessor {
    modalities: BTreeMap<String, Postprocessor>,
}

impl MultimodalPostprocessor {
    pub fn new(modalities: BTreeMap<String, Postprocessor>) -> Result<Self> {
        if modalities.is_empty() {
            return Err(PerceiverError::config(
                "multimodal postprocessor needs at least one modality",
            ));
        }
        Ok(Self { modalities })
    }

    pub fn forward(
        &self,
        inputs: &Tensor,
        modality_sizes: &ModalitySizes,
    ) -> Result<BTreeMap<String, Tensor>> {
        let parts = restructure(modality_sizes, inputs)?;
        let mut outputs = BTreeMap::new();
        for (modality, postprocessor) in &self.modalities {
            let part = parts.get(modality).ok_or_else(|| {
                PerceiverError::shape_mismatch(
                    "multimodal postprocessor",
                    format!("a decoded slice for modality '{modality}'"),
                    "missing entry",
                )
            })?;
            let out = postprocessor
                .forward(&part.contiguous()?, None)?
                .tensor()?;
            outputs.insert(modality.clone(), out);
        }
        Ok(outputs)
    }
}

/// Closed set of postprocessor kinds
pub enum Postprocessor {
    Classification(ClassificationPostprocessor),
    Audio(AudioPostprocessor),
    Projection(ProjectionPostprocessor),
    Multimodal(MultimodalPostprocessor),
}

impl Postprocessor {
    pub fn forward(
        &self,
        inputs: &Tensor,
        modality_sizes: Option<&ModalitySizes>,
    ) -> Result<PostprocessorOutput> {
        match self {
            Postprocessor::Classification(p) => Ok(PostprocessorOutput::Tensor(p.forward(inputs)?)),
            Postprocessor::Audio(p) => Ok(PostprocessorOutput::Tensor(p.forward(inputs)?)),
            Postprocessor::Projection(p) => Ok(PostprocessorOutput::Tensor(p.forward(inputs)?)),
            Postprocessor::Multimodal(p) => {
                let sizes = modality_sizes.ok_or_else(|| {
                    PerceiverError::config(
                        "multimodal postprocessing requires decoded modality sizes",
                    )
                })?;
                Ok(PostprocessorOutput::Modalities(p.forward(inputs, sizes)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn vb(device: &Device) -> (VarMap, VarBuilder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_audio_postprocessor_expands_patches() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = PerceiverConfig {
            samples_per_patch: 16,
            ..Default::default()
        };
        let post = AudioPostprocessor::new(&config, 8, vb).unwrap();
        let decoded = Tensor::randn(0f32, 1.0, (2, 5, 8), &device).unwrap();
        let out = post.forward(&decoded).unwrap();
        assert_eq!(out.dims(), &[2, 80]);
    }

    #[test]
    fn test_multimodal_postprocessor_splits_by_modality() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = PerceiverConfig {
            samples_per_patch: 4,
            num_labels: 3,
            ..Default::default()
        };

        let mut modalities = BTreeMap::new();
        modalities.insert(
            "audio".to_string(),
            Postprocessor::Audio(AudioPostprocessor::new(&config, 6, vb.pp("audio")).unwrap()),
        );
        modalities.insert(
            "label".to_string(),
            Postprocessor::Classification(
                ClassificationPostprocessor::new(&config, 6, vb.pp("label")).unwrap(),
            ),
        );
        let post = MultimodalPostprocessor::new(modalities).unwrap();

        let decoded = Tensor::randn(0f32, 1.0, (2, 9, 6), &device).unwrap();
        let mut sizes = ModalitySizes::new();
        sizes.insert("audio".to_string(), 8);
        sizes.insert("label".to_string(), 1);
        let outputs = post.forward(&decoded, &sizes).unwrap();

        assert_eq!(outputs["audio"].dims(), &[2, 32]);
        assert_eq!(outputs["label"].dims(), &[2, 3]);
    }
}
