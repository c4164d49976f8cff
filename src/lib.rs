//! # Perceiver - Multi-Modal Latent Transformer
//!
//! A Candle implementation of the Perceiver architecture: a fixed-size
//! learned latent array attends to arbitrarily shaped inputs once, is
//! refined by a weight-shared self-attention block, and is read out by
//! task-specific cross-attention decoders.
//!
//! ## Features
//!
//! - **Modality-agnostic core**: text, image, audio and one-hot inputs all
//!   map to the same `[batch, seq, channels]` token interface
//! - **Constant parameter count in depth**: one self-attention block is
//!   applied repeatedly, so depth never changes the parameter count
//! - **Subsampled decoding**: decode any subset of output points per pass
//! - **Task heads**: masked language modeling, image classification,
//!   optical flow and multimodal autoencoding
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use perceiver::{PerceiverConfig, PerceiverForMaskedLM};
//!
//! let config = PerceiverConfig::default();
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//!
//! let model = PerceiverForMaskedLM::new(&config, vb)?;
//! let ids = Tensor::zeros((1, 2048), DType::U32, &device)?;
//! let output = model.forward(&ids, None, None, false, false)?;
//! // output.logits: [1, 2048, vocab_size]
//! ```

#![allow(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod core;
pub mod models;

// Re-exports for convenience
pub use config::{CrossAttentionShape, HiddenAct, PerceiverConfig};
pub use core::{PerceiverError, Result};
pub use models::{
    ImageClassificationKind, ModelInputs, PerceiverDecoder, PerceiverEncoder,
    PerceiverForImageClassification, PerceiverForMaskedLM, PerceiverForMultimodalAutoencoding,
    PerceiverForOpticalFlow, PerceiverModel, PerceiverModelOutput, Postprocessor, Preprocessor,
    SubsampledPoints,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
