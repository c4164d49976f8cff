//! Configuration types for Perceiver models.

pub mod model_config;

pub use model_config::{CrossAttentionShape, HiddenAct, PerceiverConfig};
