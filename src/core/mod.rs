//! Core framework types shared across the crate.

pub mod error;

pub use error::{PerceiverError, Result};
