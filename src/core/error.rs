//! Structured error handling for the Perceiver crate.
//!
//! Every failure mode of the pipeline falls into one of a small number of
//! categories: configuration errors are raised at construction time,
//! shape mismatches at the start of a forward call, and unimplemented task
//! branches fail loudly instead of producing wrong numbers.

use thiserror::Error;

/// Result type alias with PerceiverError
pub type Result<T> = std::result::Result<T, PerceiverError>;

/// Main error type for the Perceiver crate
#[derive(Error, Debug)]
pub enum PerceiverError {
    /// Invalid configuration, detected at construction time
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Tensor shape disagreeing with the configured model, detected at the
    /// start of a forward call
    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    /// Explicitly unsupported task or loss combination
    #[error("Not implemented: {feature}")]
    Unimplemented { feature: String },

    /// Propagated tensor-framework error
    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl PerceiverError {
    /// Construction-time configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Forward-time shape mismatch
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Unsupported path that must fail loudly
    pub fn unimplemented(feature: impl Into<String>) -> Self {
        Self::Unimplemented {
            feature: feature.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = PerceiverError::config("qk_channels (7) must be divisible by num_heads (2)");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = PerceiverError::shape_mismatch("model inputs", "d_model = 704", "701");
        assert!(err.to_string().contains("model inputs"));
        assert!(err.to_string().contains("704"));
    }
}
