//! Error types for fake quantization and the QAT layers.

/// Errors surfaced by `apply`, `calibrate`, `forward` and the constructors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QatError {
    /// Bad scale, malformed qmin/qmax, non-divisible groups, ...
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Quantization requested before any observation and without initial params.
    #[error("fake quantizer has no observed statistics and no initial parameters")]
    UninitializedQuantizer,

    /// Incompatible tensor shapes, raised by the convolution primitive.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub type Result<T> = std::result::Result<T, QatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QatError::InvalidConfig("in_channels (3) must be divisible by groups (2)".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: in_channels (3) must be divisible by groups (2)"
        );
        assert!(QatError::UninitializedQuantizer.to_string().contains("no observed statistics"));
    }
}
