//! Error types for fused-kernel generation

use superfuse_core::{CoreError, OPTION_ERROR_CODE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("[{code}] invalid fusion option `{key}`: {reason}", code = OPTION_ERROR_CODE)]
    InvalidOption { key: String, reason: String },

    #[error("Invalid operator `{operator}`: {reason}")]
    InvalidOperator { operator: String, reason: String },

    #[error("Invalid event on operator `{operator}`: {reason}")]
    InvalidEvent { operator: String, reason: String },

    /// Topological-order or duplicate-edge violation
    #[error("Malformed graph: {reason}")]
    MalformedGraph { reason: String },

    /// A dynamic operator whose readiness lock lacks a provable single writer
    #[error("Unresolved dynamic dependency on `{operator}`: {reason}")]
    UnresolvedDynamicDependency { operator: String, reason: String },

    /// A wait that no signal in the schedule can satisfy
    #[error("Unmatched wait on edge {edge}: {reason}")]
    UnmatchedWait { edge: String, reason: String },

    #[error("No free cross-domain channel for edge {edge}")]
    ChannelExhausted { edge: String },
}

impl CodegenError {
    pub(crate) fn option(key: &str, reason: impl Into<String>) -> Self {
        CodegenError::InvalidOption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn operator(operator: &str, reason: impl Into<String>) -> Self {
        CodegenError::InvalidOperator {
            operator: operator.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CodegenError::MalformedGraph { reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, CodegenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_error_carries_code() {
        let err = CodegenError::option("split-mode", "must be in 1..=64");
        let text = err.to_string();
        assert!(text.starts_with("[EB0500]"));
        assert!(text.contains("split-mode"));
    }

    #[test]
    fn test_core_error_is_transparent() {
        let err: CodegenError = CoreError::UnsupportedKernelType { code: 3 }.into();
        assert!(err.to_string().contains("Unsupported kernel type value: 3"));
    }
}
