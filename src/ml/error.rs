use crate::core::Device;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by checkpoint handling and inference.
///
/// Nothing here is retried internally; the caller decides whether to
/// re-locate, rebuild the engine or give up.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no valid checkpoint found in {}", dir.display())]
    NotFound { dir: PathBuf },

    #[error("failed to load checkpoint {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("device {device} unavailable: {reason}")]
    Device { device: Device, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("model is not initialized")]
    NotInitialized,

    #[error("failed to deploy checkpoint {} to {}: {reason}", from.display(), to.display())]
    Deploy {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("engine is in failed state and must be replaced: {reason}")]
    Failed { reason: String },

    #[error("backend returned {actual} values, expected {expected}")]
    InvalidOutput { expected: usize, actual: usize },

    #[error("invalid model config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

impl ModelError {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ModelError::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn device(device: Device, reason: impl ToString) -> Self {
        ModelError::Device {
            device,
            reason: reason.to_string(),
        }
    }

    /// Errors during init that leave the instance unusable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModelError::NotFound { .. }
                | ModelError::Load { .. }
                | ModelError::Device { .. }
                | ModelError::Failed { .. }
        )
    }
}
