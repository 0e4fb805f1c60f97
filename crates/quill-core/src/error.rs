//! Error types for quill-core.

use std::time::Duration;

use thiserror::Error;

/// Result type for quill-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating kernels.
///
/// Transport-level failures (spawn, write, lookup) surface here and are
/// returned synchronously. Execution-semantic failures such as directive
/// errors or exceptions in user code travel as `error` kernel messages
/// instead and never appear in this enum.
#[derive(Debug, Error)]
pub enum Error {
    /// No kernel spec with this name is built in or discoverable.
    #[error("kernel spec not found: {0}")]
    SpecNotFound(String),

    /// The kernel process could not be launched.
    #[error("failed to spawn kernel {kernel_id}: {message}")]
    Spawn { kernel_id: String, message: String },

    /// The kernel did not signal readiness in time (strict policy only).
    #[error("kernel {kernel_id} not ready after {timeout:?}")]
    ReadinessTimeout { kernel_id: String, timeout: Duration },

    /// A protocol record could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Writing a directive to the kernel failed. The kernel is now dead.
    #[error("failed to write to kernel {kernel_id}: {message}")]
    Write { kernel_id: String, message: String },

    /// No kernel is registered under this id.
    #[error("kernel not found: {0}")]
    KernelNotFound(String),

    /// The kernel exists but its process has exited.
    #[error("kernel {0} is dead")]
    KernelDead(String),

    /// The remote kernel gateway rejected or failed a call.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Render the error together with a short recovery hint for operators.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::SpecNotFound(_) => {
                Some("run `quill specs` to list the available kernel specs")
            }
            Error::Spawn { .. } => {
                Some("check that the engine binary exists or set QUILL_ENGINE_PATH")
            }
            Error::ReadinessTimeout { .. } => {
                Some("raise QUILL_READY_TIMEOUT_MS or unset QUILL_READINESS_STRICT")
            }
            Error::Write { .. } | Error::KernelDead(_) => Some("restart the kernel"),
            Error::Gateway(_) => Some("check QUILL_GATEWAY_URL and QUILL_GATEWAY_TOKEN"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_for_dead_kernel() {
        let err = Error::KernelDead("k1".to_string());
        let rendered = err.with_hint();
        assert!(rendered.starts_with("kernel k1 is dead"));
        assert!(rendered.contains("restart the kernel"));
    }

    #[test]
    fn test_no_hint_for_not_found() {
        let err = Error::KernelNotFound("k2".to_string());
        assert_eq!(err.with_hint(), "kernel not found: k2");
    }
}
