//! Error types for effect configuration and execution.
//!
//! Every fallible operation in the crate returns [`Result<T>`]. Errors are
//! structural: they describe a misconfigured pipeline (a bad attachment point,
//! a pass reading data that does not exist yet, an effect chained into itself)
//! and are meant to be fixed in code, so nothing in the crate retries them.
//!
//! Callers that only care about the broad category can match on
//! [`FxError::kind`]:
//!
//! ```
//! use hoplite_fx::{ErrorKind, FxError};
//!
//! let err = FxError::UsageOrder("add_pass called before setup".into());
//! assert_eq!(err.kind(), ErrorKind::UsageOrder);
//! ```

use thiserror::Error;

/// Convenience alias used by every fallible API in the crate.
pub type Result<T> = std::result::Result<T, FxError>;

/// Broad error category of an [`FxError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An operation was invoked before the state it depends on exists.
    UsageOrder,
    /// The requested pipeline configuration is illegal.
    Configuration,
    /// An effect is chained to itself, directly or transitively.
    Cycle,
    /// The graphics backend failed to allocate or compile a resource.
    ResourceCreation,
}

/// The error type for all effect, pass and backend operations.
#[derive(Error, Debug)]
pub enum FxError {
    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// Operation invoked before the effect finished its one-time setup, or
    /// before a frame produced a result.
    #[error("Usage order error: {0}")]
    UsageOrder(String),

    // ========================================================================
    // Pipeline configuration
    // ========================================================================
    /// Illegal attachment point, format mismatch, conflicting slot usage,
    /// out-of-order buffer binding or out-of-range uniform dimensions.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A handle that no longer (or never) referred to a live resource.
    #[error("Unknown {kind} handle")]
    UnknownHandle {
        /// Resource family of the stale handle, e.g. `"texture"`.
        kind: &'static str,
    },

    /// Effect chain loops back onto an effect that is already executing.
    #[error("Effect cycle detected: {0}")]
    Cycle(String),

    // ========================================================================
    // Backend
    // ========================================================================
    /// Texture, framebuffer or program creation failed in the backend.
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),
}

impl FxError {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FxError::UsageOrder(_) => ErrorKind::UsageOrder,
            FxError::Configuration(_) | FxError::UnknownHandle { .. } => ErrorKind::Configuration,
            FxError::Cycle(_) => ErrorKind::Cycle,
            FxError::ResourceCreation(_) => ErrorKind::ResourceCreation,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        FxError::Configuration(msg.into())
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        FxError::UsageOrder(msg.into())
    }

    pub(crate) fn creation(msg: impl Into<String>) -> Self {
        FxError::ResourceCreation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_handle_is_a_configuration_error() {
        let err = FxError::UnknownHandle { kind: "texture" };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "Unknown texture handle");
    }

    #[test]
    fn messages_carry_the_violated_invariant() {
        let err = FxError::config("attachment point 9 out of range");
        assert_eq!(
            err.to_string(),
            "Configuration error: attachment point 9 out of range"
        );
        assert_eq!(FxError::usage("x").kind(), ErrorKind::UsageOrder);
        assert_eq!(FxError::creation("x").kind(), ErrorKind::ResourceCreation);
        assert_eq!(FxError::Cycle("a".into()).kind(), ErrorKind::Cycle);
    }
}
