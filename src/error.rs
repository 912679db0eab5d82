//! Signer error taxonomy
//!
//! Stage errors are zone-local: a failing zone backs off and retries while
//! every other zone keeps moving. Only HSM failures reach engine scope,
//! because the HSM is shared infrastructure.

use thiserror::Error;

/// Errors raised while running a zone stage or touching the scheduler.
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("HSM error: {0}")]
    Hsm(#[from] HsmError),

    #[error("Task already scheduled for {0}")]
    SchedulingConflict(String),

    #[error("{failed} of {appointed} signing units failed")]
    Batch { appointed: usize, failed: usize },

    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Interrupted by engine shutdown")]
    Interrupted,
}

impl SignerError {
    /// Soft errors are expected transient conditions and log quietly.
    pub fn is_soft(&self) -> bool {
        matches!(self, SignerError::Adapter(e) if e.is_soft())
    }

    /// Whether this error should trigger an engine-wide reload.
    pub fn needs_reload(&self) -> bool {
        matches!(self, SignerError::Hsm(e) if e.is_context_failure())
    }
}

/// Input/output adapter errors.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Input not ready: {0}")]
    NotReady(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl AdapterError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        AdapterError::Io {
            path: path.into(),
            source,
        }
    }

    /// "Not ready" is expected while a transfer is pending.
    pub fn is_soft(&self) -> bool {
        matches!(self, AdapterError::NotReady(_))
    }
}

/// HSM session and signing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HsmError {
    #[error("Failed to create HSM context: {0}")]
    ContextCreation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("Key storage error: {0}")]
    Storage(String),

    #[error("HSM is closed")]
    Closed,
}

impl HsmError {
    /// Context and session failures mean the shared HSM needs reopening.
    pub fn is_context_failure(&self) -> bool {
        matches!(self, HsmError::ContextCreation(_) | HsmError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, SignerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SignerError::Config("missing signconf".to_string());
        assert!(err.to_string().contains("Configuration error"));

        let err = SignerError::SchedulingConflict("example.com".to_string());
        assert!(err.to_string().contains("example.com"));

        let err = SignerError::Batch {
            appointed: 10,
            failed: 2,
        };
        assert_eq!(err.to_string(), "2 of 10 signing units failed");
    }

    #[test]
    fn test_not_ready_is_soft() {
        let err: SignerError = AdapterError::NotReady("transfer pending".to_string()).into();
        assert!(err.is_soft());
        assert!(!err.needs_reload());

        let err: SignerError = AdapterError::Parse("bad json".to_string()).into();
        assert!(!err.is_soft());
    }

    #[test]
    fn test_context_failure_needs_reload() {
        let err: SignerError = HsmError::ContextCreation("token gone".to_string()).into();
        assert!(err.needs_reload());

        let err: SignerError = HsmError::KeyNotFound("abc".to_string()).into();
        assert!(!err.needs_reload());
    }
}
