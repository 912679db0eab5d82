// Library interface for the AEGIS DNSSEC signer
// The binary in main.rs wires configuration, logging and the control console
// around the engine exported here.

pub mod config;
pub mod engine;
pub mod error;
pub mod fifoq;
pub mod lock_utils;
pub mod scheduler;
pub mod signer;

pub use config::SignerConfig;
pub use engine::{Engine, EngineShared};
pub use error::{AdapterError, HsmError, Result, SignerError};

/// Current Unix time in seconds
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
