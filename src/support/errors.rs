//! Error taxonomy
//!
//! Errors are split by blast radius: `ConfigError` is fatal at startup only,
//! `ModelError` is surfaced to API callers, `ProtocolError` closes the
//! offending connection, and `CommandError` stays inside the charger it
//! concerns. None of them may terminate the allocator loop.

use thiserror::Error;

/// Fatal startup errors (bad configuration, unreadable CSV files).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("CSV error in {path}: {message}")]
    Csv { path: String, message: String },
}

/// Registry integrity violations. Rejected and reported, never repaired.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Already exists: {entity} {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("Integrity: {0}")]
    Integrity(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Malformed OCPP-J traffic. The connection is closed; the charger reconnects.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Empty message array")]
    EmptyArray,

    #[error("Message type is not a number")]
    InvalidMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

/// Failures of an outbound call to a single charger.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("Charger not connected: {0}")]
    NotConnected(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Response timeout")]
    Timeout,

    /// The charger recently timed out; calls are held back until the
    /// cool-off lapses or the charger answers something.
    #[error("Charger {0} is cooling off after a timeout")]
    CoolingOff(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("CallError {code}: {description}")]
    CallError { code: String, description: String },
}

/// Rejected credentials, charger or API side. Other sessions are unaffected.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    Missing,

    #[error("Credentials rejected")]
    Rejected,
}
