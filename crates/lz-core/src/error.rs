//! Core error types for lazy-manager

use lz_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::PeerAddr;

/// Top-level error type for the lazy-manager ecosystem
#[derive(Error, Debug)]
pub enum LzError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Dialing the peer failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: PeerAddr, reason: String },

    /// Dialing the peer did not complete in time
    #[error("Connection to {0} timed out")]
    ConnectTimeout(PeerAddr),

    /// The session is closed; nothing more can be sent on it
    #[error("Connection closed")]
    Closed,

    /// The outbound queue stayed full for the whole send timeout
    #[error("Send to {0} timed out")]
    SendTimeout(PeerAddr),

    /// The envelope could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] ProtocolError),
}

impl ConnectionError {
    /// Whether this error means the connection is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionError::Closed)
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
