//! lz-core: Core abstractions and configuration for lazy-manager
//!
//! This crate provides the shared domain types, the error taxonomy and the
//! configuration structures used by the broker daemon.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::LzError;
pub use types::{LinkState, PeerAddr, PeerRole};
