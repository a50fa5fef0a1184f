//! Common types for the metafs metadata client
//!
//! This crate defines the identifiers, error type, and configuration shared
//! by the protocol and client crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use types::{Epoch, Ino, MdsRank, MdsState, Tid};
