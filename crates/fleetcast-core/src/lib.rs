//! Core types and utilities for the fleetcast control plane.
//!
//! This crate provides the building blocks shared by all fleetcast
//! components:
//! - Configuration management
//! - Error types with stable, caller-visible kinds
//! - Process definitions replicated through the cluster

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod process;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use process::{CleanupRule, ConfigIo, ProcessConfig, ProcessId};
