//! phasing-core: Core abstractions and configuration for phasing
//!
//! This crate provides the shared types, error taxonomy, backoff and
//! configuration structures used by the tunnel, cluster and CLI crates.

pub mod backoff;
pub mod config;
pub mod error;
pub mod types;

pub use backoff::ExponentialBackoff;
pub use error::PhasingError;
pub use types::{Endpoint, ResolvedSession, Selector};
