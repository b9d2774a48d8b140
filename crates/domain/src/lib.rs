//! Shared domain types for the Bor control plane: policies, nodes, groups,
//! bindings, the common error type, and server/agent configuration.

pub mod config;
pub mod error;
pub mod model;

pub use error::{Error, Result};
