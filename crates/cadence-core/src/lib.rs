//! `cadence-core`: process-level configuration and errors shared by the
//! scheduler engine and the daemon binary.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CoreError, Result};
