//! Utility modules shared by the engines and the CLI.

pub mod errors;
pub mod logger;
pub mod shutdown;

pub use errors::{BuckethError, Result};
