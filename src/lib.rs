pub mod cli;
pub mod error;
pub mod report;

pub use error::{ProcscopeError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
