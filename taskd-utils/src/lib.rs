//! taskd-utils: Common utilities shared across taskd crates
//!
//! This crate provides:
//! - Unified error types ([`TaskdError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

// Re-export main types at crate root for convenience
pub use error::{Result, TaskdError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

// Re-export commonly used path functions
pub use paths::{log_dir, runtime_dir, socket_path, state_dir};
