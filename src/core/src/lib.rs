//! Kiln Core - shared types for the kiln image builder.
//!
//! Error taxonomy, builder configuration and the build status channel
//! used by the builder engine and its front-ends.

pub mod config;
pub mod error;
pub mod status;

// Re-export commonly used types
pub use config::{BuilderConfig, LogLevel, DEFAULT_CAPABILITIES};
pub use error::{KilnError, Result};
pub use status::{status_channel, StatusReceiver, StatusSender};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
