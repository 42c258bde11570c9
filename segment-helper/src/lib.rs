//! Segment helper library
//!
//! Everything a segment needs to move table data between `COPY ... ON SEGMENT`
//! pipes and backup files: path layout, segment TOC, codecs, pipe registry,
//! plugin bridge and the backup/restore agent loops.

pub mod agent;
pub mod compression;
pub mod config;
pub mod daemon;
pub mod filepath;
pub mod pipe;
pub mod plugin;
pub mod resize;
pub mod toc;
pub mod transfer;
pub mod utils;

pub use config::{AgentMode, HelperArgs, HelperConfig};
pub use utils::errors::{HelperError, Result};

/// Helper version, checked by the coordinator on every segment host.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
