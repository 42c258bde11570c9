//! Restore coordinator library
//!
//! Loads a backup set, restores its metadata over a pool of database
//! connections and drives the segment helpers that feed table data into
//! `COPY ... FROM PROGRAM ... ON SEGMENT`.

pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

pub use config::AppConfig;
pub use error::{RestoreError, Result};
pub use state::RestoreContext;
