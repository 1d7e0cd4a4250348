//! `SecureChat` Core Library
//!
//! Shared functionality for `SecureChat` components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Per-identity user data store with a durable flush point
//! - Common error types

pub mod config;
pub mod error;
pub mod storage;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use storage::{Bucket, JsonFileBackend, MemoryBackend, StorageBackend, UserDataStore};
