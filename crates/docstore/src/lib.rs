//! Single-document JSON persistence
//!
//! Each document (settings, model registry) lives in one storage slot and is
//! guarded by its own async mutex.

mod document;
mod storage;

pub use document::Document;
pub use storage::{FileBackedStorage, InMemoryStorage, Storage};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
