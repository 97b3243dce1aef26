//! Model lifecycle: settings, registry, search, downloads, uploads, activation.

pub mod error;
pub mod schema;
pub mod manifest;
pub mod settings;
pub mod registry;
pub mod hub;
pub mod search;
pub mod scanner;
pub mod progress;
pub mod broadcast;
pub mod download;
pub mod activation;
pub mod removal;
pub mod upload;
pub mod memory;

pub use error::*;
pub use schema::*;
pub use manifest::*;
pub use settings::*;
pub use registry::*;
pub use hub::{HubClient, HubModel, PullEvent, AUX_TIMEOUT};
pub use scanner::*;
pub use search::{HfSearchClient, SearchResult, HF_API_URL};
pub use broadcast::*;
pub use download::*;
pub use activation::*;
pub use removal::*;
pub use upload::*;
pub use memory::*;
