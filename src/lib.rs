pub mod config;
pub mod error;
pub mod models;
pub mod render;
pub mod store;

pub use config::{StorageLayout, StoreConfig};
pub use error::{Error, Result};
pub use render::{ContentRenderer, DefaultRenderer, RenderedContent};
pub use store::{LocalStore, StoreHandle};
