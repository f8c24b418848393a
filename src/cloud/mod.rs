mod memory;
mod models;
mod rest;
mod store;

pub use memory::MemoryCloud;
pub use models::*;
pub use rest::{RestCloudStore, RestTables};
pub use store::{BlobStore, CloudError, CloudStore};
