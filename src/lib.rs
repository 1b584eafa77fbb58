pub mod config;
pub mod encoding;
pub mod error;
pub mod hashers;
pub mod kv;
pub mod memdb;
pub mod point;
pub mod scheduler;
pub mod table;
pub mod tmpfs;

pub use config::{MemDbConfig, StoreConfig};
pub use error::Error;
pub use kv::version::StoreVersionSet;
pub use memdb::MemoryDatabase;
pub use point::Point;
pub use table::TableWriter;
