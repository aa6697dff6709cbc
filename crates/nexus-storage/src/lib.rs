pub mod db;
pub mod error;
pub mod reader;
pub mod tokens;
pub mod types;
pub mod writer;

pub use error::{Result, StorageError};
pub use reader::StorageReader;
pub use tokens::{DailyUsage, WindowUsage};
pub use types::{RequestRecord, ResponseRecord, StreamingChunkRecord};
pub use writer::StorageWriter;
