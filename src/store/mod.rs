//! In-memory document store with a small SQL executor, used by the CLI and
//! for exercising the data source without a remote database.
mod memory;
pub mod sql;

pub use memory::{Collection, Document, MemoryBackend, MemoryExecutor, MemoryStore};
