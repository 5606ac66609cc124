//! Herald store: the local cache, the list/watch informer that fills it, and an
//! in-memory `ResourceStore` for tests and local runs.

#![forbid(unsafe_code)]

pub mod cache;
pub mod informer;
pub mod memory;

pub use cache::{Change, LocalCache};
pub use informer::{EventHandler, Informer, InformerConfig, SyncHandle, WaitError};
pub use memory::MemoryStore;
