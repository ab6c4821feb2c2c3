//! The file store: keyed table, FIFO eviction queue, and the mutex +
//! condition variable every command runs under (C3/C4).

pub mod entry;
pub mod eviction;
pub mod table;

pub use entry::FileEntry;
pub use eviction::{run_eviction, CannotEvict, EvictedFile};
pub use table::{CloseEffect, CreateOutcome, Store, StoreInner};
