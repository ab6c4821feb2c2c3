//! A single stored file.

use crate::session::SessionId;

/// One keyed object in the store.
///
/// `payload` is absent between `OPENC`/`OPENCL` and the first `WRITE`
/// that commits content; `in_fifo` tracks FIFO-queue membership
/// directly rather than leaving it implicit in queue contents, so
/// `mark_delete` and eviction can both remove cleanly without scanning.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub pathname: Vec<u8>,
    pub payload: Option<Vec<u8>>,
    pub open_count: u32,
    pub lock_holder: Option<SessionId>,
    pub pending_delete: bool,
    pub(super) in_fifo: bool,
}

impl FileEntry {
    pub(super) fn new(pathname: Vec<u8>, lock_holder: Option<SessionId>) -> Self {
        FileEntry {
            pathname,
            payload: None,
            open_count: 1,
            lock_holder,
            pending_delete: false,
            in_fifo: false,
        }
    }

    /// `len(payload)` when present, else 0.
    pub fn size(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    /// Whether `holder` may read/write this entry: the lock is free or
    /// already held by `holder`.
    pub fn lock_available_to(&self, holder: SessionId) -> bool {
        self.lock_holder.is_none() || self.lock_holder == Some(holder)
    }
}
