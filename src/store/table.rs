//! The keyed file table and FIFO eviction queue, plus the single mutex
//! + condition variable every command runs under.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::session::SessionId;
use crate::store::entry::FileEntry;

/// Outcome of [`StoreInner::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    Pending,
}

/// Outcome of [`StoreInner::close_entry`], used by the caller to decide
/// whether to broadcast `lock_released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseEffect {
    pub released_lock: bool,
    pub unlinked: bool,
}

/// The file table itself, guarded by [`Store`]'s mutex. All methods
/// assume the mutex is already held; there is no internal locking here.
#[derive(Debug)]
pub struct StoreInner {
    entries: HashMap<Vec<u8>, FileEntry>,
    fifo: VecDeque<Vec<u8>>,
    files_used: u32,
    bytes_used: u64,
    files_cap: u32,
    bytes_cap: u64,
    eviction_counter: u64,
}

impl StoreInner {
    pub(crate) fn new_for_test(files_cap: u32, bytes_cap: u64) -> Self {
        Self::new(files_cap, bytes_cap)
    }

    fn new(files_cap: u32, bytes_cap: u64) -> Self {
        StoreInner {
            entries: HashMap::new(),
            fifo: VecDeque::new(),
            files_used: 0,
            bytes_used: 0,
            files_cap,
            bytes_cap,
            eviction_counter: 0,
        }
    }

    pub fn files_used(&self) -> u32 {
        self.files_used
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub fn files_cap(&self) -> u32 {
        self.files_cap
    }

    pub fn bytes_cap(&self) -> u64 {
        self.bytes_cap
    }

    pub fn eviction_counter(&self) -> u64 {
        self.eviction_counter
    }

    /// Look up a visible (not pending-delete) entry.
    pub fn get(&self, pathname: &[u8]) -> Option<&FileEntry> {
        self.entries.get(pathname).filter(|e| !e.pending_delete)
    }

    pub fn get_mut(&mut self, pathname: &[u8]) -> Option<&mut FileEntry> {
        self.entries.get_mut(pathname).filter(|e| !e.pending_delete)
    }

    /// Look up an entry regardless of `pending_delete`. Only `CLOSE`
    /// (and internal bookkeeping) may see pending-delete entries.
    pub fn get_raw(&self, pathname: &[u8]) -> Option<&FileEntry> {
        self.entries.get(pathname)
    }

    /// Every visible entry, in the key map's own (unspecified) order —
    /// used by `READN`, which does not need to match FIFO order.
    pub fn iter_visible(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values().filter(|e| !e.pending_delete)
    }

    /// Create a fresh entry for `pathname`. Distinguishes a genuinely
    /// free pathname from one still occupied by an
    /// unlinked-but-not-yet-freed pending-delete entry.
    pub fn create(&mut self, pathname: &[u8], lock_holder: Option<SessionId>) -> CreateOutcome {
        if let Some(existing) = self.entries.get(pathname) {
            return if existing.pending_delete {
                CreateOutcome::Pending
            } else {
                CreateOutcome::AlreadyExists
            };
        }
        self.entries
            .insert(pathname.to_vec(), FileEntry::new(pathname.to_vec(), lock_holder));
        CreateOutcome::Created
    }

    /// Attach `bytes` to an entry that previously had no payload and
    /// link it into the FIFO tail. Caller has already verified the
    /// entry exists, is visible, and has no payload.
    pub fn commit_payload(&mut self, pathname: &[u8], bytes: Vec<u8>) {
        let size = bytes.len() as u64;
        let entry = self.entries.get_mut(pathname).expect("commit target must exist");
        debug_assert!(entry.payload.is_none());
        entry.payload = Some(bytes);
        entry.in_fifo = true;
        self.fifo.push_back(pathname.to_vec());
        self.files_used += 1;
        self.bytes_used += size;
    }

    /// Grow an existing payload in place. FIFO position is untouched:
    /// growing an entry does not refresh its eviction order.
    pub fn append_payload(&mut self, pathname: &[u8], bytes: &[u8]) {
        let entry = self.entries.get_mut(pathname).expect("append target must exist");
        let payload = entry.payload.as_mut().expect("append target must have a payload");
        payload.extend_from_slice(bytes);
        self.bytes_used += bytes.len() as u64;
    }

    /// Mark `pathname` for deletion: detach from the FIFO queue and the
    /// live-byte/file accounting, but leave the entry in the key map
    /// until its last close. Returns whether the entry existed.
    pub fn mark_delete(&mut self, pathname: &[u8]) -> bool {
        let Some(entry) = self.entries.get_mut(pathname) else {
            return false;
        };
        if entry.pending_delete {
            return true;
        }
        entry.pending_delete = true;
        if entry.in_fifo {
            entry.in_fifo = false;
            self.files_used -= 1;
            self.bytes_used -= entry.size();
            if let Some(pos) = self.fifo.iter().position(|p| p == pathname) {
                self.fifo.remove(pos);
            }
        }
        true
    }

    /// Free an entry from the key map if it is both pending-delete (or
    /// never committed a payload) and has no remaining open references.
    pub fn unlink_if_orphan(&mut self, pathname: &[u8]) -> bool {
        let should_free = match self.entries.get(pathname) {
            Some(e) => e.open_count == 0 && (e.pending_delete || e.payload.is_none()),
            None => false,
        };
        if should_free {
            self.entries.remove(pathname);
        }
        should_free
    }

    pub fn increment_open_count(&mut self, pathname: &[u8]) {
        if let Some(e) = self.entries.get_mut(pathname) {
            e.open_count += 1;
        }
    }

    /// Close one entry on behalf of `holder`: release the lock if held,
    /// decrement `open_count`, and unlink if the entry is now orphaned.
    /// Assumes the mutex is already held and performs no waiting, so it
    /// is safe to call directly from session teardown without
    /// re-entering the mutex.
    pub fn close_entry(&mut self, pathname: &[u8], holder: SessionId) -> CloseEffect {
        let mut released_lock = false;
        if let Some(e) = self.entries.get_mut(pathname) {
            if e.lock_holder == Some(holder) {
                e.lock_holder = None;
                released_lock = true;
            }
            e.open_count = e.open_count.saturating_sub(1);
        }
        let unlinked = self.unlink_if_orphan(pathname);
        CloseEffect {
            released_lock,
            unlinked,
        }
    }

    /// Pop the oldest FIFO entry's pathname, if any, for eviction.
    pub(super) fn pop_fifo_front(&mut self) -> Option<Vec<u8>> {
        self.fifo.pop_front()
    }

    /// Temporarily detach `pathname` from the FIFO queue, returning the
    /// index it occupied. Used by `dispatch` to protect the entry a
    /// `WRITE`/`APPEND` just touched from being chosen as its own
    /// eviction victim, without disturbing any other entry's relative
    /// order.
    pub fn fifo_remove(&mut self, pathname: &[u8]) -> Option<usize> {
        let pos = self.fifo.iter().position(|p| p.as_slice() == pathname)?;
        self.fifo.remove(pos);
        Some(pos)
    }

    /// Reinsert a pathname removed by [`Self::fifo_remove`] at its
    /// original index.
    pub fn fifo_reinsert(&mut self, index: usize, pathname: Vec<u8>) {
        let index = index.min(self.fifo.len());
        self.fifo.insert(index, pathname);
    }

    pub(super) fn entries_mut(&mut self) -> &mut HashMap<Vec<u8>, FileEntry> {
        &mut self.entries
    }

    pub(super) fn files_used_mut(&mut self) -> &mut u32 {
        &mut self.files_used
    }

    pub(super) fn bytes_used_mut(&mut self) -> &mut u64 {
        &mut self.bytes_used
    }

    pub(super) fn bump_eviction_counter(&mut self) {
        self.eviction_counter += 1;
    }
}

/// The store's single mutex plus the `lock_released` condition variable
/// waited on by `LOCK`/`OPENL`. A plain `Mutex`, not a reentrant one:
/// every call site that already holds it passes the guard down rather
/// than re-locking.
pub struct Store {
    inner: Mutex<StoreInner>,
    lock_released: Condvar,
}

impl Store {
    pub fn new(files_cap: u32, bytes_cap: u64) -> Self {
        Store {
            inner: Mutex::new(StoreInner::new(files_cap, bytes_cap)),
            lock_released: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock()
    }

    /// Wake every `LOCK`/`OPENL` waiter. Called after `UNLOCK`, a
    /// lock-releasing `CLOSE`, `mark_delete`, eviction, and shutdown.
    pub fn notify_lock_released(&self) {
        self.lock_released.notify_all();
    }

    /// Block the caller (which must already hold `guard`) until
    /// `lock_released` is signaled or `timeout` elapses, returning
    /// whether the wait timed out.
    pub fn wait_for_lock_released<'a>(
        &self,
        guard: &mut MutexGuard<'a, StoreInner>,
        timeout: Duration,
    ) -> bool {
        self.lock_released.wait_for(guard, timeout).timed_out()
    }
}
