//! Eviction policy: evict oldest-inserted files first to keep the store
//! within its file-count and byte caps.

use crate::store::table::StoreInner;

/// One evicted file, carried back to the caller for the response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedFile {
    pub pathname: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// The eviction loop could not make room even after emptying the FIFO
/// queue. Treated as an internal error by callers, escalating to
/// session teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CannotEvict;

/// Evict oldest-inserted entries until both caps hold, in FIFO order.
///
/// Callers are responsible for the self-eviction rule: this function
/// must only be invoked against state that does not
/// already include the entry a caller is in the middle of committing —
/// see `dispatch`'s `commit_then_evict` helper, which builds the
/// prospective post-commit state, evicts first, then commits.
pub fn run_eviction(
    store: &mut StoreInner,
    mut on_capacity_miss: impl FnMut(),
    mut on_rejected_file: impl FnMut(&[u8], u64),
) -> Result<Vec<EvictedFile>, CannotEvict> {
    let mut evicted = Vec::new();
    let mut logged_capacity_miss = false;

    while store.files_used() > store.files_cap() || store.bytes_used() > store.bytes_cap() {
        let Some(victim_path) = store.pop_fifo_front() else {
            return Err(CannotEvict);
        };
        if !logged_capacity_miss {
            on_capacity_miss();
            logged_capacity_miss = true;
        }

        let size = store
            .entries_mut()
            .get(&victim_path)
            .expect("FIFO queue out of sync with key map")
            .size();
        on_rejected_file(&victim_path, size);

        *store.files_used_mut() -= 1;
        *store.bytes_used_mut() -= size;

        let entry = store
            .entries_mut()
            .get(&victim_path)
            .expect("checked above");
        let open_count = entry.open_count;
        let bytes = entry.payload.clone().unwrap_or_default();

        if open_count == 0 {
            store.entries_mut().remove(&victim_path);
        } else {
            let entry = store.entries_mut().get_mut(&victim_path).expect("checked above");
            entry.pending_delete = true;
            entry.in_fifo = false;
        }

        evicted.push(EvictedFile {
            pathname: victim_path,
            bytes,
        });
    }

    store.bump_eviction_counter();
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::table::StoreInner;

    fn new_store(files_cap: u32, bytes_cap: u64) -> StoreInner {
        StoreInner::new_for_test(files_cap, bytes_cap)
    }

    #[test]
    fn evicts_oldest_first_until_caps_hold() {
        let mut store = new_store(2, 1000);
        store.create(b"/a", None);
        store.commit_payload(b"/a", b"aaa".to_vec());
        store.create(b"/b", None);
        store.commit_payload(b"/b", b"bbb".to_vec());
        store.create(b"/c", None);
        store.commit_payload(b"/c", b"ccc".to_vec());

        let mut misses = 0;
        let mut rejected = Vec::new();
        let evicted = run_eviction(&mut store, || misses += 1, |p, s| rejected.push((p.to_vec(), s))).unwrap();

        assert_eq!(misses, 1);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].pathname, b"/a");
        assert_eq!(rejected, vec![(b"/a".to_vec(), 3)]);
        assert_eq!(store.files_used(), 2);
    }

    #[test]
    fn evicted_entry_with_open_references_becomes_pending_delete_not_freed() {
        let mut store = new_store(1, 1000);
        store.create(b"/a", None); // open_count 1
        store.commit_payload(b"/a", b"a".to_vec());
        store.create(b"/b", None);
        store.commit_payload(b"/b", b"b".to_vec());

        run_eviction(&mut store, || {}, |_, _| {}).unwrap();

        assert!(store.get(b"/a").is_none());
        assert!(store.get_raw(b"/a").is_some());
    }

    #[test]
    fn cannot_evict_when_queue_exhausted_but_caps_still_violated() {
        let mut store = new_store(0, 1000);
        store.create(b"/a", None);
        // no commit: /a never enters the FIFO queue, so it can never be evicted
        *store.files_used_mut() = 1;
        let result = run_eviction(&mut store, || {}, |_, _| {});
        assert_eq!(result, Err(CannotEvict));
    }
}
