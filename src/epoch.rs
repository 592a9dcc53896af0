// =============================================================================
// Epoch-based memory reclamation
// =============================================================================
//
// Three epochs rotate 0 -> 1 -> 2 -> 0. The global counter only grows; its
// value modulo three is the current epoch. A thread announces the epoch it
// runs in while it is inside a guard and parks retired items in that epoch's
// free list. The global epoch may move from `e` to `NEXT[e]` only when no
// thread is still announced in `PREVIOUS[e]`. A free list is drained when its
// owner enters the same epoch again, which takes a full rotation, so every
// thread that could have seen the retired items has left in between.
//
// A thread that exits hands its free lists to the reclaimer as an orphan batch
// stamped with the counter value after which a full rotation has passed, and
// unregisters. Threads entering while orphans are pending push the epoch
// forward and drop the batches that became safe.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

const NUMBER_EPOCHS: usize = 3;
const NOT_IN_EPOCH: u32 = 3;
const NEXT_EPOCH: [u32; NUMBER_EPOCHS] = [1, 2, 0];
const PREVIOUS_EPOCH: [u32; NUMBER_EPOCHS] = [2, 0, 1];

static NEXT_RECLAIMER_ID: AtomicU64 = AtomicU64::new(0);

#[inline]
fn epoch_of(counter: u64) -> u32 {
    (counter % NUMBER_EPOCHS as u64) as u32
}

/// Type-erased hook run for each record when its thread exits.
trait ThreadExit: Send + Sync {
    fn thread_exit(&self);
}

/// This thread's records, one per reclaimer it has entered.
struct LocalRecords {
    /// Reclaimer id and record of the most recent `pin`.
    last: Cell<Option<(u64, *const ())>>,
    /// Keeps every record alive; the pointer is the typed `ThreadRecord<T>`.
    by_reclaimer: RefCell<HashMap<u64, (Arc<dyn ThreadExit>, *const ())>>,
}

impl Drop for LocalRecords {
    fn drop(&mut self) {
        self.last.set(None);
        for (record, _) in self.by_reclaimer.get_mut().values() {
            record.thread_exit();
        }
    }
}

thread_local! {
    static THREAD_RECORDS: LocalRecords = LocalRecords {
        last: Cell::new(None),
        by_reclaimer: RefCell::new(HashMap::new()),
    };
}

struct LocalState<T> {
    free_lists: [Vec<T>; NUMBER_EPOCHS],
    previously_accessed: u32,
    wants_to_advance: bool,
    /// Guards currently held by the owning thread.
    nesting: usize,
}

struct ThreadRecord<T: Send + 'static> {
    local_epoch: CachePadded<AtomicU32>,
    /// Locked by the owning thread, and by others only on teardown.
    state: Mutex<LocalState<T>>,
    shared: Weak<Shared<T>>,
}

impl<T: Send + 'static> ThreadRecord<T> {
    fn new(shared: Weak<Shared<T>>) -> Self {
        Self {
            local_epoch: CachePadded::new(AtomicU32::new(NOT_IN_EPOCH)),
            state: Mutex::new(LocalState {
                free_lists: [Vec::new(), Vec::new(), Vec::new()],
                previously_accessed: NOT_IN_EPOCH,
                wants_to_advance: false,
                nesting: 0,
            }),
            shared,
        }
    }
}

impl<T: Send + 'static> ThreadExit for ThreadRecord<T> {
    fn thread_exit(&self) {
        let lists = std::mem::take(&mut self.state.lock().free_lists);
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let items: Vec<T> = lists.into_iter().flatten().collect();
        if !items.is_empty() {
            // Everything here was retired at or before the current counter value.
            let safe_at = shared.global_epoch.load(Ordering::SeqCst) + NUMBER_EPOCHS as u64;
            let mut orphans = shared.orphans.lock();
            shared.orphaned.fetch_add(items.len(), Ordering::Release);
            debug!(orphaned = items.len(), safe_at, "thread left retired items behind");
            orphans.push(OrphanBatch { safe_at, items });
        }
        shared.records.lock().retain(|r| !std::ptr::eq(Arc::as_ptr(r), self));
    }
}

struct OrphanBatch<T> {
    safe_at: u64,
    items: Vec<T>,
}

/// State reachable from thread records after the reclaimer itself is gone.
struct Shared<T: Send + 'static> {
    global_epoch: CachePadded<AtomicU64>,
    records: Mutex<Vec<Arc<ThreadRecord<T>>>>,
    orphans: Mutex<Vec<OrphanBatch<T>>>,
    orphaned: AtomicUsize,
}

/// Defers dropping retired items of type `T` until no reader can hold them.
pub(crate) struct EpochReclaimer<T: Send + 'static> {
    id: u64,
    shared: Arc<Shared<T>>,
    advance_threshold: usize,
}

impl<T: Send + 'static> EpochReclaimer<T> {
    pub(crate) fn new(advance_threshold: usize) -> Self {
        Self {
            id: NEXT_RECLAIMER_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(Shared {
                global_epoch: CachePadded::new(AtomicU64::new(0)),
                records: Mutex::new(Vec::new()),
                orphans: Mutex::new(Vec::new()),
                orphaned: AtomicUsize::new(0),
            }),
            advance_threshold: advance_threshold.max(1),
        }
    }

    fn thread_record(&self) -> *const ThreadRecord<T> {
        THREAD_RECORDS.with(|local| {
            if let Some((id, record)) = local.last.get() {
                if id == self.id {
                    return record.cast::<ThreadRecord<T>>();
                }
            }

            let mut by_reclaimer = local.by_reclaimer.borrow_mut();
            let record = match by_reclaimer.get(&self.id) {
                Some(&(_, record)) => record,
                None => {
                    // Records of dropped reclaimers are only referenced from here.
                    by_reclaimer.retain(|_, (r, _)| Arc::strong_count(r) > 1);

                    let record = Arc::new(ThreadRecord::new(Arc::downgrade(&self.shared)));
                    self.shared.records.lock().push(Arc::clone(&record));
                    let typed = Arc::as_ptr(&record).cast::<()>();
                    let erased: Arc<dyn ThreadExit> = record;
                    by_reclaimer.insert(self.id, (erased, typed));
                    typed
                }
            };
            // Ids are never reused, so a match always names a live record of this `T`.
            local.last.set(Some((self.id, record)));
            record.cast::<ThreadRecord<T>>()
        })
    }

    /// Enters a critical section; nodes read under the guard stay allocated
    /// until it is dropped.
    pub(crate) fn pin(&self) -> EpochGuard<'_, T> {
        // SAFETY: this thread's `LocalRecords` holds the record until the thread
        // exits, and the guard is dropped on this thread before that.
        let record = unsafe { &*self.thread_record() };
        self.enter(record);
        EpochGuard {
            reclaimer: self,
            record,
            _not_send: PhantomData,
        }
    }

    fn enter(&self, record: &ThreadRecord<T>) {
        let mut state = record.state.lock();
        state.nesting += 1;
        if state.nesting > 1 {
            return;
        }

        // Re-read after announcing so a concurrent advance cannot skip past us.
        let global = &self.shared.global_epoch;
        let counter = loop {
            let counter = global.load(Ordering::SeqCst);
            record.local_epoch.store(epoch_of(counter), Ordering::SeqCst);
            if global.load(Ordering::SeqCst) == counter {
                break counter;
            }
        };
        let epoch = epoch_of(counter);

        let drained = if state.previously_accessed != epoch {
            state.previously_accessed = epoch;
            state.wants_to_advance = false;
            std::mem::take(&mut state.free_lists[epoch as usize])
        } else {
            Vec::new()
        };

        let orphans_pending = self.shared.orphaned.load(Ordering::Acquire) > 0;
        if (state.wants_to_advance || orphans_pending) && self.can_advance(epoch) {
            if global
                .compare_exchange(counter, counter + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                debug!(
                    reclaimer = self.id,
                    from = epoch,
                    to = NEXT_EPOCH[epoch as usize],
                    "advanced global epoch"
                );
            }
            state.wants_to_advance = false;
        }
        drop(state);

        if !drained.is_empty() {
            debug!(reclaimer = self.id, epoch, freed = drained.len(), "reclaiming retired items");
        }
        if orphans_pending {
            self.drain_orphans();
        }
    }

    fn can_advance(&self, current: u32) -> bool {
        let blocking = PREVIOUS_EPOCH[current as usize];
        self.shared
            .records
            .lock()
            .iter()
            .all(|r| r.local_epoch.load(Ordering::SeqCst) != blocking)
    }

    /// Drops the orphan batches a full rotation has passed over.
    fn drain_orphans(&self) {
        let counter = self.shared.global_epoch.load(Ordering::SeqCst);
        let ready: Vec<OrphanBatch<T>> = {
            let mut orphans = self.shared.orphans.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut *orphans)
                .into_iter()
                .partition(|batch| batch.safe_at <= counter);
            *orphans = waiting;
            let freed = ready.iter().map(|batch| batch.items.len()).sum::<usize>();
            self.shared.orphaned.fetch_sub(freed, Ordering::Release);
            ready
        };
        if !ready.is_empty() {
            debug!(reclaimer = self.id, batches = ready.len(), "reclaiming orphaned items");
        }
    }

    fn leave(&self, record: &ThreadRecord<T>) {
        let mut state = record.state.lock();
        state.nesting -= 1;
        if state.nesting == 0 {
            record.local_epoch.store(NOT_IN_EPOCH, Ordering::Release);
        }
    }

    /// Items retired but not yet dropped, over all threads.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        // `enter` takes a state lock before the registry lock; never the reverse.
        let records: Vec<_> = self.shared.records.lock().iter().cloned().collect();
        let held: usize = records
            .iter()
            .map(|r| r.state.lock().free_lists.iter().map(Vec::len).sum::<usize>())
            .sum();
        held + self.shared.orphaned.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn registered_threads(&self) -> usize {
        self.shared.records.lock().len()
    }
}

impl<T: Send + 'static> Drop for EpochReclaimer<T> {
    fn drop(&mut self) {
        let records: Vec<_> = self.shared.records.lock().iter().cloned().collect();
        let mut freed = 0usize;
        for record in records {
            let mut state = record.state.lock();
            for list in state.free_lists.iter_mut() {
                freed += list.len();
                list.clear();
            }
        }
        let orphans = std::mem::take(&mut *self.shared.orphans.lock());
        freed += orphans.iter().map(|batch| batch.items.len()).sum::<usize>();
        drop(orphans);
        if freed > 0 {
            debug!(reclaimer = self.id, freed, "dropped reclaimer");
        }
    }
}

/// Keeps the owning thread announced in its epoch.
///
/// Guards live on the stack of the pinning thread; they are never stored in
/// thread-locals or anywhere else that outlives the thread's own records.
pub(crate) struct EpochGuard<'a, T: Send + 'static> {
    reclaimer: &'a EpochReclaimer<T>,
    record: &'a ThreadRecord<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<T: Send + 'static> EpochGuard<'_, T> {
    /// Hands `item` over for dropping once no thread can still observe it.
    pub(crate) fn retire(&self, item: T) {
        let mut state = self.record.state.lock();
        let epoch = self.record.local_epoch.load(Ordering::Relaxed) as usize;
        debug_assert!(epoch < NUMBER_EPOCHS);
        let list = &mut state.free_lists[epoch];
        list.push(item);
        if list.len() % self.reclaimer.advance_threshold == 0 {
            state.wants_to_advance = true;
        }
    }
}

impl<T: Send + 'static> Drop for EpochGuard<'_, T> {
    fn drop(&mut self) {
        self.reclaimer.leave(self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    /// Sets its flag when dropped.
    struct Canary(Option<Arc<AtomicBool>>);

    impl Drop for Canary {
        fn drop(&mut self) {
            if let Some(flag) = &self.0 {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn churn(reclaimer: &EpochReclaimer<Canary>, rounds: usize) {
        for _ in 0..rounds {
            let guard = reclaimer.pin();
            guard.retire(Canary(None));
        }
    }

    #[test]
    fn test_retired_item_is_eventually_dropped() {
        let reclaimer = EpochReclaimer::new(1);
        let flag = Arc::new(AtomicBool::new(false));
        {
            let guard = reclaimer.pin();
            guard.retire(Canary(Some(flag.clone())));
            assert!(!flag.load(Ordering::SeqCst));
        }
        churn(&reclaimer, 16);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_pinned_reader_blocks_reclamation() {
        let reclaimer = EpochReclaimer::new(1);
        let flag = Arc::new(AtomicBool::new(false));
        let (pinned_tx, pinned_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        std::thread::scope(|s| {
            let r = &reclaimer;
            s.spawn(move || {
                let _guard = r.pin();
                pinned_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
            pinned_rx.recv().unwrap();

            {
                let guard = reclaimer.pin();
                guard.retire(Canary(Some(flag.clone())));
            }
            churn(&reclaimer, 1_000);
            assert!(!flag.load(Ordering::SeqCst), "freed while a reader was pinned");

            release_tx.send(()).unwrap();
        });

        churn(&reclaimer, 16);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nested_guards() {
        let reclaimer = EpochReclaimer::new(1);
        let outer = reclaimer.pin();
        {
            let inner = reclaimer.pin();
            inner.retire(Canary(None));
        }
        outer.retire(Canary(None));
        assert_eq!(reclaimer.pending(), 2);
        drop(outer);
    }

    #[test]
    fn test_drop_frees_everything() {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let reclaimer = EpochReclaimer::new(64);
            let guard = reclaimer.pin();
            guard.retire(Canary(Some(flag.clone())));
            drop(guard);
            assert_eq!(reclaimer.pending(), 1);
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exited_thread_hands_over_its_items() {
        let reclaimer = EpochReclaimer::new(64);
        let flag = Arc::new(AtomicBool::new(false));
        std::thread::scope(|s| {
            let (r, flag) = (&reclaimer, flag.clone());
            s.spawn(move || {
                let guard = r.pin();
                guard.retire(Canary(Some(flag)));
            })
            .join()
            .unwrap();
        });
        assert_eq!(reclaimer.registered_threads(), 0);
        assert_eq!(reclaimer.pending(), 1);
        assert!(!flag.load(Ordering::SeqCst));

        {
            // Pinning alone drives the epoch forward while orphans wait.
            let _guard = reclaimer.pin();
        }
        let _ = reclaimer.pin();
        let _ = reclaimer.pin();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(reclaimer.pending(), 0);
    }

    #[test]
    fn test_short_lived_threads_stay_bounded() {
        let reclaimer = EpochReclaimer::new(8);
        for _ in 0..200 {
            std::thread::scope(|s| {
                s.spawn(|| churn(&reclaimer, 50)).join().unwrap();
            });
            assert_eq!(reclaimer.registered_threads(), 0);
        }
        assert!(reclaimer.pending() <= 50, "pending = {}", reclaimer.pending());
    }

    #[test]
    fn test_pin_switches_between_reclaimers() {
        let a = EpochReclaimer::new(1);
        let b = EpochReclaimer::new(1);
        for _ in 0..10 {
            churn(&a, 1);
            churn(&b, 1);
        }
        assert_eq!(a.registered_threads(), 1);
        assert_eq!(b.registered_threads(), 1);
        let _outer = a.pin();
        let _inner = b.pin();
    }
}
