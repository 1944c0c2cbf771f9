//! Interruptible resize machinery: the resize lock, bucket-range claiming, chain unzipping for
//! grow, and chain concatenation for shrink.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::{hint, thread};

use sdd::{Guard, Shared, Tag};

use super::bucket::{Bucket, LinkRef, SPIN_LIMIT};
use super::bucket_array::BucketArray;
use super::ChainTable;
use crate::exit_guard::ExitGuard;

/// Buckets migrated or swept per claimed range, bounding how long a cooperating thread works
/// between pause opportunities.
pub(super) const RANGE_LEN: usize = 64;

/// Serializes structural operations: grow, shrink, bulk delete, and blocking scans.
///
/// The lock records its owner as an opaque per-thread token. A paused task keeps its token in
/// place while clearing the engaged flag, so structural operations started by other threads keep
/// failing or waiting until the task is resumed and finished, while the pausing thread itself is
/// free to run arbitrary code.
pub(crate) struct ResizeLock {
    /// `0` when free; otherwise the owner token, which persists across a pause.
    owner: AtomicUsize,
    /// Whether the owner is actively inside the lock rather than paused.
    engaged: AtomicBool,
}

impl ResizeLock {
    pub(crate) const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            engaged: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_lock(&self, token: usize) -> bool {
        if self
            .owner
            .compare_exchange(0, token, Acquire, Relaxed)
            .is_ok()
        {
            self.engaged.store(true, Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn lock(&self, token: usize) {
        let mut spins = 0;
        while !self.try_lock(token) {
            spins += 1;
            if spins < SPIN_LIMIT {
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    pub(crate) fn unlock(&self, token: usize) {
        debug_assert_eq!(self.owner.load(Relaxed), token);
        self.engaged.store(false, Relaxed);
        self.owner.store(0, Release);
    }

    /// Marks the lock paused. Only the owner may call this, and only the owner can take the lock
    /// back through [`cont`](Self::cont).
    pub(crate) fn pause(&self, token: usize) {
        debug_assert_eq!(self.owner.load(Relaxed), token);
        debug_assert!(self.engaged.load(Relaxed));
        self.engaged.store(false, Release);
    }

    /// Re-engages a paused lock.
    pub(crate) fn cont(&self, token: usize) {
        debug_assert_eq!(self.owner.load(Relaxed), token);
        debug_assert!(!self.engaged.load(Relaxed));
        self.engaged.store(true, Relaxed);
    }
}

/// Returns a token identifying the calling thread, never `0`.
pub(crate) fn resize_owner_token() -> usize {
    thread_local! {
        static ANCHOR: u8 = const { 0 };
    }
    ANCHOR.with(|anchor| anchor as *const u8 as usize)
}

/// Claims the next `RANGE_LEN`-sized bucket range below `total`.
pub(super) fn claim_range(claim: &AtomicUsize, total: usize) -> Option<(usize, usize)> {
    loop {
        let start = claim.load(Relaxed);
        if start >= total {
            return None;
        }
        let end = (start + RANGE_LEN).min(total);
        if claim
            .compare_exchange(start, end, AcqRel, Relaxed)
            .is_ok()
        {
            return Some((start, end));
        }
    }
}

impl<T: 'static> ChainTable<T> {
    /// Doubles the number of buckets until `log2_len() >= target_log2`, clamped to the
    /// configured limit.
    ///
    /// Never blocks on another structural operation: returns `false` immediately if the resize
    /// lock is taken, if a paused resize is in flight, or if the table is already at or above
    /// the target. Single-entry operations proceed concurrently throughout.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 3);
    /// for key in 0..64 {
    ///     assert!(table.insert(key, |v| *v == key, key));
    /// }
    ///
    /// assert!(table.grow(6));
    /// assert_eq!(table.log2_len(), 6);
    /// assert!(!table.grow(6));
    ///
    /// for key in 0..64 {
    ///     assert_eq!(table.get(key, |v| *v == key), Some(key));
    /// }
    /// ```
    pub fn grow(&self, target_log2: u32) -> bool {
        let target = target_log2.min(self.log2_limit);
        let token = resize_owner_token();
        if !self.resize_lock.try_lock(token) {
            return false;
        }
        let _lock = ExitGuard::new(token, |token| {
            self.resize_lock.unlock(*token);
        });
        if !self.next.is_null(Acquire) {
            return false;
        }
        let mut grown = false;
        while self.locked_log2_len() < target {
            self.grow_prolog();
            while self.grow_range() {}
            debug_assert!(self.grow_migration_done());
            self.resize_epilog();
            grown = true;
        }
        grown
    }

    /// Halves the number of buckets until `log2_len() <= target_log2`, clamped to the
    /// configured floor.
    ///
    /// Shares the refusal rules of [`grow`](Self::grow).
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::with_sizes(6, 8, 3);
    /// for key in 0..32 {
    ///     assert!(table.insert(key, |v| *v == key, key));
    /// }
    ///
    /// assert!(table.shrink(3));
    /// assert_eq!(table.log2_len(), 3);
    /// assert!(!table.shrink(3));
    ///
    /// for key in 0..32 {
    ///     assert_eq!(table.get(key, |v| *v == key), Some(key));
    /// }
    /// ```
    pub fn shrink(&self, target_log2: u32) -> bool {
        let target = target_log2.max(self.log2_floor);
        let token = resize_owner_token();
        if !self.resize_lock.try_lock(token) {
            return false;
        }
        let _lock = ExitGuard::new(token, |token| {
            self.resize_lock.unlock(*token);
        });
        if !self.next.is_null(Acquire) {
            return false;
        }
        let mut shrunk = false;
        while self.locked_log2_len() > target {
            self.shrink_prolog();
            while self.shrink_range() {}
            self.resize_epilog();
            shrunk = true;
        }
        shrunk
    }

    fn locked_log2_len(&self) -> u32 {
        let guard = Guard::new();
        self.current_array(&guard).log2_len()
    }

    /// Opens a doubling resize: allocates the new array and resets the progress counters.
    /// The caller must hold the resize lock.
    pub(crate) fn grow_prolog(&self) {
        let guard = Guard::new();
        let log2_len = self.current_array(&guard).log2_len();
        debug_assert!(log2_len < self.log2_limit);
        self.open_resize(log2_len + 1);
    }

    fn shrink_prolog(&self) {
        let guard = Guard::new();
        let log2_len = self.current_array(&guard).log2_len();
        debug_assert!(log2_len > self.log2_floor);
        self.open_resize(log2_len - 1);
    }

    fn open_resize(&self, new_log2_len: u32) {
        let new_array = Shared::new(BucketArray::new(new_log2_len));
        let (previous, _) = self.next.swap((Some(new_array), Tag::None), Release);
        debug_assert!(previous.is_none());
        self.claim.store(0, Relaxed);
        self.migrated.store(0, Relaxed);
    }

    /// Claims and migrates one bucket range of an open doubling resize.
    ///
    /// Returns `true` while unclaimed ranges may remain, so cooperating threads can keep calling
    /// until everything is claimed. The caller must hold or cooperate with the resize lock owner.
    pub(crate) fn grow_range(&self) -> bool {
        let guard = Guard::new();
        let current = self.current_array(&guard);
        let Some(next) = self.next.load(Acquire, &guard).as_ref() else {
            return false;
        };
        let len = current.len();
        let Some((start, end)) = claim_range(&self.claim, len) else {
            return false;
        };
        for index in start..end {
            self.grow_bucket(current, next, index, &guard);
        }
        self.migrated.fetch_add(end - start, AcqRel);
        end < len
    }

    /// Whether every bucket of the open doubling resize has been migrated.
    pub(crate) fn grow_migration_done(&self) -> bool {
        let guard = Guard::new();
        self.migrated.load(Acquire) == self.current_array(&guard).len()
    }

    /// Migrates old bucket `index` into new buckets `index` and `index + old_len`.
    ///
    /// The old chain head is installed into both new buckets, which are created locked, before
    /// the old bucket is redirected; a writer racing into either new bucket therefore spins
    /// until the chains have settled. The old bucket stays locked and redirected until its
    /// array is retired.
    fn grow_bucket<'g>(
        &self,
        current: &'g BucketArray<T>,
        next: &'g BucketArray<T>,
        index: usize,
        guard: &'g Guard,
    ) {
        let old = current.bucket(index);
        let locked = old.lock();
        debug_assert!(locked, "a bucket is redirected mid-resize");

        let even = next.bucket(index);
        let odd = next.bucket(index + current.len());
        let head = old.head_shared(guard);
        even.install_locked_head(head.clone());
        odd.install_locked_head(head);
        old.redirect();

        self.unzip_chain(current.len() as u64, even, odd, guard);
        even.unlock();
        odd.unlock();
    }

    /// Splits the chain shared by `even` and `odd` by the hash bit `old_len`.
    ///
    /// Both cursors start at the shared head and point at the same node before every step; each
    /// step removes the node from exactly the side that does not keep it, one pointer move per
    /// side, so a reader walking either chain at any moment sees every node it could match.
    /// Tombstoned nodes are removed from both sides; in-flight readers still reach them through
    /// the old array until it is retired.
    fn unzip_chain<'g>(
        &self,
        old_len: u64,
        even: &'g Bucket<T>,
        odd: &'g Bucket<T>,
        guard: &'g Guard,
    ) {
        let mut even_link = LinkRef::head(even);
        let mut odd_link = LinkRef::head(odd);
        let mut cursor = even_link.load(guard);
        while let Some(node) = cursor.as_ref() {
            let next = node.next_shared(guard);
            if self.node_is_dead(node.value()) {
                drop(even_link.splice(next.clone()));
                drop(odd_link.splice(next));
                self.entries.fetch_sub(1, Relaxed);
            } else if node.hash() & old_len != 0 {
                // The odd side keeps the node; skip it on the even side.
                drop(even_link.splice(next));
                odd_link = LinkRef::next_of(node);
            } else {
                drop(odd_link.splice(next));
                even_link = LinkRef::next_of(node);
            }
            cursor = even_link.load(guard);
        }
    }

    /// Claims and merges one bucket-pair range of an open halving resize.
    fn shrink_range(&self) -> bool {
        let guard = Guard::new();
        let current = self.current_array(&guard);
        let Some(next) = self.next.load(Acquire, &guard).as_ref() else {
            return false;
        };
        let len = next.len();
        let Some((start, end)) = claim_range(&self.claim, len) else {
            return false;
        };
        for index in start..end {
            self.shrink_bucket(current, next, index, &guard);
        }
        self.migrated.fetch_add(end - start, AcqRel);
        end < len
    }

    /// Merges old buckets `index` and `index + new_len` into new bucket `index`.
    ///
    /// The odd chain is appended to the even chain under both locks, the combined chain is
    /// installed into the new bucket, and only then are the old pair redirected, so a reader
    /// always finds its full chain through whichever bucket it resolved.
    fn shrink_bucket<'g>(
        &self,
        current: &'g BucketArray<T>,
        next: &'g BucketArray<T>,
        index: usize,
        guard: &'g Guard,
    ) {
        let even = current.bucket(index);
        let odd = current.bucket(index + next.len());
        let even_locked = even.lock();
        let odd_locked = odd.lock();
        debug_assert!(even_locked && odd_locked, "a bucket is redirected mid-resize");

        let combined = if let Some(first) = even.head_ptr(guard).as_ref() {
            let mut tail = first;
            while let Some(after) = tail.next_ptr(guard).as_ref() {
                tail = after;
            }
            let previous = LinkRef::next_of(tail).splice(odd.head_shared(guard));
            debug_assert!(previous.is_none());
            drop(previous);
            even.head_shared(guard)
        } else {
            odd.head_shared(guard)
        };

        let merged = next.bucket(index);
        merged.install_locked_head(combined);
        even.redirect();
        odd.redirect();
        merged.unlock();
    }

    /// Closes an open resize: publishes the new array, clears the in-progress slot, and retires
    /// the old array through deferred reclamation. The caller must hold the resize lock and have
    /// migrated every bucket.
    pub(crate) fn resize_epilog(&self) {
        let guard = Guard::new();
        let new_array = self.next.get_shared(Acquire, &guard);
        debug_assert!(new_array.is_some());
        let (old_array, _) = self.current.swap((new_array, Tag::None), Release);
        let (cleared, _) = self.next.swap((None, Tag::None), Release);
        drop(cleared);
        // The old array, its redirected buckets, and any tombstones they still reference are
        // destroyed once every thread in an earlier epoch has left its critical section.
        drop(old_array);
        self.claim.store(0, Relaxed);
        self.migrated.store(0, Relaxed);
        self.resize_advised.store(false, Relaxed);
    }
}
