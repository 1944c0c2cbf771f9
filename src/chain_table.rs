//! [`ChainTable`] is a concurrent chained hash table with lock-free reads, per-bucket write
//! locks, and a globally-serialized, interruptible resize protocol.

mod bucket;
mod bucket_array;
mod resize;
mod task;

use std::fmt::{self, Debug};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::{hint, thread};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

use crate::exit_guard::ExitGuard;
use bucket::{scan_chain, Bucket, LinkRef, Node};
use bucket_array::BucketArray;
use resize::{resize_owner_token, ResizeLock};

pub use task::{BulkDeleteTask, GrowTask};

/// Concurrent chained hash table.
///
/// [`ChainTable`] stores values keyed by a caller-supplied 64-bit hash and an equality predicate;
/// it never hashes anything itself, which keys the table to whatever identity scheme the embedding
/// code already has. Values are held in per-bucket singly-linked chains.
///
/// ## Concurrency
///
/// * Readers are lock-free: they enter an epoch-based critical section ([`Guard`]), walk a chain,
///   and leave; they are never blocked by writers or by an in-progress resize.
/// * Writers lock a single bucket: the lock lives in the two tag bits of the bucket head word, so
///   lock transitions and chain publication are single atomic operations.
/// * Structural operations (grow, shrink, bulk delete, blocking scans) serialize on one resize
///   lock and never block single-entry operations, which follow per-bucket redirect marks into
///   the new array while a resize is in flight.
/// * Memory reclamation is epoch-based: an unlinked node or a replaced bucket array is destroyed
///   only after every thread that could have observed it has left its critical section.
///
/// ## Sizing
///
/// The table only resizes when asked to: [`grow`](Self::grow), [`shrink`](Self::shrink), or the
/// resumable [`GrowTask`]. Inserts and lookups that observe a chain longer than the grow hint set
/// an advisory flag readable through [`resize_advised`](Self::resize_advised).
///
/// # Examples
///
/// ```
/// use chaintable::ChainTable;
///
/// let table: ChainTable<u64> = ChainTable::new();
///
/// assert!(table.insert(17, |v| *v == 17, 17));
/// assert!(!table.insert(17, |v| *v == 17, 17));
/// assert_eq!(table.get(17, |v| *v == 17), Some(17));
/// assert!(table.remove(17, |v| *v == 17));
/// assert_eq!(table.get(17, |v| *v == 17), None);
/// ```
pub struct ChainTable<T: 'static> {
    current: AtomicShared<BucketArray<T>>,
    next: AtomicShared<BucketArray<T>>,
    resize_lock: ResizeLock,
    claim: AtomicUsize,
    migrated: AtomicUsize,
    entries: AtomicUsize,
    log2_floor: u32,
    log2_limit: u32,
    grow_hint: u32,
    resize_advised: AtomicBool,
    is_dead: Option<fn(&T) -> bool>,
}

/// A best-effort snapshot of the chain-length distribution.
///
/// Produced by [`ChainTable::statistics`] without taking any locks; buckets that were locked or
/// redirected at sampling time are skipped and counted in `skipped_buckets`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statistics {
    /// Number of buckets in the current array.
    pub num_buckets: usize,
    /// `log2` of `num_buckets`.
    pub log2_len: u32,
    /// Number of live entries observed in sampled buckets.
    pub sampled_entries: usize,
    /// Buckets skipped because they were locked or redirected.
    pub skipped_buckets: usize,
    /// Longest sampled chain.
    pub max_chain_len: usize,
    /// `chain_lengths[n]` is the number of sampled buckets with a chain of length `n`.
    pub chain_lengths: Vec<usize>,
    /// Size of one bucket in bytes.
    pub bucket_size: usize,
    /// Size of one chain node in bytes.
    pub node_size: usize,
}

const DEFAULT_LOG2_LEN: u32 = 9;
const DEFAULT_LOG2_LIMIT: u32 = 22;
const DEFAULT_GROW_HINT: u32 = 4;

/// Upper bound on unlinked nodes per bucket-lock acquisition during bulk deletes, so a long
/// chain cannot starve readers of the bucket or hold the epoch back.
const BULK_DELETE_BATCH: usize = 256;

impl<T: 'static> ChainTable<T> {
    /// Creates an empty [`ChainTable`] with the default sizing.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<String> = ChainTable::new();
    /// assert!(table.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_sizes(DEFAULT_LOG2_LEN, DEFAULT_LOG2_LIMIT, DEFAULT_LOG2_LEN)
    }

    /// Creates an empty [`ChainTable`] with `1 << log2_len` buckets, refusing to grow beyond
    /// `1 << log2_limit` or to shrink below `1 << log2_floor`.
    ///
    /// # Panics
    ///
    /// Panics if `log2_floor <= log2_len <= log2_limit` does not hold, or if the bounds leave the
    /// representable range.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 3);
    /// assert_eq!(table.log2_len(), 4);
    /// ```
    #[must_use]
    pub fn with_sizes(log2_len: u32, log2_limit: u32, log2_floor: u32) -> Self {
        assert!(log2_floor >= 1, "the table needs at least two buckets");
        assert!(log2_floor <= log2_len && log2_len <= log2_limit);
        assert!(log2_limit < usize::BITS);
        Self {
            current: AtomicShared::new(BucketArray::new(log2_len)),
            next: AtomicShared::null(),
            resize_lock: ResizeLock::new(),
            claim: AtomicUsize::new(0),
            migrated: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
            log2_floor,
            log2_limit,
            grow_hint: DEFAULT_GROW_HINT,
            resize_advised: AtomicBool::new(false),
            is_dead: None,
        }
    }

    /// Flags values for which `is_dead` returns `true` as tombstones: unconditionally
    /// non-matching for every lookup, cleaned opportunistically after inserts, and dropped
    /// during resize migration.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::new().with_dead_predicate(|v| *v == u64::MAX);
    /// assert!(table.insert(3, |v| *v == 3, u64::MAX));
    /// assert_eq!(table.get(3, |_| true), None);
    /// ```
    #[must_use]
    pub fn with_dead_predicate(mut self, is_dead: fn(&T) -> bool) -> Self {
        self.is_dead = Some(is_dead);
        self
    }

    /// Sets the chain length beyond which lookups advise growing the table.
    #[must_use]
    pub fn with_grow_hint(mut self, grow_hint: u32) -> Self {
        self.grow_hint = grow_hint.max(1);
        self
    }

    /// Returns the number of entries.
    ///
    /// Values flagged by the dead predicate still count until a clean pass, a resize, or a
    /// bulk-delete sweep unlinks them.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load(Relaxed)
    }

    /// Returns `true` if the table holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `log2` of the current number of buckets.
    #[inline]
    #[must_use]
    pub fn log2_len(&self) -> u32 {
        let guard = Guard::new();
        self.current_array(&guard).log2_len()
    }

    /// Returns the configured `log2` growth limit.
    #[inline]
    #[must_use]
    pub const fn max_log2_len(&self) -> u32 {
        self.log2_limit
    }

    /// Returns the configured `log2` shrink floor.
    #[inline]
    #[must_use]
    pub const fn min_log2_len(&self) -> u32 {
        self.log2_floor
    }

    /// Returns `true` if some lookup observed a chain longer than the grow hint since the last
    /// completed resize. Purely advisory; the table never resizes itself.
    #[inline]
    #[must_use]
    pub fn resize_advised(&self) -> bool {
        self.resize_advised.load(Relaxed)
    }

    /// Reads the value matching `hash` and `eq`, cloning it out.
    ///
    /// Lock-free; linearizable with completed inserts and removes on the same key.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<(u64, &str)> = ChainTable::new();
    /// assert!(table.insert(7, |v| v.0 == 7, (7, "seven")));
    /// assert_eq!(table.get(7, |v| v.0 == 7), Some((7, "seven")));
    /// assert_eq!(table.get(8, |v| v.0 == 8), None);
    /// ```
    #[inline]
    pub fn get(&self, hash: u64, eq: impl FnMut(&T) -> bool) -> Option<T>
    where
        T: Clone,
    {
        let guard = Guard::new();
        self.peek_with(hash, eq, &guard).cloned()
    }

    /// Reads the value matching `hash` and `eq` without copying it.
    ///
    /// The returned reference is valid until `guard` is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::{ChainTable, Guard};
    ///
    /// let table: ChainTable<String> = ChainTable::new();
    /// assert!(table.insert(1, |v| v == "one", "one".to_string()));
    ///
    /// let guard = Guard::new();
    /// let value = table.peek_with(1, |v| v == "one", &guard);
    /// assert_eq!(value.map(String::as_str), Some("one"));
    /// ```
    #[inline]
    pub fn peek_with<'g>(
        &self,
        hash: u64,
        mut eq: impl FnMut(&T) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g T> {
        self.find_node(hash, &mut eq, guard).map(|node| node.value())
    }

    /// Inserts `value` unless a value matching `hash` and `eq` already exists.
    ///
    /// Returns `false` and drops `value` on a duplicate. Of several concurrent inserts with an
    /// equal key, exactly one succeeds.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::new();
    /// assert!(table.insert(11, |v| *v == 11, 11));
    /// assert!(!table.insert(11, |v| *v == 11, 11));
    /// assert_eq!(table.len(), 1);
    /// ```
    #[inline]
    pub fn insert(&self, hash: u64, eq: impl FnMut(&T) -> bool, value: T) -> bool {
        let guard = Guard::new();
        self.insert_get_with(hash, eq, value, &guard).0
    }

    /// Inserts `value`, handing back a reference to the winning value: the freshly inserted one
    /// (`true`) or the already-present duplicate (`false`).
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::{ChainTable, Guard};
    ///
    /// let table: ChainTable<(u64, u64)> = ChainTable::new();
    /// let guard = Guard::new();
    ///
    /// let (inserted, stored) = table.insert_get_with(5, |v| v.0 == 5, (5, 50), &guard);
    /// assert!(inserted);
    /// assert_eq!(stored, &(5, 50));
    ///
    /// let (inserted, stored) = table.insert_get_with(5, |v| v.0 == 5, (5, 99), &guard);
    /// assert!(!inserted);
    /// assert_eq!(stored, &(5, 50));
    /// ```
    pub fn insert_get_with<'g>(
        &self,
        hash: u64,
        mut eq: impl FnMut(&T) -> bool,
        value: T,
        guard: &'g Guard,
    ) -> (bool, &'g T) {
        // The node is allocated up front, outside any lock, and reused across retries.
        let mut node = Shared::new(Node::new(hash, value));
        let mut spins = 0;
        loop {
            let (bucket, head, log2_len) = self.insert_target(hash, &mut spins, guard);
            let scan = scan_chain(head, &mut eq, self.is_dead, guard);
            self.note_chain_len(scan.len, log2_len);
            if let Some(existing) = scan.found {
                // Duplicate: the freshly allocated node is discarded.
                drop(node);
                return (false, existing.value());
            }
            node.link_next(bucket.head_shared(guard));
            match bucket.cas_first(head, node, guard) {
                Ok(head_ptr) => {
                    self.entries.fetch_add(1, Relaxed);
                    self.note_chain_len(scan.len + 1, log2_len);
                    if scan.dead != 0 {
                        self.try_clean_bucket(bucket, guard);
                    }
                    let inserted = head_ptr.as_ref().unwrap_or_else(|| unreachable!());
                    return (true, inserted.value());
                }
                Err(rejected) => {
                    node = rejected;
                    backoff(&mut spins);
                }
            }
        }
    }

    /// Removes the first value matching `hash` and `eq`.
    ///
    /// Returns whether a match was found. The unlinked node is destroyed only after every reader
    /// that could still observe it has left its critical section.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::new();
    /// assert!(table.insert(2, |v| *v == 2, 2));
    /// assert!(table.remove(2, |v| *v == 2));
    /// assert!(!table.remove(2, |v| *v == 2));
    /// ```
    pub fn remove(&self, hash: u64, mut eq: impl FnMut(&T) -> bool) -> bool {
        let guard = Guard::new();
        let bucket = self.lock_bucket(hash, &guard);
        let mut unlinked = None;
        let mut link = LinkRef::head(bucket);
        let mut cursor = link.load(&guard);
        while let Some(node) = cursor.as_ref() {
            if !self.node_is_dead(node.value()) && eq(node.value()) {
                unlinked = link.splice(node.next_shared(&guard));
                break;
            }
            link = LinkRef::next_of(node);
            cursor = link.load(&guard);
        }
        bucket.unlock();
        if let Some(node) = unlinked {
            self.entries.fetch_sub(1, Relaxed);
            // Retiring the node defers its destruction past the current epoch.
            drop(node);
            true
        } else {
            false
        }
    }

    /// Deletes every value for which `filter` holds at the moment its bucket is locked, invoking
    /// `on_delete` once per deleted value before the memory is retired.
    ///
    /// Blocks until the resize lock is available: bulk deletion is a structural operation and is
    /// mutually exclusive with grow and shrink. Values inserted concurrently during the sweep are
    /// not guaranteed to be visited.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::new();
    /// for key in 1..=3 {
    ///     assert!(table.insert(key, |v| *v == key, key));
    /// }
    /// table.bulk_delete(|v| *v % 2 == 1, |_| ());
    /// assert_eq!(table.len(), 1);
    /// assert_eq!(table.get(2, |v| *v == 2), Some(2));
    /// ```
    pub fn bulk_delete(&self, mut filter: impl FnMut(&T) -> bool, mut on_delete: impl FnMut(&T)) {
        let token = resize_owner_token();
        self.lock_structural(token);
        let _lock = ExitGuard::new(token, |token| {
            self.resize_lock.unlock(*token);
        });
        let len = {
            let guard = Guard::new();
            self.current_array(&guard).len()
        };
        for index in 0..len {
            self.sweep_bucket(index, &mut filter, &mut on_delete);
        }
    }

    /// Removes every entry. Equivalent to a bulk delete with an always-true filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::new();
    /// assert!(table.insert(1, |v| *v == 1, 1));
    /// table.clear();
    /// assert!(table.is_empty());
    /// assert!(table.insert(1, |v| *v == 1, 1));
    /// ```
    #[inline]
    pub fn clear(&self) {
        self.bulk_delete(|_| true, |_| ());
    }

    /// Visits every live value if the resize lock is uncontended; returns `false` ("busy")
    /// otherwise without visiting anything. The visitor returns whether to continue.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::new();
    /// assert!(table.insert(4, |v| *v == 4, 4));
    ///
    /// let mut seen = Vec::new();
    /// assert!(table.try_scan(|v| {
    ///     seen.push(*v);
    ///     true
    /// }));
    /// assert_eq!(seen, vec![4]);
    /// ```
    pub fn try_scan(&self, visitor: impl FnMut(&T) -> bool) -> bool {
        let token = resize_owner_token();
        if !self.resize_lock.try_lock(token) {
            return false;
        }
        let _lock = ExitGuard::new(token, |token| {
            self.resize_lock.unlock(*token);
        });
        self.scan_arrays(visitor, true);
        true
    }

    /// Visits every live value, blocking until the resize lock can be acquired.
    ///
    /// The epoch guard is taken per bucket, not for the whole scan, so a long scan does not hold
    /// the epoch back. A paused resize task keeps the resize lock occupied, so by the time the
    /// scan runs, no partially-populated new array remains to be observed.
    pub fn do_scan(&self, visitor: impl FnMut(&T) -> bool) {
        let token = resize_owner_token();
        self.resize_lock.lock(token);
        let _lock = ExitGuard::new(token, |token| {
            self.resize_lock.unlock(*token);
        });
        self.scan_arrays(visitor, true);
    }

    /// Visits every live value without locks or per-bucket epoch guards.
    ///
    /// Usable only under total exclusivity, which the mutable borrow enforces; intended for host
    /// safepoints where all other participants are paused. The exclusive borrow also rules out a
    /// live resize task, so only the current array can hold entries.
    pub fn do_safepoint_scan(&mut self, visitor: impl FnMut(&T) -> bool) {
        self.scan_arrays(visitor, false);
    }

    /// Samples the chain-length distribution without blocking.
    ///
    /// Buckets found locked or redirected are skipped, making this safe to call at any time.
    ///
    /// # Examples
    ///
    /// ```
    /// use chaintable::ChainTable;
    ///
    /// let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 4);
    /// assert!(table.insert(9, |v| *v == 9, 9));
    ///
    /// let stats = table.statistics();
    /// assert_eq!(stats.num_buckets, 16);
    /// assert_eq!(stats.sampled_entries, 1);
    /// ```
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        let guard = Guard::new();
        let current = self.current_array(&guard);
        let mut stats = Statistics {
            num_buckets: current.len(),
            log2_len: current.log2_len(),
            sampled_entries: 0,
            skipped_buckets: 0,
            max_chain_len: 0,
            chain_lengths: vec![0],
            bucket_size: size_of::<Bucket<T>>(),
            node_size: size_of::<Node<T>>(),
        };
        for index in 0..current.len() {
            let bucket = current.bucket(index);
            let head = bucket.head_ptr(&guard);
            if head.tag() != Tag::None {
                stats.skipped_buckets += 1;
                continue;
            }
            let mut len = 0;
            let mut cursor = head;
            while let Some(node) = cursor.as_ref() {
                if !self.node_is_dead(node.value()) {
                    len += 1;
                }
                cursor = node.next_ptr(&guard);
            }
            if len >= stats.chain_lengths.len() {
                stats.chain_lengths.resize(len + 1, 0);
            }
            stats.chain_lengths[len] += 1;
            stats.sampled_entries += len;
            stats.max_chain_len = stats.max_chain_len.max(len);
        }
        stats
    }

    /// Returns a resumable grow task doubling the table once; see [`GrowTask`].
    #[inline]
    pub fn grow_task(&self) -> GrowTask<'_, T> {
        GrowTask::new(self)
    }

    /// Returns a resumable bulk-delete task; see [`BulkDeleteTask`].
    #[inline]
    pub fn bulk_delete_task<F, D>(&self, filter: F, on_delete: D) -> BulkDeleteTask<'_, T, F, D>
    where
        F: Fn(&T) -> bool,
        D: Fn(&T),
    {
        BulkDeleteTask::new(self, filter, on_delete)
    }

    #[inline]
    fn node_is_dead(&self, value: &T) -> bool {
        self.is_dead.is_some_and(|is_dead| is_dead(value))
    }

    /// The current array; never null once the table is constructed.
    #[inline]
    pub(crate) fn current_array<'g>(&self, guard: &'g Guard) -> &'g BucketArray<T> {
        let ptr = self.current.load(Acquire, guard);
        ptr.as_ref().unwrap_or_else(|| unreachable!())
    }

    /// Records a lookup chain length; chains longer than the grow hint advise a resize.
    #[inline]
    fn note_chain_len(&self, len: usize, log2_len: u32) {
        if len > self.grow_hint as usize && log2_len < self.log2_limit {
            self.resize_advised.store(true, Relaxed);
        }
    }

    /// Locates the node matching `hash` and `eq`, transparently following an in-progress resize.
    ///
    /// A redirected bucket routes the walk into the new array. Chain unzipping splits the chain
    /// shared by both new buckets in place, so a miss is conclusive only if the bucket it was
    /// scanned through was neither locked nor redirected: a walk that raced the unzipping may
    /// have been detoured onto the other half of the chain and must rescan once it has settled.
    fn find_node<'g, E: FnMut(&T) -> bool>(
        &self,
        hash: u64,
        eq: &mut E,
        guard: &'g Guard,
    ) -> Option<&'g Node<T>> {
        let mut spins = 0;
        loop {
            let current = self.current_array(guard);
            let bucket = current.bucket(current.bucket_index(hash));
            let head = bucket.head_ptr(guard);
            if matches!(head.tag(), Tag::Second | Tag::Both) {
                match self.find_in_next(hash, eq, current, guard) {
                    Ok(result) => return result,
                    Err(Retry) => {
                        backoff(&mut spins);
                        continue;
                    }
                }
            }
            let scan = scan_chain(head, eq, self.is_dead, guard);
            self.note_chain_len(scan.len, current.log2_len());
            if scan.found.is_some() {
                return scan.found;
            }
            if bucket.is_redirected() {
                // The chain was unzipped under our feet; retry through the new array.
                continue;
            }
            return None;
        }
    }

    fn find_in_next<'g, E: FnMut(&T) -> bool>(
        &self,
        hash: u64,
        eq: &mut E,
        current: &'g BucketArray<T>,
        guard: &'g Guard,
    ) -> Result<Option<&'g Node<T>>, Retry> {
        let Some(next) = self.next.load(Acquire, guard).as_ref() else {
            // The resize was published while we looked; the new array is `current` now.
            return Err(Retry);
        };
        if !ptr::eq(self.current_array(guard), current) {
            // `next` may belong to a newer resize than the array we resolved against.
            return Err(Retry);
        }
        let bucket = next.bucket(next.bucket_index(hash));
        let head = bucket.head_ptr(guard);
        let scan = scan_chain(head, eq, self.is_dead, guard);
        self.note_chain_len(scan.len, next.log2_len());
        if scan.found.is_some() {
            return Ok(scan.found);
        }
        if head.tag() != Tag::None || bucket.is_redirected() {
            // The resize owner holds the lock of a new bucket for the whole unzip, splicing the
            // shared chain in place; a walk that started from the moving head can end on the
            // wrong half. A rescan after the lock is released sees the settled chain.
            return Err(Retry);
        }
        Ok(None)
    }

    /// Resolves and locks the bucket for `hash`, following redirects into the new array.
    fn lock_bucket<'g>(&self, hash: u64, guard: &'g Guard) -> &'g Bucket<T> {
        loop {
            let current = self.current_array(guard);
            let bucket = current.bucket(current.bucket_index(hash));
            if bucket.is_redirected() {
                let Some(next) = self.next.load(Acquire, guard).as_ref() else {
                    continue;
                };
                if !ptr::eq(self.current_array(guard), current) {
                    continue;
                }
                let next_bucket = next.bucket(next.bucket_index(hash));
                if next_bucket.lock() {
                    return next_bucket;
                }
                continue;
            }
            if bucket.lock() {
                return bucket;
            }
        }
    }

    /// Resolves an unlocked bucket and its head for the uncontended insert path.
    fn insert_target<'g>(
        &self,
        hash: u64,
        spins: &mut usize,
        guard: &'g Guard,
    ) -> (&'g Bucket<T>, Ptr<'g, Node<T>>, u32) {
        loop {
            let current = self.current_array(guard);
            let bucket = current.bucket(current.bucket_index(hash));
            let head = bucket.head_ptr(guard);
            match head.tag() {
                Tag::None => return (bucket, head, current.log2_len()),
                Tag::First => backoff(spins),
                Tag::Second | Tag::Both => {
                    let Some(next) = self.next.load(Acquire, guard).as_ref() else {
                        continue;
                    };
                    if !ptr::eq(self.current_array(guard), current) {
                        continue;
                    }
                    let next_bucket = next.bucket(next.bucket_index(hash));
                    let next_head = next_bucket.head_ptr(guard);
                    match next_head.tag() {
                        Tag::None => return (next_bucket, next_head, next.log2_len()),
                        // Mid-unzip buckets stay locked until their chain settles.
                        Tag::First => backoff(spins),
                        Tag::Second | Tag::Both => (),
                    }
                }
            }
        }
    }

    /// Unlinks tombstoned values from a bucket if its lock is free; a best-effort pass piggybacked
    /// on inserts that observed tombstones.
    fn try_clean_bucket(&self, bucket: &Bucket<T>, guard: &Guard) {
        let Some(is_dead) = self.is_dead else { return };
        if !bucket.try_lock() {
            return;
        }
        let mut removed = 0;
        let mut link = LinkRef::head(bucket);
        let mut cursor = link.load(guard);
        while let Some(node) = cursor.as_ref() {
            if is_dead(node.value()) {
                drop(link.splice(node.next_shared(guard)));
                removed += 1;
            } else {
                link = LinkRef::next_of(node);
            }
            cursor = link.load(guard);
        }
        bucket.unlock();
        if removed != 0 {
            self.entries.fetch_sub(removed, Relaxed);
        }
    }

    /// Acquires the resize lock for a structural operation, waiting out any paused resize whose
    /// progress state still occupies the table.
    pub(crate) fn lock_structural(&self, token: usize) {
        loop {
            self.resize_lock.lock(token);
            if self.next.is_null(Acquire) {
                return;
            }
            self.resize_lock.unlock(token);
            thread::yield_now();
        }
    }

    /// Claims and sweeps one bucket range; returns `true` while unclaimed ranges may remain.
    /// The caller must hold or cooperate with the resize lock owner.
    pub(crate) fn sweep_range(
        &self,
        filter: &mut dyn FnMut(&T) -> bool,
        on_delete: &mut dyn FnMut(&T),
    ) -> bool {
        let len = {
            let guard = Guard::new();
            self.current_array(&guard).len()
        };
        let Some((start, end)) = resize::claim_range(&self.claim, len) else {
            return false;
        };
        for index in start..end {
            self.sweep_bucket(index, filter, on_delete);
        }
        end < len
    }

    /// Deletes matching values from one bucket in bounded batches; shared by
    /// [`bulk_delete`](Self::bulk_delete) and [`BulkDeleteTask`]. The caller must hold the
    /// resize lock.
    pub(crate) fn sweep_bucket(
        &self,
        index: usize,
        filter: &mut dyn FnMut(&T) -> bool,
        on_delete: &mut dyn FnMut(&T),
    ) {
        loop {
            let guard = Guard::new();
            let current = self.current_array(&guard);
            debug_assert!(index < current.len());
            let bucket = current.bucket(index);

            // A lock-free candidate pass keeps clean buckets free of lock traffic.
            let mut candidates = false;
            let mut cursor = bucket.head_ptr(&guard);
            while let Some(node) = cursor.as_ref() {
                if self.node_is_dead(node.value()) || filter(node.value()) {
                    candidates = true;
                    break;
                }
                cursor = node.next_ptr(&guard);
            }
            if !candidates || !bucket.lock() {
                return;
            }

            let mut batch: Vec<Shared<Node<T>>> = Vec::new();
            let mut more = false;
            let mut link = LinkRef::head(bucket);
            let mut cursor = link.load(&guard);
            while let Some(node) = cursor.as_ref() {
                if self.node_is_dead(node.value()) || filter(node.value()) {
                    if batch.len() == BULK_DELETE_BATCH {
                        more = true;
                        break;
                    }
                    if let Some(unlinked) = link.splice(node.next_shared(&guard)) {
                        batch.push(unlinked);
                    }
                } else {
                    link = LinkRef::next_of(node);
                }
                cursor = link.load(&guard);
            }
            bucket.unlock();

            if !batch.is_empty() {
                self.entries.fetch_sub(batch.len(), Relaxed);
                for node in batch {
                    if !self.node_is_dead(node.value()) {
                        on_delete(node.value());
                    }
                    // Retired; freed once the epoch turns over.
                    drop(node);
                }
            }
            if !more {
                return;
            }
        }
    }

    /// Visits every live entry with its hash while holding the resize lock; the serialization
    /// and comparison hook.
    pub(crate) fn scan_pairs(&self, mut visitor: impl FnMut(u64, &T) -> bool) {
        let token = resize_owner_token();
        self.resize_lock.lock(token);
        let _lock = ExitGuard::new(token, |token| {
            self.resize_lock.unlock(*token);
        });
        self.scan_nodes(|node| visitor(node.hash(), node.value()), true);
    }

    /// Visits the current array and, if a resize is open, the new one. Redirected buckets are
    /// skipped: their chains were migrated and are reached through the new array.
    fn scan_arrays(&self, mut visitor: impl FnMut(&T) -> bool, guard_per_bucket: bool) {
        self.scan_nodes(|node| visitor(node.value()), guard_per_bucket);
    }

    fn scan_nodes(&self, mut visitor: impl FnMut(&Node<T>) -> bool, guard_per_bucket: bool) {
        // The caller excludes structural operations, so neither array can be retired; owning
        // them as `Shared` lets every bucket take a fresh epoch guard instead of one pinned
        // for the whole scan.
        let (current, next) = {
            let guard = Guard::new();
            (
                self.current.get_shared(Acquire, &guard),
                self.next.get_shared(Acquire, &guard),
            )
        };
        let current = current.unwrap_or_else(|| unreachable!());
        if !self.visit_array(&current, &mut visitor, guard_per_bucket) {
            return;
        }
        if let Some(next) = next {
            self.visit_array(&next, &mut visitor, guard_per_bucket);
        }
    }

    fn visit_array(
        &self,
        array: &BucketArray<T>,
        visitor: &mut dyn FnMut(&Node<T>) -> bool,
        guard_per_bucket: bool,
    ) -> bool {
        let held_guard = if guard_per_bucket {
            None
        } else {
            Some(Guard::new())
        };
        for index in 0..array.len() {
            let bucket_guard;
            let guard = if let Some(held) = held_guard.as_ref() {
                held
            } else {
                bucket_guard = Guard::new();
                &bucket_guard
            };
            let bucket = array.bucket(index);
            let head = bucket.head_ptr(guard);
            if matches!(head.tag(), Tag::Second | Tag::Both) {
                continue;
            }
            let mut cursor = head;
            while let Some(node) = cursor.as_ref() {
                if !self.node_is_dead(node.value()) && !visitor(node) {
                    return false;
                }
                cursor = node.next_ptr(guard);
            }
        }
        true
    }
}

impl<T: 'static> Drop for ChainTable<T> {
    fn drop(&mut self) {
        // Chains are torn down iteratively so a long chain cannot overflow the stack through
        // cascading reference-count drops.
        let arrays = [
            self.current.swap((None, Tag::None), Relaxed).0,
            self.next.swap((None, Tag::None), Relaxed).0,
        ];
        for array in arrays.into_iter().flatten() {
            for index in 0..array.len() {
                let mut cursor = array.bucket(index).take_head();
                while let Some(node) = cursor {
                    cursor = node.take_next();
                    drop(node);
                }
            }
            drop(array);
        }
    }
}

impl<T: 'static> Default for ChainTable<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq + 'static> PartialEq for ChainTable<T> {
    /// Compares two tables entry by entry; every hash and value pair in one must have a match
    /// in the other. Takes the resize lock of `self`.
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut equal = true;
        self.scan_pairs(|hash, value| {
            let guard = Guard::new();
            if other.peek_with(hash, |v| v == value, &guard).is_none() {
                equal = false;
            }
            equal
        });
        equal
    }
}

impl<T: 'static> Debug for ChainTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainTable")
            .field("len", &self.len())
            .field("log2_len", &self.log2_len())
            .finish_non_exhaustive()
    }
}

/// Signals that the table arrays moved mid-lookup and the walk must restart.
struct Retry;

/// Spin briefly, then start yielding the processor; used when an insert loses a race or finds
/// its bucket locked.
#[inline]
fn backoff(spins: &mut usize) {
    *spins += 1;
    if *spins < bucket::SPIN_LIMIT {
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}
