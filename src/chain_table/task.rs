//! Resumable structural tasks: a doubling resize and a bulk delete that can release the resize
//! lock mid-flight, let the host run arbitrary code, and pick up where they left off.

use std::sync::atomic::Ordering::{Acquire, Relaxed};
use std::thread;

use sdd::Guard;

use super::resize::resize_owner_token;
use super::ChainTable;

/// A doubling resize split into claimable bucket ranges.
///
/// [`prepare`](Self::prepare) takes the resize lock and opens the new array;
/// [`do_task`](Self::do_task) migrates one bucket range per call and may be driven from several
/// cooperating threads through a shared reference; [`pause`](Self::pause) and
/// [`cont`](Self::cont) release and re-engage the resize lock with the migration state left on
/// the table, which is the hook for hosts that must periodically stop the world;
/// [`done`](Self::done) publishes the new array. An unfinished task finishes itself on drop.
///
/// # Examples
///
/// ```
/// use chaintable::ChainTable;
///
/// let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 4);
/// for key in 0..32 {
///     assert!(table.insert(key, |v| *v == key, key));
/// }
///
/// let mut task = table.grow_task();
/// assert!(task.prepare());
/// task.pause();
/// task.cont();
/// while task.do_task() {}
/// task.done();
///
/// assert_eq!(table.log2_len(), 5);
/// for key in 0..32 {
///     assert_eq!(table.get(key, |v| *v == key), Some(key));
/// }
/// ```
pub struct GrowTask<'t, T: 'static> {
    table: &'t ChainTable<T>,
    token: usize,
    prepared: bool,
    paused: bool,
}

impl<'t, T: 'static> GrowTask<'t, T> {
    pub(super) fn new(table: &'t ChainTable<T>) -> Self {
        Self {
            table,
            token: 0,
            prepared: false,
            paused: false,
        }
    }

    /// Takes the resize lock and opens the doubling.
    ///
    /// Returns `false` without blocking if the lock is taken, a paused resize is in flight, or
    /// the table is at its size limit.
    pub fn prepare(&mut self) -> bool {
        debug_assert!(!self.prepared);
        let token = resize_owner_token();
        if !self.table.resize_lock.try_lock(token) {
            return false;
        }
        let at_limit = {
            let guard = Guard::new();
            self.table.current_array(&guard).log2_len() >= self.table.log2_limit
        };
        if at_limit || !self.table.next.is_null(Acquire) {
            self.table.resize_lock.unlock(token);
            return false;
        }
        self.table.grow_prolog();
        self.token = token;
        self.prepared = true;
        true
    }

    /// Claims and migrates one bucket range; returns `true` while unclaimed ranges may remain.
    pub fn do_task(&self) -> bool {
        debug_assert!(self.prepared && !self.paused);
        self.table.grow_range()
    }

    /// Releases the resize lock, leaving the migration state on the table. Structural operations
    /// attempted by other threads keep failing or waiting until the task finishes.
    pub fn pause(&mut self) {
        debug_assert!(self.prepared && !self.paused);
        self.table.resize_lock.pause(self.token);
        self.paused = true;
    }

    /// Re-engages the resize lock after a [`pause`](Self::pause).
    pub fn cont(&mut self) {
        debug_assert!(self.prepared && self.paused);
        self.table.resize_lock.cont(self.token);
        self.paused = false;
    }

    /// Migrates any leftover ranges, waits for cooperating threads to finish theirs, publishes
    /// the new array, and releases the resize lock.
    pub fn done(&mut self) {
        debug_assert!(self.prepared && !self.paused);
        while self.table.grow_range() {}
        while !self.table.grow_migration_done() {
            thread::yield_now();
        }
        self.table.resize_epilog();
        self.table.resize_lock.unlock(self.token);
        self.prepared = false;
    }
}

impl<T: 'static> Drop for GrowTask<'_, T> {
    fn drop(&mut self) {
        if self.prepared {
            if self.paused {
                self.cont();
            }
            self.done();
        }
    }
}

/// A bulk delete split into claimable bucket ranges; see [`GrowTask`] for the task protocol.
///
/// The filter and deletion callback are shared by every cooperating thread, hence the `Fn`
/// bounds where [`ChainTable::bulk_delete`] accepts `FnMut`.
///
/// # Examples
///
/// ```
/// use chaintable::ChainTable;
///
/// let table: ChainTable<u64> = ChainTable::new();
/// for key in 0..16 {
///     assert!(table.insert(key, |v| *v == key, key));
/// }
///
/// let mut task = table.bulk_delete_task(|v| *v % 2 == 0, |_| ());
/// assert!(task.prepare());
/// while task.do_task() {}
/// task.done();
///
/// assert_eq!(table.len(), 8);
/// ```
pub struct BulkDeleteTask<'t, T: 'static, F: Fn(&T) -> bool, D: Fn(&T)> {
    table: &'t ChainTable<T>,
    filter: F,
    on_delete: D,
    token: usize,
    prepared: bool,
    paused: bool,
}

impl<'t, T: 'static, F: Fn(&T) -> bool, D: Fn(&T)> BulkDeleteTask<'t, T, F, D> {
    pub(super) fn new(table: &'t ChainTable<T>, filter: F, on_delete: D) -> Self {
        Self {
            table,
            filter,
            on_delete,
            token: 0,
            prepared: false,
            paused: false,
        }
    }

    /// Takes the resize lock; returns `false` without blocking if it is unavailable or a paused
    /// resize is in flight.
    pub fn prepare(&mut self) -> bool {
        debug_assert!(!self.prepared);
        let token = resize_owner_token();
        if !self.table.resize_lock.try_lock(token) {
            return false;
        }
        if !self.table.next.is_null(Acquire) {
            self.table.resize_lock.unlock(token);
            return false;
        }
        self.table.claim.store(0, Relaxed);
        self.token = token;
        self.prepared = true;
        true
    }

    /// Claims and sweeps one bucket range; returns `true` while unclaimed ranges may remain.
    pub fn do_task(&self) -> bool {
        debug_assert!(self.prepared && !self.paused);
        let mut filter = |value: &T| (self.filter)(value);
        let mut on_delete = |value: &T| (self.on_delete)(value);
        self.table.sweep_range(&mut filter, &mut on_delete)
    }

    /// Releases the resize lock, leaving the sweep position on the table.
    pub fn pause(&mut self) {
        debug_assert!(self.prepared && !self.paused);
        self.table.resize_lock.pause(self.token);
        self.paused = true;
    }

    /// Re-engages the resize lock after a [`pause`](Self::pause).
    pub fn cont(&mut self) {
        debug_assert!(self.prepared && self.paused);
        self.table.resize_lock.cont(self.token);
        self.paused = false;
    }

    /// Sweeps any leftover ranges and releases the resize lock.
    pub fn done(&mut self) {
        debug_assert!(self.prepared && !self.paused);
        while self.do_task() {}
        self.table.resize_lock.unlock(self.token);
        self.prepared = false;
    }
}

impl<T: 'static, F: Fn(&T) -> bool, D: Fn(&T)> Drop for BulkDeleteTask<'_, T, F, D> {
    fn drop(&mut self) {
        if self.prepared {
            if self.paused {
                self.cont();
            }
            self.done();
        }
    }
}
