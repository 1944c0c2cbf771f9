#[cfg(test)]
mod chain_table_test {
    use crate::{ChainTable, Guard};
    use rand::seq::SliceRandom;
    use std::cell::Cell;
    use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use std::thread;

    static_assertions::assert_impl_all!(ChainTable<String>: Send, Sync);
    static_assertions::assert_not_impl_all!(ChainTable<*const String>: Send, Sync);
    static_assertions::assert_impl_all!(crate::Statistics: Send, Sync);

    struct R(&'static AtomicUsize, u64);
    impl R {
        fn new(cnt: &'static AtomicUsize, key: u64) -> R {
            cnt.fetch_add(1, Relaxed);
            R(cnt, key)
        }
    }
    impl Clone for R {
        fn clone(&self) -> Self {
            self.0.fetch_add(1, Relaxed);
            R(self.0, self.1)
        }
    }
    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    fn wait_reclaimed(cnt: &'static AtomicUsize) {
        while cnt.load(Relaxed) != 0 {
            Guard::new().accelerate();
            thread::yield_now();
        }
    }

    fn mix(key: u64) -> u64 {
        key.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    #[test]
    fn insert_get_remove_distinct_keys() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 10, 3);
        for key in 0..1024 {
            let hash = mix(key);
            assert!(table.insert(hash, |v| *v == key, key));
        }
        assert_eq!(table.len(), 1024);
        for key in 0..1024 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
        for key in 0..1024 {
            assert!(table.remove(mix(key), |v| *v == key));
        }
        assert!(table.is_empty());
        for key in 0..1024 {
            assert_eq!(table.get(mix(key), |v| *v == key), None);
        }
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let table: ChainTable<(u64, u64)> = ChainTable::new();
        assert!(table.insert(11, |v| v.0 == 11, (11, 1)));
        assert!(!table.insert(11, |v| v.0 == 11, (11, 2)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(11, |v| v.0 == 11), Some((11, 1)));

        // Same hash, different key: a collision chain, not a duplicate.
        assert!(table.insert(11, |v| v.0 == 12, (12, 3)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(11, |v| v.0 == 12), Some((12, 3)));
    }

    #[test]
    fn insert_get_with_returns_the_winner() {
        let table: ChainTable<(u64, u64)> = ChainTable::new();
        let guard = Guard::new();
        let (inserted, stored) = table.insert_get_with(5, |v| v.0 == 5, (5, 50), &guard);
        assert!(inserted);
        assert_eq!(stored, &(5, 50));
        let (inserted, stored) = table.insert_get_with(5, |v| v.0 == 5, (5, 99), &guard);
        assert!(!inserted);
        assert_eq!(stored, &(5, 50));
    }

    #[test]
    fn concurrent_duplicate_inserts_single_winner() {
        let table: ChainTable<(u64, usize)> = ChainTable::new();
        let num_threads = 8;
        let barrier = Barrier::new(num_threads);
        let successes = AtomicUsize::new(0);
        thread::scope(|s| {
            for thread_id in 0..num_threads {
                let table = &table;
                let barrier = &barrier;
                let successes = &successes;
                s.spawn(move || {
                    barrier.wait();
                    for key in 0..256_u64 {
                        if table.insert(mix(key), |v| v.0 == key, (key, thread_id)) {
                            successes.fetch_add(1, Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(successes.load(Relaxed), 256);
        assert_eq!(table.len(), 256);
        for key in 0..256 {
            let winner = table.get(mix(key), |v| v.0 == key);
            assert!(winner.is_some());
        }
    }

    #[test]
    fn peeked_value_outlives_removal() {
        let table: ChainTable<u64> = ChainTable::new();
        assert!(table.insert(42, |v| *v == 42, 42));
        let guard = Guard::new();
        let peeked = table.peek_with(42, |v| *v == 42, &guard);
        assert_eq!(peeked, Some(&42));
        assert!(table.remove(42, |v| *v == 42));
        // The node is retired, not destroyed, while this guard pins the epoch.
        assert_eq!(peeked, Some(&42));
    }

    #[test]
    fn grow_keeps_every_entry() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 10, 3);
        for key in 0..512 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        assert!(table.grow(8));
        assert_eq!(table.log2_len(), 8);
        assert_eq!(table.len(), 512);
        for key in 0..512 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
        assert!(!table.grow(8));
    }

    #[test]
    fn shrink_keeps_every_entry() {
        let table: ChainTable<u64> = ChainTable::with_sizes(8, 10, 3);
        for key in 0..512 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        assert!(table.shrink(4));
        assert_eq!(table.log2_len(), 4);
        assert_eq!(table.len(), 512);
        for key in 0..512 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
        assert!(!table.shrink(4));
    }

    #[test]
    fn resize_round_trip_preserves_the_multiset() {
        let table: ChainTable<u64> = ChainTable::with_sizes(5, 10, 4);
        // Duplicated hashes build collision chains on purpose.
        for key in 0..256 {
            assert!(table.insert(mix(key / 2), |v| *v == key, key));
        }
        let snapshot = |table: &ChainTable<u64>| {
            let mut values = Vec::new();
            table.do_scan(|v| {
                values.push(*v);
                true
            });
            values.sort_unstable();
            values
        };
        let before = snapshot(&table);
        assert!(table.grow(9));
        assert!(table.shrink(4));
        assert_eq!(snapshot(&table), before);
        assert_eq!(table.len(), 256);
    }

    #[test]
    fn racing_reader_survives_chain_unzipping() {
        // A lookup whose walk is overtaken by the chain unzipping of a grow must rescan rather
        // than report a miss: both new buckets share the old chain head while the split splices
        // it in place. The interleaving is pinned down by parking the grower inside the dead
        // predicate and the reader inside its equality closure.
        const STALL: u64 = u64::MAX;
        static UNZIP_PARKED: AtomicBool = AtomicBool::new(false);
        static UNZIP_GO: AtomicBool = AtomicBool::new(false);
        static READER_PARKED: AtomicBool = AtomicBool::new(false);
        static READER_GO: AtomicBool = AtomicBool::new(false);
        thread_local! {
            static UNZIPPING: Cell<bool> = const { Cell::new(false) };
        }
        fn parking_tombstone(value: &u64) -> bool {
            if *value != STALL {
                return false;
            }
            if UNZIPPING.with(Cell::get) && !UNZIP_GO.load(Acquire) {
                UNZIP_PARKED.store(true, Release);
                while !UNZIP_GO.load(Acquire) {
                    thread::yield_now();
                }
            }
            true
        }

        let table: ChainTable<u64> =
            ChainTable::with_sizes(1, 3, 1).with_dead_predicate(parking_tombstone);
        // One collision chain in bucket 0: a tombstone at the head, then a value for each side
        // of the split.
        assert!(table.insert(2, |v| *v == 1000, 1000));
        assert!(table.insert(0, |v| *v == 7, 7));
        assert!(table.insert(4, |_| false, STALL));

        thread::scope(|s| {
            let table = &table;
            let grower = s.spawn(move || {
                UNZIPPING.with(|flag| flag.set(true));
                assert!(table.grow(2));
            });
            while !UNZIP_PARKED.load(Acquire) {
                thread::yield_now();
            }
            // Both new buckets are installed and the old bucket is redirected; the split has
            // not moved a single pointer yet.
            let reader = s.spawn(move || {
                table.get(2, |value| {
                    if *value == 7 && !READER_GO.load(Acquire) {
                        READER_PARKED.store(true, Release);
                        while !READER_GO.load(Acquire) {
                            thread::yield_now();
                        }
                        return false;
                    }
                    *value == 1000
                })
            });
            while !READER_PARKED.load(Acquire) {
                thread::yield_now();
            }
            // Let the split finish while the reader is parked on a node that settles on the
            // other side of it, then wake the reader into the stale remainder of its walk.
            UNZIP_GO.store(true, Release);
            grower.join().unwrap();
            READER_GO.store(true, Release);
            assert_eq!(reader.join().unwrap(), Some(1000));
        });
        assert_eq!(table.get(0, |v| *v == 7), Some(7));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn grow_refused_at_the_limit_and_shrink_at_the_floor() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 5, 4);
        assert!(table.grow(10));
        assert_eq!(table.log2_len(), 5);
        assert!(!table.grow(10));
        assert!(table.shrink(1));
        assert_eq!(table.log2_len(), 4);
        assert!(!table.shrink(1));
    }

    #[test]
    fn bulk_delete_filters_and_reports() {
        let table: ChainTable<u64> = ChainTable::new();
        for key in 1..=3 {
            assert!(table.insert(key, |v| *v == key, key));
        }
        let mut deleted = Vec::new();
        table.bulk_delete(|v| *v % 2 == 1, |v| deleted.push(*v));
        deleted.sort_unstable();
        assert_eq!(deleted, vec![1, 3]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(2, |v| *v == 2), Some(2));
        assert_eq!(table.get(1, |v| *v == 1), None);
        assert_eq!(table.get(3, |v| *v == 3), None);
    }

    #[test]
    fn bulk_delete_handles_long_chains() {
        // Everything hashes to one bucket, crossing the per-lock unlink batch bound.
        let table: ChainTable<u64> = ChainTable::new();
        for key in 0..600 {
            assert!(table.insert(1, |v| *v == key, key));
        }
        let deleted = AtomicUsize::new(0);
        table.bulk_delete(
            |_| true,
            |_| {
                deleted.fetch_add(1, Relaxed);
            },
        );
        assert_eq!(deleted.load(Relaxed), 600);
        assert!(table.is_empty());
    }

    #[test]
    fn clear_then_reuse() {
        let table: ChainTable<u64> = ChainTable::new();
        for key in 0..64 {
            assert!(table.insert(key, |v| *v == key, key));
        }
        table.clear();
        assert!(table.is_empty());
        assert!(table.insert(1, |v| *v == 1, 1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn tombstones_never_match() {
        let table: ChainTable<u64> = ChainTable::new().with_dead_predicate(|v| *v >= 1000);
        assert!(table.insert(9, |_| true, 1009));
        assert_eq!(table.get(9, |_| true), None);
        assert!(!table.remove(9, |_| true));
        // Tombstones count towards the length until something unlinks them.
        assert_eq!(table.len(), 1);

        // A live value can take the key a tombstone notionally still holds; the insert saw the
        // tombstone and cleaned it up.
        assert!(table.insert(9, |v| *v == 9, 9));
        assert_eq!(table.get(9, |v| *v == 9), Some(9));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn bulk_delete_drops_tombstones_silently() {
        let table: ChainTable<u64> = ChainTable::new().with_dead_predicate(|v| *v >= 1000);
        for key in 0..8 {
            assert!(table.insert(mix(key), |v| *v == key, key));
            assert!(table.insert(mix(key), |v| *v == 1000 + key, 1000 + key));
        }
        let deleted = AtomicUsize::new(0);
        table.bulk_delete(
            |_| false,
            |_| {
                deleted.fetch_add(1, Relaxed);
            },
        );
        // Tombstones are swept without the deletion callback.
        assert_eq!(deleted.load(Relaxed), 0);
        assert_eq!(table.len(), 8);
        for key in 0..8 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
    }

    #[test]
    fn resize_drops_tombstones() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 10, 3).with_dead_predicate(|v| *v >= 1000);
        for key in 0..16 {
            assert!(table.insert(mix(key), |v| *v == key, key));
            assert!(table.insert(mix(key), |v| *v == 1000 + key, 1000 + key));
        }
        assert!(table.grow(6));
        assert_eq!(table.len(), 16);
        let mut live = 0;
        table.do_scan(|_| {
            live += 1;
            true
        });
        assert_eq!(live, 16);
    }

    #[test]
    fn long_chains_advise_growing() {
        let table: ChainTable<(u64, u64)> = ChainTable::with_sizes(4, 10, 3).with_grow_hint(2);
        assert!(!table.resize_advised());
        for key in 0..5 {
            assert!(table.insert(7, |v| v.1 == key, (7, key)));
        }
        assert!(table.resize_advised());
        assert!(table.grow(5));
        assert!(!table.resize_advised());
    }

    #[test]
    fn scans_visit_everything_once() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 10, 3);
        for key in 0..128 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        let mut seen = Vec::new();
        assert!(table.try_scan(|v| {
            seen.push(*v);
            true
        }));
        seen.sort_unstable();
        assert_eq!(seen, (0..128).collect::<Vec<_>>());
    }

    #[test]
    fn scan_stops_when_the_visitor_says_so() {
        let table: ChainTable<u64> = ChainTable::new();
        for key in 0..64 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        let mut visited = 0;
        table.do_scan(|_| {
            visited += 1;
            visited < 10
        });
        assert_eq!(visited, 10);
    }

    #[test]
    fn scans_do_not_hold_the_epoch_back() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let table: ChainTable<R> = ChainTable::with_sizes(9, 9, 9);
        for key in 0..512 {
            assert!(table.insert(mix(key), |v| v.1 == key, R::new(&COUNT, key)));
        }
        assert!(table.remove(mix(0), |v| v.1 == 0));

        // The removed value must be reclaimed while the scan is still running, which requires
        // the epoch to keep turning over: the scan takes its guard per bucket rather than
        // pinning one for the whole traversal.
        let mut reclaimed_mid_scan = false;
        table.do_scan(|_| {
            if COUNT.load(Relaxed) == 511 {
                reclaimed_mid_scan = true;
            } else {
                Guard::new().accelerate();
            }
            true
        });
        assert!(reclaimed_mid_scan);

        drop(table);
        wait_reclaimed(&COUNT);
    }

    #[test]
    fn safepoint_scan_requires_exclusivity_only() {
        let mut table: ChainTable<u64> = ChainTable::new();
        for key in 0..32 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        let mut seen = Vec::new();
        table.do_safepoint_scan(|v| {
            seen.push(*v);
            true
        });
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn statistics_reflect_the_layout() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 4);
        for key in 0..8 {
            assert!(table.insert(key, |v| *v == key, key));
        }
        let stats = table.statistics();
        assert_eq!(stats.num_buckets, 16);
        assert_eq!(stats.log2_len, 4);
        assert_eq!(stats.skipped_buckets, 0);
        assert_eq!(stats.sampled_entries, 8);
        assert_eq!(stats.max_chain_len, 1);
        assert_eq!(stats.chain_lengths[0], 8);
        assert_eq!(stats.chain_lengths[1], 8);
        assert_eq!(stats.chain_lengths.iter().sum::<usize>(), 16);
        assert!(stats.node_size >= stats.bucket_size);
    }

    #[test]
    fn paused_task_excludes_other_structural_operations() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 3);
        for key in 0..64 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }

        let mut task = table.grow_task();
        assert!(task.prepare());
        task.pause();

        assert!(!table.grow(8));
        assert!(!table.shrink(3));
        assert!(!table.try_scan(|_| true));
        {
            let mut other = table.grow_task();
            assert!(!other.prepare());
        }

        // Single-entry operations keep working across the pause.
        assert!(table.insert(mix(100), |v| *v == 100, 100));
        assert_eq!(table.get(mix(100), |v| *v == 100), Some(100));
        assert!(table.remove(mix(100), |v| *v == 100));

        task.cont();
        while task.do_task() {}
        task.done();
        assert_eq!(table.log2_len(), 5);
        for key in 0..64 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
    }

    #[test]
    fn grow_task_driven_by_cooperating_threads() {
        let table: ChainTable<u64> = ChainTable::with_sizes(8, 10, 3);
        for key in 0..1024 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        let mut task = table.grow_task();
        assert!(task.prepare());
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| while task.do_task() {});
            }
        });
        task.done();
        assert_eq!(table.log2_len(), 9);
        assert_eq!(table.len(), 1024);
        for key in 0..1024 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
    }

    #[test]
    fn unfinished_tasks_finish_on_drop() {
        let table: ChainTable<u64> = ChainTable::with_sizes(4, 8, 3);
        for key in 0..64 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        {
            let mut task = table.grow_task();
            assert!(task.prepare());
            let _ = task.do_task();
            task.pause();
        }
        assert_eq!(table.log2_len(), 5);
        for key in 0..64 {
            assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
        }
    }

    #[test]
    fn bulk_delete_task_pause_spares_swept_buckets() {
        let table: ChainTable<u64> = ChainTable::new();
        for key in 1..=256 {
            assert!(table.insert(mix(key), |v| *v == key, key));
        }
        let mut task = table.bulk_delete_task(|_| true, |_| ());
        assert!(task.prepare());
        // One range sweeps buckets 0..64; bucket 0 is done after this.
        assert!(task.do_task());
        task.pause();
        assert!(table.insert(0, |v| *v == 0, 0));
        task.cont();
        task.done();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0, |v| *v == 0), Some(0));
    }

    #[test]
    fn dropping_the_table_drops_every_value() {
        static CNT: AtomicUsize = AtomicUsize::new(0);
        {
            let table: ChainTable<R> = ChainTable::with_sizes(4, 8, 3);
            for key in 0..256 {
                assert!(table.insert(mix(key), |v| v.1 == key, R::new(&CNT, key)));
            }
            assert!(table.grow(6));
        }
        wait_reclaimed(&CNT);
    }

    #[test]
    fn removal_reclaims_after_the_epoch_turns() {
        static CNT: AtomicUsize = AtomicUsize::new(0);
        let table: ChainTable<R> = ChainTable::new();
        for key in 0..64 {
            assert!(table.insert(mix(key), |v| v.1 == key, R::new(&CNT, key)));
        }
        for key in 0..64 {
            assert!(table.remove(mix(key), |v| v.1 == key));
        }
        assert!(table.is_empty());
        wait_reclaimed(&CNT);
    }

    #[test]
    fn bulk_delete_reclaims_everything() {
        static CNT: AtomicUsize = AtomicUsize::new(0);
        let table: ChainTable<R> = ChainTable::new();
        for key in 0..512 {
            assert!(table.insert(mix(key), |v| v.1 == key, R::new(&CNT, key)));
        }
        table.clear();
        assert!(table.is_empty());
        wait_reclaimed(&CNT);
    }

    #[test]
    fn mixed_workload_with_a_concurrent_resizer() {
        let table: ChainTable<u64> = ChainTable::with_sizes(5, 10, 4);
        let num_writers = 4;
        let keys_per_writer = 1024_u64;
        let barrier = Barrier::new(num_writers + 1);
        thread::scope(|s| {
            for writer in 0..num_writers as u64 {
                let table = &table;
                let barrier = &barrier;
                s.spawn(move || {
                    let base = writer * keys_per_writer;
                    barrier.wait();
                    for key in base..base + keys_per_writer {
                        assert!(table.insert(mix(key), |v| *v == key, key));
                        assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
                    }
                    let mut keys: Vec<u64> = (base..base + keys_per_writer).collect();
                    keys.shuffle(&mut rand::rng());
                    for key in keys {
                        assert_eq!(table.get(mix(key), |v| *v == key), Some(key));
                        assert!(table.remove(mix(key), |v| *v == key));
                        assert_eq!(table.get(mix(key), |v| *v == key), None);
                    }
                });
            }
            s.spawn(|| {
                barrier.wait();
                for _ in 0..64 {
                    table.grow(8);
                    thread::yield_now();
                    table.shrink(5);
                    thread::yield_now();
                }
            });
        });
        assert!(table.is_empty());
    }

    #[test]
    fn debug_and_default() {
        let table: ChainTable<u64> = ChainTable::default();
        assert!(table.insert(1, |v| *v == 1, 1));
        let rendered = format!("{table:?}");
        assert!(rendered.contains("len: 1"));
    }
}
