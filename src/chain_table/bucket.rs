//! [`Bucket`] and [`Node`]: one chain slot of the table and its list elements.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::{hint, thread};

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};

/// A singly-linked chain element owning one value and its caller-supplied hash.
///
/// A published [`Node`] is immutable except for `next`, which only the thread holding the owning
/// [`Bucket`] lock may mutate. Readers traverse `next` without synchronization; reclamation is
/// deferred until no reader can hold a pointer into the node.
pub(crate) struct Node<T> {
    hash: u64,
    next: AtomicShared<Node<T>>,
    value: T,
}

/// A single table slot: the chain head pointer with two flag bits packed into the same word.
///
/// `Tag::First` is the LOCKED bit and `Tag::Second` is the REDIRECTED bit, so lock transitions,
/// redirection, and head publication are each a single atomic operation on one word.
pub(crate) struct Bucket<T> {
    head: AtomicShared<Node<T>>,
}

/// A writable location in a chain: either a [`Bucket`] head or some node's `next` field.
///
/// Splicing through a [`LinkRef`] preserves the flag bits of a bucket head, which stay locked
/// while the chain is mutated.
pub(crate) struct LinkRef<'g, T> {
    link: &'g AtomicShared<Node<T>>,
    at_head: bool,
}

/// Result of an unsynchronized walk over one chain.
pub(crate) struct ChainScan<'g, T> {
    pub(crate) found: Option<&'g Node<T>>,
    pub(crate) len: usize,
    pub(crate) dead: usize,
}

/// Spins before the lock loops start yielding the processor.
pub(crate) const SPIN_LIMIT: usize = 16;

impl<T> Node<T> {
    #[inline]
    pub(crate) fn new(hash: u64, value: T) -> Self {
        Self {
            hash,
            next: AtomicShared::null(),
            value,
        }
    }

    #[inline]
    pub(crate) const fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub(crate) const fn value(&self) -> &T {
        &self.value
    }

    #[inline]
    pub(crate) fn next_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, Node<T>> {
        self.next.load(Acquire, guard)
    }

    #[inline]
    pub(crate) fn next_shared(&self, guard: &Guard) -> Option<Shared<Node<T>>> {
        self.next.get_shared(Acquire, guard)
    }

    /// Links `next` before the node is published; the node must still be exclusively owned.
    #[inline]
    pub(crate) fn link_next(&self, next: Option<Shared<Node<T>>>) {
        let (unlinked, _) = self.next.swap((next, Tag::None), Relaxed);
        drop(unlinked);
    }

    /// Detaches and returns `next` during exclusive teardown.
    #[inline]
    pub(crate) fn take_next(&self) -> Option<Shared<Node<T>>> {
        self.next.swap((None, Tag::None), Relaxed).0
    }
}

impl<T> Bucket<T> {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicShared::null(),
        }
    }

    /// Returns the head word; `Ptr::as_ref` masks the flag bits, so the result can be walked
    /// directly while `Ptr::tag` exposes the LOCKED/REDIRECTED state at load time.
    #[inline]
    pub(crate) fn head_ptr<'g>(&self, guard: &'g Guard) -> Ptr<'g, Node<T>> {
        self.head.load(Acquire, guard)
    }

    #[inline]
    pub(crate) fn head_shared(&self, guard: &Guard) -> Option<Shared<Node<T>>> {
        self.head.get_shared(Acquire, guard)
    }

    #[inline]
    pub(crate) fn is_redirected(&self) -> bool {
        matches!(self.head.tag(Acquire), Tag::Second | Tag::Both)
    }

    /// Atomically sets LOCKED unless the bucket is locked or redirected. Never blocks.
    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        self.head
            .update_tag_if(Tag::First, |ptr| ptr.tag() == Tag::None, Acquire, Relaxed)
    }

    /// Spins for the bucket lock, yielding the processor once the spin budget is exhausted.
    ///
    /// Returns `false` without acquiring anything if the bucket is observed REDIRECTED: a
    /// redirected bucket is retired and the caller must re-resolve through the new array.
    pub(crate) fn lock(&self) -> bool {
        let mut spins = 0;
        loop {
            match self.head.tag(Relaxed) {
                Tag::Second | Tag::Both => return false,
                Tag::None => {
                    if self.try_lock() {
                        return true;
                    }
                }
                Tag::First => (),
            }
            spins += 1;
            if spins < SPIN_LIMIT {
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    /// Clears LOCKED. A redirected bucket is retired and must never be unlocked.
    #[inline]
    pub(crate) fn unlock(&self) {
        let unlocked =
            self.head
                .update_tag_if(Tag::None, |ptr| ptr.tag() == Tag::First, Release, Relaxed);
        assert!(unlocked, "unlock of a bucket that is not locked, or is redirected");
    }

    /// Marks the bucket REDIRECTED. The caller must hold the lock; the bucket stays locked and
    /// redirected until its array is retired.
    #[inline]
    pub(crate) fn redirect(&self) {
        let redirected =
            self.head
                .update_tag_if(Tag::Both, |ptr| ptr.tag() == Tag::First, Release, Relaxed);
        assert!(redirected, "redirect of a bucket that is not locked");
    }

    /// Lock-free head insertion for the uncontended path.
    ///
    /// `expected` must carry no tag; the exchange therefore fails rather than racing whenever the
    /// bucket is locked or redirected. On failure the node is handed back for the retry loop.
    #[inline]
    pub(crate) fn cas_first<'g>(
        &self,
        expected: Ptr<'g, Node<T>>,
        node: Shared<Node<T>>,
        guard: &'g Guard,
    ) -> Result<Ptr<'g, Node<T>>, Shared<Node<T>>> {
        debug_assert_eq!(expected.tag(), Tag::None);
        match self
            .head
            .compare_exchange(expected, (Some(node), Tag::None), AcqRel, Acquire, guard)
        {
            Ok((unlinked, head_ptr)) => {
                // The previous head stays in the chain through the new node's `next` clone.
                drop(unlinked);
                Ok(head_ptr)
            }
            Err((node, _)) => {
                // The exchange always hands the rejected node back.
                Err(node.unwrap_or_else(|| unreachable!()))
            }
        }
    }

    /// Detaches and returns the chain during exclusive teardown, ignoring the flag bits.
    #[inline]
    pub(crate) fn take_head(&self) -> Option<Shared<Node<T>>> {
        self.head.swap((None, Tag::None), Relaxed).0
    }

    /// Installs a chain head into a fresh bucket of an in-progress array, leaving it LOCKED.
    ///
    /// Only the resize owner may call this, and only before the source bucket is redirected,
    /// so the bucket cannot yet be reached by writers.
    #[inline]
    pub(crate) fn install_locked_head(&self, head: Option<Shared<Node<T>>>) {
        let (previous, tag) = self.head.swap((head, Tag::First), Release);
        debug_assert_eq!(tag, Tag::None);
        debug_assert!(previous.is_none());
        drop(previous);
    }
}

impl<'g, T> LinkRef<'g, T> {
    /// A cursor positioned at the bucket head.
    #[inline]
    pub(crate) fn head(bucket: &'g Bucket<T>) -> Self {
        Self {
            link: &bucket.head,
            at_head: true,
        }
    }

    /// A cursor positioned at `node.next`.
    #[inline]
    pub(crate) fn next_of(node: &'g Node<T>) -> Self {
        Self {
            link: &node.next,
            at_head: false,
        }
    }

    #[inline]
    pub(crate) fn load(&self, guard: &'g Guard) -> Ptr<'g, Node<T>> {
        self.link.load(Acquire, guard)
    }

    /// Replaces the pointee with `next` in a single pointer move, returning the unlinked head.
    ///
    /// The caller must hold the lock of the bucket owning this location; the LOCKED bit of a
    /// bucket head is preserved across the splice.
    #[inline]
    pub(crate) fn splice(&self, next: Option<Shared<Node<T>>>) -> Option<Shared<Node<T>>> {
        let tag = if self.at_head { Tag::First } else { Tag::None };
        let (unlinked, _) = self.link.swap((next, tag), Release);
        unlinked
    }
}

/// Walks one chain without synchronization, applying `eq` to every live value.
///
/// Values flagged by `is_dead` are unconditionally non-matching and only counted, which gives
/// lazy-deletion schemes their tombstone semantics.
pub(crate) fn scan_chain<'g, T, E: FnMut(&T) -> bool>(
    head: Ptr<'g, Node<T>>,
    eq: &mut E,
    is_dead: Option<fn(&T) -> bool>,
    guard: &'g Guard,
) -> ChainScan<'g, T> {
    let mut scan = ChainScan {
        found: None,
        len: 0,
        dead: 0,
    };
    let mut cursor = head;
    while let Some(node) = cursor.as_ref() {
        scan.len += 1;
        if is_dead.is_some_and(|dead| dead(node.value())) {
            scan.dead += 1;
        } else if scan.found.is_none() && eq(node.value()) {
            scan.found = Some(node);
            // Keep counting: the caller sizes its grow advice on the full chain length.
        }
        cursor = node.next_ptr(guard);
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_state_transitions() {
        let bucket: Bucket<usize> = Bucket::new();
        assert!(bucket.try_lock());
        assert!(!bucket.try_lock());
        assert!(!bucket.is_redirected());
        bucket.unlock();
        assert!(bucket.lock());

        bucket.redirect();
        assert!(bucket.is_redirected());
        assert!(!bucket.try_lock());
        assert!(!bucket.lock());
    }

    #[test]
    fn cas_first_refuses_locked_bucket() {
        let bucket: Bucket<usize> = Bucket::new();
        let guard = Guard::new();

        let head = bucket.head_ptr(&guard);
        assert!(bucket
            .cas_first(head, Shared::new(Node::new(1, 11)), &guard)
            .is_ok());

        assert!(bucket.lock());
        let stale = bucket.head_ptr(&guard).without_tag();
        let rejected = bucket.cas_first(stale, Shared::new(Node::new(2, 22)), &guard);
        assert!(rejected.is_err());
        bucket.unlock();
    }

    #[test]
    fn chain_walk_and_splice() {
        let bucket: Bucket<u64> = Bucket::new();
        let guard = Guard::new();

        // Build 3 -> 2 -> 1 through the public insertion path.
        for value in 1..=3 {
            let node = Shared::new(Node::new(value, value));
            node.link_next(bucket.head_shared(&guard));
            let head = bucket.head_ptr(&guard);
            assert!(bucket.cas_first(head, node, &guard).is_ok());
        }

        let scan = scan_chain(bucket.head_ptr(&guard), &mut |v: &u64| *v == 2, None, &guard);
        assert_eq!(scan.len, 3);
        assert_eq!(scan.dead, 0);
        assert_eq!(scan.found.map(|n| *n.value()), Some(2));

        // Unlink the middle node under the lock.
        assert!(bucket.lock());
        let mut link = LinkRef::head(&bucket);
        let mut unlinked = None;
        let mut cursor = link.load(&guard);
        while let Some(node) = cursor.as_ref() {
            if *node.value() == 2 {
                unlinked = link.splice(node.next_shared(&guard));
                break;
            }
            link = LinkRef::next_of(node);
            cursor = link.load(&guard);
        }
        bucket.unlock();

        assert_eq!(unlinked.as_ref().map(|n| *n.value()), Some(2));
        drop(unlinked);

        let scan = scan_chain(bucket.head_ptr(&guard), &mut |_: &u64| false, None, &guard);
        assert_eq!(scan.len, 2);
    }

    #[test]
    fn dead_values_are_non_matching() {
        let bucket: Bucket<u64> = Bucket::new();
        let guard = Guard::new();
        for value in [7, 8] {
            let node = Shared::new(Node::new(value, value));
            node.link_next(bucket.head_shared(&guard));
            let head = bucket.head_ptr(&guard);
            assert!(bucket.cas_first(head, node, &guard).is_ok());
        }

        let tombstone: fn(&u64) -> bool = |v| *v == 7;
        let scan = scan_chain(
            bucket.head_ptr(&guard),
            &mut |v: &u64| *v == 7,
            Some(tombstone),
            &guard,
        );
        assert!(scan.found.is_none());
        assert_eq!(scan.dead, 1);
        assert_eq!(scan.len, 2);
    }
}
