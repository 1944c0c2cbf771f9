//! [`BucketArray`]: a fixed, power-of-two-sized array of [`Bucket`] instances.

use super::bucket::Bucket;

/// The bucket array backing the table at one size.
///
/// Identity and size are immutable once constructed; resizing builds a new [`BucketArray`] and
/// swaps it in, never resizes in place. The old array is retired after an epoch turnover.
pub(crate) struct BucketArray<T> {
    buckets: Box<[Bucket<T>]>,
    log2_len: u32,
}

impl<T> BucketArray<T> {
    /// Allocates an array of `1 << log2_len` empty buckets.
    pub(crate) fn new(log2_len: u32) -> Self {
        debug_assert!(log2_len < usize::BITS);
        let buckets = (0..1_usize << log2_len).map(|_| Bucket::new()).collect();
        Self { buckets, log2_len }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        1 << self.log2_len
    }

    #[inline]
    pub(crate) const fn log2_len(&self) -> u32 {
        self.log2_len
    }

    /// Maps a hash to its bucket index using the low `log2_len` bits.
    ///
    /// Doubling the array extends the mask by one bit, which is what lets a grow split each old
    /// chain into exactly the "even" (`i`) and "odd" (`i + len`) buckets of the new array.
    #[inline]
    pub(crate) const fn bucket_index(&self, hash: u64) -> usize {
        (hash as usize) & (self.len() - 1)
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket<T> {
        &self.buckets[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing() {
        let array: BucketArray<usize> = BucketArray::new(4);
        assert_eq!(array.len(), 16);
        assert_eq!(array.log2_len(), 4);
    }

    #[test]
    fn even_odd_split_of_doubled_index() {
        let old: BucketArray<usize> = BucketArray::new(3);
        let new: BucketArray<usize> = BucketArray::new(4);
        for hash in 0..64_u64 {
            let old_index = old.bucket_index(hash);
            let new_index = new.bucket_index(hash);
            assert!(new_index == old_index || new_index == old_index + old.len());
        }
    }
}
