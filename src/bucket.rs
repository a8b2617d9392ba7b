//! Size classes and their free lists.
//!
//! The chain of size classes lives in a single small page. The root serves
//! objects of the maximum size, and each subsequent bucket serves objects half
//! the size of the one before it. Buckets are only ever appended, so the chain
//! is also the array of headers laid out in the chain page.
//!
//! Each bucket keeps its free objects in ascending address order. Because the
//! objects of one page are carved contiguously, a page is entirely free exactly
//! when its boundary object is followed on the free list by every other object
//! of that page, each one stride after the last.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case              |
//! |--------------------------|-----------|-------------------------|
//! | Find size class          | O(1)      | O(classes)              |
//! | Pop                      | O(1)      | O(1)                    |
//! | Insert                   | O(1)      | O(free objects)         |
//! | Reclamation scan         | O(1)      | O(free objects)         |

use core::{iter, ptr::NonNull};

use crate::{
    base::{
        addr_after, bucket_after, carve_page, init_bucket_at, page_of_boundary, stride, Bucket,
        Object, BUCKET_HEADER_SIZE,
    },
    config::{fits, SMALL_PAGE_SIZE},
    polyfill::Strict,
};

pub(crate) struct Chain {
    page: NonNull<u8>,
    root: NonNull<Bucket>,
    len: usize,
}

impl Chain {
    /// Creates a chain in `page` whose root serves `max_object_size` bytes.
    ///
    /// # Safety
    ///
    /// `page` must be valid for reads and writes for [`SMALL_PAGE_SIZE`] bytes
    /// and aligned for `Bucket`.
    pub unsafe fn new(page: NonNull<u8>, max_object_size: usize) -> Chain {
        let root = unsafe { init_bucket_at(page.cast(), max_object_size) };

        Chain {
            page,
            root,
            len: 1,
        }
    }

    /// Returns the page holding the chain.
    #[inline]
    pub fn page(&self) -> NonNull<u8> {
        self.page
    }

    /// Returns the number of size classes created so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Iterates over the buckets from largest to smallest.
    pub fn buckets(&self) -> impl Iterator<Item = NonNull<Bucket>> + '_ {
        iter::successors(Some(self.root), |bucket| unsafe { bucket.as_ref().next })
    }

    /// Returns whether `bucket` is the address of a header in this chain.
    pub fn owns(&self, bucket: NonNull<Bucket>) -> bool {
        let base = self.page.as_ptr().addr();
        let addr = bucket.as_ptr().addr();

        match addr.checked_sub(base) {
            Some(ofs) => ofs < self.len * BUCKET_HEADER_SIZE && ofs % BUCKET_HEADER_SIZE == 0,
            None => false,
        }
    }

    /// Finds the bucket that serves `size`-byte requests, creating smaller
    /// buckets as needed.
    ///
    /// If the appropriate size class would be smaller than `min_object_size`,
    /// the smallest permitted bucket is returned instead.
    pub fn find_or_create(&mut self, size: usize, min_object_size: usize) -> NonNull<Bucket> {
        let mut current = self.root;

        loop {
            let bucket = unsafe { &mut *current.as_ptr() };
            if bucket.fits(size) {
                return current;
            }

            current = match bucket.next {
                Some(next) => next,
                None => {
                    let half = bucket.object_size / 2;
                    if half < min_object_size {
                        return current;
                    }

                    debug_assert!((self.len + 1) * BUCKET_HEADER_SIZE <= SMALL_PAGE_SIZE);

                    // SAFETY: the configuration guarantees that every size class
                    // down to the minimum fits in the chain page, and `current`
                    // is the last header in it.
                    let next = unsafe { init_bucket_at(bucket_after(current), half) };
                    bucket.next = Some(next);
                    self.len += 1;

                    log::trace!("created size class of {half} bytes");

                    next
                }
            };
        }
    }
}

impl Bucket {
    /// Returns whether `size`-byte requests belong in this bucket.
    #[inline]
    pub fn fits(&self, size: usize) -> bool {
        fits(size, self.object_size)
    }

    /// Returns the distance between consecutive objects of this bucket.
    #[inline]
    pub fn stride(&self) -> usize {
        stride(self.object_size)
    }

    /// Carves `page` into objects and makes them the bucket's free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `bucket` must point to a valid `Bucket` with an empty free list.
    /// - `page` must be valid for reads and writes for `page_size` bytes, and
    ///   must not be referenced by anything else.
    /// - At least one object of this bucket must fit in `page_size` bytes.
    pub unsafe fn populate(bucket: NonNull<Bucket>, page: NonNull<u8>, page_size: usize) {
        let b = unsafe { &mut *bucket.as_ptr() };
        debug_assert!(b.head.is_none());

        let first = unsafe { carve_page(page, page_size, b.stride(), bucket) };
        b.head = Some(first);
    }

    /// Pops the lowest-addressed free object.
    pub fn pop(&mut self) -> Option<NonNull<Object>> {
        let head = self.head?;

        self.head = unsafe { head.as_ref().next };

        Some(head)
    }

    /// Inserts `obj` into the free list, keeping the list in ascending address
    /// order.
    ///
    /// Returns `false`, leaving the list unchanged, if `obj` is already on it.
    ///
    /// # Safety
    ///
    /// `obj` must point to an object header of this bucket that is not on any
    /// other free list.
    pub unsafe fn insert(&mut self, obj: NonNull<Object>) -> bool {
        let addr = obj.as_ptr().addr();
        let mut link = &mut self.head;

        loop {
            match *link {
                Some(node) if node == obj => return false,
                Some(node) if node.as_ptr().addr() < addr => {
                    link = unsafe { &mut (*node.as_ptr()).next };
                }
                _ => break,
            }
        }

        unsafe { (*obj.as_ptr()).next = *link };
        *link = Some(obj);

        true
    }

    /// Unlinks every entirely free page from the free list and passes it to
    /// `release`.
    ///
    /// The whole list is scanned; more than one page may be released. Returns
    /// the number of pages released.
    ///
    /// # Safety
    ///
    /// Every object on the free list must have been carved from a page of
    /// `page_size` bytes by [`Bucket::populate`].
    pub unsafe fn reclaim(
        &mut self,
        page_size: usize,
        mut release: impl FnMut(NonNull<u8>),
    ) -> usize {
        let stride = self.stride();
        let per_page = page_size / stride;
        let mut released = 0;
        let mut link = &mut self.head;

        while let Some(node) = *link {
            let run_end = unsafe {
                if (*node.as_ptr()).boundary {
                    contiguous_run(node, per_page, stride)
                } else {
                    None
                }
            };

            match run_end {
                Some(last) => {
                    // Objects preceding the boundary on the list are at lower
                    // addresses, so `link` lies outside the released page.
                    *link = unsafe { (*last.as_ptr()).next };
                    release(page_of_boundary(node));
                    released += 1;
                }
                None => link = unsafe { &mut (*node.as_ptr()).next },
            }
        }

        released
    }

    /// Returns the number of objects on the free list.
    pub fn free_objects(&self) -> usize {
        iter::successors(self.head, |obj| unsafe { obj.as_ref().next }).count()
    }
}

/// Follows the free list from `first` for `count` objects, each of which must
/// start exactly one stride after its predecessor.
///
/// Returns the last object of the run, or `None` if the run is broken.
unsafe fn contiguous_run(
    first: NonNull<Object>,
    count: usize,
    stride: usize,
) -> Option<NonNull<Object>> {
    let mut last = first;

    for _ in 1..count {
        let next = unsafe { last.as_ref().next }?;
        if next.as_ptr().addr() != addr_after(last, stride) {
            return None;
        }

        last = next;
    }

    Some(last)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::{polyfill::NonNullStrict, tests::Counting, PageSource};

    const PAGE: usize = SMALL_PAGE_SIZE;

    fn chain(source: &mut Counting, max: usize) -> Chain {
        let page = source.alloc_page(SMALL_PAGE_SIZE).unwrap();
        unsafe { Chain::new(page, max) }
    }

    fn addrs(bucket: &Bucket) -> Vec<usize> {
        iter::successors(bucket.head, |obj| unsafe { obj.as_ref().next })
            .map(|obj| obj.as_ptr().addr())
            .collect()
    }

    #[test]
    fn chain_grows_lazily_by_halving() {
        let mut source = Counting::new();
        let mut chain = chain(&mut source, 1024);
        assert_eq!(chain.len(), 1);

        let b = chain.find_or_create(1000, 16);
        assert_eq!(unsafe { b.as_ref().object_size }, 1024);
        assert_eq!(chain.len(), 1);

        let b = chain.find_or_create(100, 16);
        assert_eq!(unsafe { b.as_ref().object_size }, 128);
        assert_eq!(chain.len(), 4);

        let sizes: Vec<usize> = chain
            .buckets()
            .map(|b| unsafe { b.as_ref().object_size })
            .collect();
        assert_eq!(sizes, [1024, 512, 256, 128]);

        // Existing buckets are reused.
        assert_eq!(chain.find_or_create(200, 16), chain.buckets().nth(2).unwrap());
        assert_eq!(chain.len(), 4);

        unsafe { source.free_page(chain.page(), SMALL_PAGE_SIZE) };
    }

    #[test]
    fn chain_stops_at_minimum() {
        let mut source = Counting::new();
        let mut chain = chain(&mut source, 256);

        let b = chain.find_or_create(1, 32);
        assert_eq!(unsafe { b.as_ref().object_size }, 32);
        assert_eq!(chain.len(), 4);

        let b = chain.find_or_create(3, 32);
        assert_eq!(unsafe { b.as_ref().object_size }, 32);
        assert_eq!(chain.len(), 4);

        unsafe { source.free_page(chain.page(), SMALL_PAGE_SIZE) };
    }

    #[test]
    fn chain_recognizes_its_buckets() {
        let mut source = Counting::new();
        let mut chain = chain(&mut source, 256);
        let small = chain.find_or_create(20, 16);

        assert!(chain.owns(small));
        for bucket in chain.buckets() {
            assert!(chain.owns(bucket));
        }

        let misaligned = small.cast::<u8>().map_addr(|a| {
            core::num::NonZeroUsize::new(a.get() + 8).unwrap()
        });
        assert!(!chain.owns(misaligned.cast()));
        let past_end = unsafe { bucket_after(small) };
        assert!(!chain.owns(past_end));

        unsafe { source.free_page(chain.page(), SMALL_PAGE_SIZE) };
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let mut source = Counting::new();
        let mut chain = chain(&mut source, 256);
        let bucket = unsafe { &mut *chain.find_or_create(64, 16).as_ptr() };

        let page = source.alloc_page(PAGE).unwrap();
        unsafe { Bucket::populate(NonNull::from(&mut *bucket), page, PAGE) };
        let carved = addrs(bucket);

        let objs: Vec<_> = (0..5).map(|_| bucket.pop().unwrap()).collect();
        for &i in &[3, 0, 4, 1, 2] {
            assert!(unsafe { bucket.insert(objs[i]) });
        }
        assert_eq!(addrs(bucket), carved);

        // Double insertion is refused.
        let obj = bucket.pop().unwrap();
        assert!(unsafe { bucket.insert(obj) });
        assert!(!unsafe { bucket.insert(obj) });
        assert_eq!(addrs(bucket), carved);

        unsafe {
            source.free_page(page, PAGE);
            source.free_page(chain.page(), SMALL_PAGE_SIZE);
        }
    }

    #[test]
    fn reclaim_releases_only_whole_pages() {
        let mut source = Counting::new();
        let mut chain = chain(&mut source, 256);
        let bucket = unsafe { &mut *chain.find_or_create(200, 16).as_ptr() };
        let per_page = PAGE / bucket.stride();

        // Two pages, fully allocated.
        let first = source.alloc_page(PAGE).unwrap();
        unsafe { Bucket::populate(NonNull::from(&mut *bucket), first, PAGE) };
        let mut a: Vec<_> = (0..per_page).map(|_| bucket.pop().unwrap()).collect();

        let second = source.alloc_page(PAGE).unwrap();
        unsafe { Bucket::populate(NonNull::from(&mut *bucket), second, PAGE) };
        let b: Vec<_> = (0..per_page).map(|_| bucket.pop().unwrap()).collect();
        assert!(bucket.head.is_none());

        // Free all of `b` and all but one of `a`.
        let kept = a.pop().unwrap();
        for &obj in a.iter().rev().chain(b.iter()) {
            unsafe { bucket.insert(obj) };
        }

        let mut released = Vec::new();
        let n = unsafe { bucket.reclaim(PAGE, |p| released.push(p)) };
        assert_eq!(n, 1);
        assert_eq!(released, [second]);
        assert_eq!(bucket.free_objects(), per_page - 1);

        // Freeing the last object of `a` makes its page reclaimable too.
        unsafe { bucket.insert(kept) };
        released.clear();
        let n = unsafe { bucket.reclaim(PAGE, |p| released.push(p)) };
        assert_eq!(n, 1);
        assert_eq!(released, [first]);
        assert!(bucket.head.is_none());

        unsafe {
            source.free_page(first, PAGE);
            source.free_page(second, PAGE);
            source.free_page(chain.page(), SMALL_PAGE_SIZE);
        }
    }
}
