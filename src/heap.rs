//! The heap context.
//!
//! A [`Heap`] owns a size-class chain, a page ledger and the page source both
//! are carved from. All of its state lives in pages it obtained itself; the
//! `Heap` value only holds the roots.

use core::{fmt, ptr::NonNull};

use crate::{
    base::{object_of, payload_of, Bucket},
    bucket::Chain,
    error::HeapError,
    ledger::Ledger,
    page::PageKind,
    HeapConfig, PageSource,
};

#[cfg(all(unix, feature = "std"))]
use crate::page::Mmap;

/// Occupancy figures for a [`Heap`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Object pages currently recorded in the ledger.
    pub object_pages: usize,
    /// Pages occupied by the ledger itself.
    pub ledger_pages: usize,
    /// Size classes created so far.
    pub size_classes: usize,
    /// Free objects across all size classes.
    pub free_objects: usize,
}

/// A bucket allocator over pages obtained from a [`PageSource`].
///
/// Requests are served from size classes that start at the configured maximum
/// object size and halve down towards the minimum. Each size class keeps its
/// free objects in address order, which lets it return a page to the source as
/// soon as every object carved from that page has been freed.
///
/// Dropping the heap releases every page it obtained, including pages that
/// still hold live allocations.
pub struct Heap<S: PageSource> {
    config: HeapConfig,
    chain: Chain,
    ledger: Ledger,
    source: S,
}

#[cfg(all(unix, feature = "std"))]
impl Heap<Mmap> {
    /// Attempts to construct a new `Heap` backed by pages mapped from the
    /// operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial chain and ledger pages could not be
    /// mapped.
    pub fn try_new(config: HeapConfig) -> Result<Heap<Mmap>, HeapError> {
        Self::try_new_in(config, Mmap)
    }
}

impl<S: PageSource> Heap<S> {
    /// Attempts to construct a new `Heap` backed by `source`.
    ///
    /// Two pages are obtained immediately: the chain page, whose root size
    /// class serves `config.max_object_size()` bytes, and the first ledger page.
    ///
    /// # Errors
    ///
    /// Returns an error if either page could not be obtained. No page is held
    /// on failure.
    pub fn try_new_in(config: HeapConfig, mut source: S) -> Result<Heap<S>, HeapError> {
        let chain_len = PageKind::Chain.bytes(&config);
        let page_len = PageKind::Object.bytes(&config);

        let chain_page = source.alloc_page(chain_len)?;
        let ledger_page = match source.alloc_page(page_len) {
            Ok(p) => p,
            Err(e) => {
                unsafe { source.free_page(chain_page, chain_len) };
                return Err(e.into());
            }
        };

        // SAFETY: both pages are fresh, exclusively owned, and of the sizes the
        // configuration was validated against.
        let (chain, ledger) = unsafe {
            (
                Chain::new(chain_page, config.max_object_size()),
                Ledger::new(ledger_page, config.ledger_capacity()),
            )
        };

        log::debug!(
            "heap initialized: {} byte pages, objects {}..={} bytes",
            config.page_size(),
            config.min_object_size(),
            config.max_object_size()
        );

        Ok(Heap {
            config,
            chain,
            ledger,
            source,
        })
    }

    /// Returns the heap's configuration.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Returns a reference to the page source.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns a mutable reference to the page source.
    #[inline]
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// The returned block is aligned to [`PAYLOAD_ALIGN`] bytes. A `size` of
    /// zero yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `size` is greater than the maximum object size.
    /// - The size class is exhausted and the page source cannot supply a page.
    ///
    /// [`PAYLOAD_ALIGN`]: crate::PAYLOAD_ALIGN
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        if size == 0 {
            return Ok(None);
        }

        if size > self.config.max_object_size() {
            return Err(HeapError::AllocationTooLarge);
        }

        let bucket = self
            .chain
            .find_or_create(size, self.config.min_object_size());

        if unsafe { bucket.as_ref().head.is_none() } {
            self.populate(bucket)?;
        }

        let obj = unsafe { (*bucket.as_ptr()).pop() }.ok_or(HeapError::OutOfMemory)?;

        Ok(Some(payload_of(obj)))
    }

    /// Obtains a page, records it and carves it into `bucket`'s free list.
    fn populate(&mut self, bucket: NonNull<Bucket>) -> Result<(), HeapError> {
        let page_len = PageKind::Object.bytes(&self.config);
        let page = self.source.alloc_page(page_len)?;

        if let Err(e) = self.ledger.record(page, &mut self.source, page_len) {
            unsafe { self.source.free_page(page, page_len) };
            return Err(e);
        }

        log::trace!(
            "carving {page:p} into {}-byte objects",
            unsafe { bucket.as_ref().object_size }
        );

        // SAFETY: the page is fresh and sized by the validated configuration,
        // and population only happens once the free list is empty.
        unsafe { Bucket::populate(bucket, page, page_len) };

        Ok(())
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// If this leaves every object of a page free, the page is removed from
    /// the ledger and returned to the page source.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::CannotFree`] if `ptr` is detectably not a live
    /// allocation of this heap: its header names no size class of this heap,
    /// or it is already free.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this heap.
    /// Detection of foreign and double frees is best-effort and reads the
    /// header in front of `ptr`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let obj = object_of(ptr).ok_or(HeapError::CannotFree)?;
        let bucket = unsafe { obj.as_ref().bucket };

        if !self.chain.owns(bucket) {
            return Err(HeapError::CannotFree);
        }

        let bucket = unsafe { &mut *bucket.as_ptr() };

        if !unsafe { bucket.insert(obj) } {
            log::debug!("double free of {ptr:p}");
            return Err(HeapError::CannotFree);
        }

        let page_len = PageKind::Object.bytes(&self.config);
        let Heap { ledger, source, .. } = self;

        // SAFETY: every object on the list was carved by `populate` from a page
        // of `page_len` bytes.
        unsafe {
            bucket.reclaim(page_len, |page| {
                let recorded = ledger.remove(page, &mut *source, page_len);
                debug_assert!(recorded, "reclaimed page was not in the ledger");

                log::trace!("reclaimed {page:p}");
                source.free_page(page, page_len);
            })
        };

        Ok(())
    }

    /// Returns the number of usable bytes in the block referenced by `ptr`.
    ///
    /// This is the object size of the size class that served the block, and is
    /// at least the size that was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let obj = object_of(ptr)?;
        let bucket = unsafe { obj.as_ref().bucket };

        self.chain
            .owns(bucket)
            .then(|| unsafe { bucket.as_ref().object_size })
    }

    /// Returns the heap's current occupancy.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            object_pages: self.ledger.recorded(),
            ledger_pages: self.ledger.ledger_pages(),
            size_classes: self.chain.len(),
            free_objects: self
                .chain
                .buckets()
                .map(|b| unsafe { b.as_ref().free_objects() })
                .sum(),
        }
    }

    /// Releases every page the heap holds.
    ///
    /// Equivalent to dropping the heap.
    pub fn finish(self) {
        drop(self);
    }
}

impl<S: PageSource> Drop for Heap<S> {
    fn drop(&mut self) {
        let chain_len = PageKind::Chain.bytes(&self.config);
        let page_len = PageKind::Object.bytes(&self.config);

        log::debug!(
            "heap finished: releasing {} object pages",
            self.ledger.recorded()
        );

        // SAFETY: every recorded page, every ledger page and the chain page were
        // obtained from `self.source` with these lengths, and none of them is
        // used again.
        unsafe {
            self.ledger.release(&mut self.source, page_len);
            self.source.free_page(self.chain.page(), chain_len);
        }
    }
}

impl<S: PageSource> fmt::Debug for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("chain", &self.chain.page())
            .field("size_classes", &self.chain.len())
            .field("object_pages", &self.ledger.recorded())
            .finish()
    }
}

// SAFETY: the heap exclusively owns every page it refers to.
unsafe impl<S: PageSource + Send> Send for Heap<S> {}
