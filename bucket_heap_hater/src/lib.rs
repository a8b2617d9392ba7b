#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use bucket_heap::{ConfigError, Global, Heap, HeapConfig, HeapError};

pub struct HeapSubject(Heap<Global>);

impl HeapSubject {
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        let h = Heap::try_new_in(config, Global)?;
        Ok(HeapSubject(h))
    }

    /// Builds a subject from raw configuration values, rejecting combinations
    /// the heap cannot satisfy.
    pub fn with_sizes(
        page_size: usize,
        min_object_size: usize,
        max_object_size: usize,
    ) -> Result<Self, ConfigError> {
        let config = HeapConfig::new(page_size, min_object_size, max_object_size)?;

        // Construction only fails if the global allocator does.
        Ok(HeapSubject::new(config).expect("global allocator failed"))
    }

    pub fn heap(&self) -> &Heap<Global> {
        &self.0
    }
}

impl Subject for HeapSubject {
    type AllocError = HeapError;

    fn allocate(&mut self, size: usize) -> Result<Option<NonNull<[u8]>>, Self::AllocError> {
        let Some(ptr) = self.0.allocate(size)? else {
            return Ok(None);
        };

        // Safe unwrap: the pointer was just returned by this heap.
        let usable = unsafe { self.0.usable_size(ptr) }.unwrap();
        assert!(usable >= size);

        Ok(Some(NonNull::slice_from_raw_parts(ptr, usable)))
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Self::AllocError> {
        unsafe { self.0.deallocate(ptr) }
    }

    fn check(&self, outstanding: usize) -> bool {
        // A page with no allocated object is reclaimed as soon as its last
        // object is freed, so every recorded page holds at least one block.
        self.0.stats().object_pages <= outstanding
    }
}
