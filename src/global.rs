//! The process-wide heap.
//!
//! This module keeps a single [`Heap`] in a global, guarded by a spin lock, and
//! exposes it through free functions. Failures are recorded in a pending error
//! that [`get_error`] reads and clears, so callers that only look at the
//! returned pointer can still find out why an allocation failed.
//!
//! ```no_run
//! use bucket_heap::global;
//!
//! global::init().unwrap();
//!
//! let p = global::alloc(100);
//! assert!(!p.is_null());
//! unsafe { global::free(p) };
//!
//! assert_eq!(global::get_error(), None);
//! global::finish().unwrap();
//! ```
//!
//! Every operation holds the lock for its whole duration. A logger that
//! allocates through [`BucketHeap`] must not be installed while `trace`-level
//! records from this crate are enabled, or the allocation will deadlock on the
//! lock it is already holding.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::Mutex;

pub use crate::error::error_to_string;
use crate::{
    base::PAYLOAD_ALIGN, error::ErrorCell, page::Mmap, Heap, HeapConfig, HeapError, HeapStats,
};

static HEAP: Mutex<Option<Heap<Mmap>>> = Mutex::new(None);

// Kept apart from `HEAP` so that errors raised while uninitialized are still
// recorded. Always locked after `HEAP`, never before.
static ERROR: Mutex<ErrorCell> = Mutex::new(ErrorCell::new());

/// Initializes the process-wide heap with [`HeapConfig::DEFAULT`].
///
/// # Errors
///
/// Returns [`HeapError::AlreadyInitialized`] if the heap is already
/// initialized, or the page source error if the initial pages could not be
/// mapped. The error is also recorded for [`get_error`].
pub fn init() -> Result<(), HeapError> {
    init_with(HeapConfig::DEFAULT)
}

/// Initializes the process-wide heap with `config`.
///
/// # Errors
///
/// See [`init`].
pub fn init_with(config: HeapConfig) -> Result<(), HeapError> {
    let mut heap = HEAP.lock();

    let res = match *heap {
        Some(_) => Err(HeapError::AlreadyInitialized),
        None => Heap::try_new(config),
    };

    match res {
        Ok(h) => {
            *heap = Some(h);
            Ok(())
        }
        Err(e) => {
            ERROR.lock().record(e);
            Err(e)
        }
    }
}

/// Releases every page held by the process-wide heap.
///
/// Pointers returned by [`alloc`] are invalidated. The heap may be initialized
/// again afterwards.
///
/// # Errors
///
/// Returns [`HeapError::NotInitialized`] if the heap is not initialized. The
/// error is also recorded for [`get_error`].
pub fn finish() -> Result<(), HeapError> {
    let mut heap = HEAP.lock();

    match heap.take() {
        Some(h) => {
            h.finish();
            Ok(())
        }
        None => {
            ERROR.lock().record(HeapError::NotInitialized);
            Err(HeapError::NotInitialized)
        }
    }
}

/// Allocates at least `size` bytes from the process-wide heap.
///
/// Returns null if `size` is zero or the allocation failed. In the latter case
/// the reason is recorded for [`get_error`].
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    let mut heap = HEAP.lock();

    let res = match heap.as_mut() {
        Some(h) => h.allocate(size),
        None => Err(HeapError::NotInitialized),
    };

    match ERROR.lock().check(res) {
        Some(Some(p)) => p.as_ptr(),
        _ => ptr::null_mut(),
    }
}

/// Returns the block at `ptr` to the process-wide heap.
///
/// A null `ptr`, or one detectably not allocated by the heap, records
/// [`HeapError::CannotFree`] and has no other effect. This holds whether or
/// not the heap is initialized.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by [`alloc`] that has not been
/// freed since, and the heap must not have been finished in between.
pub unsafe fn free(ptr: *mut u8) {
    let mut heap = HEAP.lock();

    let res = match (heap.as_mut(), NonNull::new(ptr)) {
        (_, None) => Err(HeapError::CannotFree),
        (None, Some(_)) => Err(HeapError::NotInitialized),
        (Some(h), Some(p)) => unsafe { h.deallocate(p) },
    };

    ERROR.lock().check(res);
}

/// Returns the pending error and clears it.
pub fn get_error() -> Option<HeapError> {
    ERROR.lock().take()
}

/// Returns the occupancy of the process-wide heap, or `None` if it is not
/// initialized.
pub fn stats() -> Option<HeapStats> {
    HEAP.lock().as_ref().map(Heap::stats)
}

/// A [`GlobalAlloc`] implementation over the process-wide heap.
///
/// The heap must be initialized with [`init`] before the first allocation;
/// until then every allocation fails. Layouts aligned to more than
/// [`PAYLOAD_ALIGN`] bytes are not supported and fail as well.
#[derive(Copy, Clone, Debug, Default)]
pub struct BucketHeap;

unsafe impl GlobalAlloc for BucketHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        unsafe { free(ptr) }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::{Mutex as StdMutex, MutexGuard};

    use super::*;

    // The heap is process-wide, so tests touching it must not interleave.
    static SERIAL: StdMutex<()> = StdMutex::new(());

    fn fresh() -> MutexGuard<'static, ()> {
        let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let _ = finish();
        let _ = get_error();
        guard
    }

    fn small() -> HeapConfig {
        HeapConfig::new(crate::SMALL_PAGE_SIZE, 16, 1024).unwrap()
    }

    #[test]
    fn lifecycle_errors_are_recorded() {
        let _serial = fresh();

        assert_eq!(finish(), Err(HeapError::NotInitialized));
        assert_eq!(get_error(), Some(HeapError::NotInitialized));
        assert_eq!(get_error(), None);

        init().unwrap();
        assert_eq!(init(), Err(HeapError::AlreadyInitialized));
        assert_eq!(get_error(), Some(HeapError::AlreadyInitialized));

        finish().unwrap();
        assert_eq!(get_error(), None);
        assert_eq!(stats(), None);
    }

    #[test]
    fn reinitialization_starts_fresh() {
        let _serial = fresh();

        init_with(small()).unwrap();
        for _ in 0..10 {
            assert!(!alloc(100).is_null());
        }
        finish().unwrap();

        init_with(small()).unwrap();
        let s = stats().unwrap();
        assert_eq!(s.object_pages, 0);
        assert_eq!(s.size_classes, 1);
        finish().unwrap();
    }

    #[test]
    fn uninitialized_operations_fail() {
        let _serial = fresh();

        assert!(alloc(10).is_null());
        assert_eq!(get_error(), Some(HeapError::NotInitialized));

        let mut byte = 0u8;
        unsafe { free(&mut byte) };
        assert_eq!(get_error(), Some(HeapError::NotInitialized));
    }

    #[test]
    fn argument_checks_precede_initialization_checks() {
        let _serial = fresh();

        assert!(alloc(0).is_null());
        assert_eq!(get_error(), None);

        unsafe { free(ptr::null_mut()) };
        assert_eq!(get_error(), Some(HeapError::CannotFree));
        assert_eq!(stats(), None);
    }

    #[test]
    fn allocation_outcomes() {
        let _serial = fresh();
        init_with(small()).unwrap();
        let max = small().max_object_size();

        assert!(alloc(0).is_null());
        assert_eq!(get_error(), None);

        assert!(alloc(max + 1).is_null());
        assert_eq!(get_error(), Some(HeapError::AllocationTooLarge));

        let big = alloc(max);
        assert!(!big.is_null());
        assert_eq!(get_error(), None);
        unsafe { big.write_bytes(0x5A, max) };

        unsafe { free(ptr::null_mut()) };
        assert_eq!(get_error(), Some(HeapError::CannotFree));
        assert_eq!(unsafe { *big.add(max - 1) }, 0x5A);

        unsafe { free(big) };
        assert_eq!(get_error(), None);

        finish().unwrap();
    }

    #[test]
    fn freed_address_is_reused() {
        let _serial = fresh();
        init().unwrap();

        let p1 = alloc(10);
        let p2 = alloc(10);
        assert_ne!(p1, p2);

        unsafe { free(p1) };
        let p3 = alloc(10);
        assert_eq!(p3, p1);
        assert_eq!(get_error(), None);

        finish().unwrap();
    }

    #[test]
    fn emptied_pages_are_returned() {
        let _serial = fresh();
        let config = small();
        init_with(config).unwrap();

        let per_page = config.objects_per_page(256);
        let blocks: std::vec::Vec<_> = (0..per_page).map(|_| alloc(200)).collect();
        assert_eq!(stats().unwrap().object_pages, 1);

        for &p in blocks.iter().rev() {
            unsafe { free(p) };
        }
        assert_eq!(stats().unwrap().object_pages, 0);
        assert_eq!(get_error(), None);

        finish().unwrap();
    }

    #[test]
    fn global_alloc_respects_alignment_limit() {
        let _serial = fresh();
        init().unwrap();

        unsafe {
            let layout = Layout::from_size_align(48, PAYLOAD_ALIGN).unwrap();
            let p = BucketHeap.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % PAYLOAD_ALIGN, 0);
            BucketHeap.dealloc(p, layout);

            let over = Layout::from_size_align(48, 4 * PAYLOAD_ALIGN).unwrap();
            assert!(BucketHeap.alloc(over).is_null());
        }

        finish().unwrap();
    }

    #[test]
    fn error_names() {
        assert_eq!(error_to_string(None), "BUCKET_HEAP_OK");
        assert_eq!(
            error_to_string(Some(HeapError::AllocationTooLarge)),
            "BUCKET_HEAP_ERROR_ALLOC_TOO_BIG"
        );
    }
}
