//! In-page headers and the pointer arithmetic that relates them.
//!
//! Every header the heap keeps lives inside memory obtained from a
//! [`PageSource`](crate::PageSource). This module defines those headers and is
//! the only place that converts between header and payload pointers or steps
//! from one slot to the next.
//!
//! ```text
//!   Object page (page_size bytes):
//!
//!   ┌────────┬──────────────┬────────┬──────────────┬─────┬───────┐
//!   │ Object │   payload    │ Object │   payload    │ ... │ slack │
//!   │ header │ object_size  │ header │ object_size  │     │       │
//!   └────────┴──────────────┴────────┴──────────────┴─────┴───────┘
//!   ▲        ▲
//!   │        └── pointer returned to the caller
//!   └── boundary object (page start)
//! ```

use core::{
    mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::polyfill::{NonNullStrict, Strict};

/// Size of the header that precedes every object payload.
pub const OBJECT_HEADER_SIZE: usize = mem::size_of::<Object>();

/// Alignment guaranteed for every payload returned by the heap.
pub const PAYLOAD_ALIGN: usize = mem::align_of::<Object>();

/// Size of the header at the start of each ledger page.
pub const LEDGER_HEADER_SIZE: usize = mem::size_of::<LedgerPage>();

/// Size of a single ledger entry.
pub const LEDGER_ENTRY_SIZE: usize = mem::size_of::<NonNull<u8>>();

/// Size of a bucket header in the chain page.
pub const BUCKET_HEADER_SIZE: usize = mem::size_of::<Bucket>();

// Links are stored as pointers rather than bare addresses: every page comes
// from a separate request to the page source, so a link may cross into a
// different allocation and must carry that allocation's provenance.

/// The header of an object slot.
///
/// While the object is free, `next` links it into its bucket's free list. While
/// it is allocated, only `bucket` and `boundary` are meaningful; `next` is left
/// stale and must not be followed.
#[repr(C)]
pub struct Object {
    pub next: Option<NonNull<Object>>,
    pub bucket: NonNull<Bucket>,
    pub boundary: bool,
}

/// The header of a size class.
#[repr(C)]
pub struct Bucket {
    pub next: Option<NonNull<Bucket>>,
    pub object_size: usize,
    pub head: Option<NonNull<Object>>,
}

/// The header of a ledger page, followed in memory by its entry array.
#[repr(C)]
pub struct LedgerPage {
    pub next: Option<NonNull<LedgerPage>>,
    pub count: usize,
}

/// Returns the distance between consecutive objects of `object_size` bytes.
#[inline]
pub const fn stride(object_size: usize) -> usize {
    object_size + OBJECT_HEADER_SIZE
}

/// Returns the payload pointer of `obj`.
#[inline]
pub fn payload_of(obj: NonNull<Object>) -> NonNull<u8> {
    obj.cast::<u8>().map_addr(|addr| {
        // Headers never end at the top of the address space: a payload of at
        // least `PAYLOAD_ALIGN` bytes follows.
        NonZeroUsize::new(addr.get() + OBJECT_HEADER_SIZE).unwrap()
    })
}

/// Recovers the object header that precedes `payload`.
///
/// Returns `None` if `payload` is too close to the null address to have a
/// header in front of it.
#[inline]
pub fn object_of(payload: NonNull<u8>) -> Option<NonNull<Object>> {
    let header_addr = payload.addr().get().checked_sub(OBJECT_HEADER_SIZE)?;
    let header_addr = NonZeroUsize::new(header_addr)?;

    Some(payload.with_addr(header_addr).cast())
}

/// Returns the address one stride past `obj`.
#[inline]
pub fn addr_after(obj: NonNull<Object>, stride: usize) -> usize {
    obj.as_ptr().addr() + stride
}

/// Returns the page that `boundary` was carved from.
#[inline]
pub fn page_of_boundary(boundary: NonNull<Object>) -> NonNull<u8> {
    boundary.cast()
}

/// Writes the object headers for a freshly obtained page and links them
/// together in ascending address order.
///
/// Returns the first object of the page, which is flagged as the page boundary.
///
/// # Safety
///
/// The caller must uphold the following invariants:
/// - `page` must be valid for reads and writes for `page_size` bytes and
///   aligned to `PAYLOAD_ALIGN`.
/// - `page_size / stride` must be at least one.
/// - No other references to the memory at `page` may exist.
pub unsafe fn carve_page(
    page: NonNull<u8>,
    page_size: usize,
    stride: usize,
    bucket: NonNull<Bucket>,
) -> NonNull<Object> {
    let count = page_size / stride;
    debug_assert!(count > 0);
    debug_assert_eq!(page.as_ptr().addr() % PAYLOAD_ALIGN, 0);

    let base = page.as_ptr();
    for index in 0..count {
        let next = (index + 1 < count).then(|| {
            // SAFETY: (index + 1) * stride is within the page.
            unsafe { NonNull::new_unchecked(base.add((index + 1) * stride).cast::<Object>()) }
        });

        let obj = Object {
            next,
            bucket,
            boundary: index == 0,
        };

        unsafe { base.add(index * stride).cast::<Object>().write(obj) };
    }

    page.cast()
}

/// Writes an empty bucket header at `slot`.
///
/// # Safety
///
/// `slot` must be valid for writes of a `Bucket` and properly aligned.
pub unsafe fn init_bucket_at(slot: NonNull<Bucket>, object_size: usize) -> NonNull<Bucket> {
    unsafe {
        slot.as_ptr().write(Bucket {
            next: None,
            object_size,
            head: None,
        })
    };

    slot
}

/// Returns the header slot that directly follows `bucket` in the chain page.
///
/// # Safety
///
/// `bucket` must not be the last header that fits in the chain page.
pub unsafe fn bucket_after(bucket: NonNull<Bucket>) -> NonNull<Bucket> {
    unsafe { NonNull::new_unchecked(bucket.as_ptr().add(1)) }
}

/// Writes an empty ledger header at the start of `page`.
///
/// # Safety
///
/// `page` must be valid for writes of a `LedgerPage` and properly aligned.
pub unsafe fn init_ledger_page(page: NonNull<u8>) -> NonNull<LedgerPage> {
    let ledger = page.cast::<LedgerPage>();
    unsafe {
        ledger.as_ptr().write(LedgerPage {
            next: None,
            count: 0,
        })
    };

    ledger
}

/// Returns a pointer to the first entry of `ledger`.
///
/// # Safety
///
/// `ledger` must point to an initialized `LedgerPage` at the start of a page
/// large enough to hold at least one entry.
#[inline]
pub unsafe fn ledger_entries(ledger: NonNull<LedgerPage>) -> *mut NonNull<u8> {
    unsafe { ledger.as_ptr().add(1).cast() }
}

/// Returns the live entries of `ledger` as a mutable slice.
///
/// # Safety
///
/// `ledger` must point to an initialized `LedgerPage` whose first `count`
/// entries are initialized, and no other reference to those entries may exist
/// for `'a`.
#[inline]
pub unsafe fn ledger_live<'a>(ledger: NonNull<LedgerPage>) -> &'a mut [NonNull<u8>] {
    unsafe {
        let count = (*ledger.as_ptr()).count;
        &mut *ptr::slice_from_raw_parts_mut(ledger_entries(ledger), count)
    }
}
