//! A bucket allocator that manages its own pages.
//!
//! A [`Heap`] serves variable-size requests from a chain of size classes. The
//! largest class serves objects of the configured maximum size and every class
//! after it serves objects half as large, down to the configured minimum.
//! A request is served by the class it fits in while using more than half of
//! the slot, so no allocation wastes more than half of its object.
//!
//! ```text
//!   chain page                        object pages
//!   ┌────────────┐   free list
//!   │ 8192 bytes │──► [obj]─►[obj]─►[obj]          (page A)
//!   ├────────────┤
//!   │ 4096 bytes │──► (empty)
//!   ├────────────┤
//!   │ 2048 bytes │──► [obj]─►[obj] ─► [obj]─►[obj] (pages B, C)
//!   ├────────────┤
//!   │    ...     │
//!   └────────────┘
//!
//!   ledger pages: [A, B, C, ...] ─► [...]
//! ```
//!
//! Pages come from a [`PageSource`]: [`Mmap`] maps them directly from the
//! operating system, [`Global`] takes them from the global allocator. Every
//! object page is recorded in a ledger so the heap can release it when it is
//! dropped. Free lists are kept in address order, which lets the heap notice
//! when every object of a page is free and return that page to its source
//! immediately.
//!
//! The [`global`] module wraps a single process-wide heap in C-style free
//! functions with a pending-error query, and provides a [`GlobalAlloc`]
//! implementation over it.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                      |
//! |--------------------------|-----------|---------------------------------|
//! | Allocate                 | O(1)      | O(classes + ledger pages)       |
//! | Deallocate               | O(1)      | O(free objects + ledger pages)  |
//!
//! #### Fragmentation
//!
//! Objects are at most twice the size of the request they serve, except for
//! requests smaller than half the minimum object size. Each object carries a
//! header of [`OBJECT_HEADER_SIZE`] bytes.
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc

#![doc(html_root_url = "https://docs.rs/bucket_heap/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
// This is necessary to allow `sptr` and `polyfill` to shadow methods that have
// since been added to the standard library.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bucket;
mod config;
mod error;
mod heap;
mod ledger;
mod page;
mod polyfill;

#[cfg(all(unix, feature = "std"))]
pub mod global;


pub use crate::{
    base::{OBJECT_HEADER_SIZE, PAYLOAD_ALIGN},
    config::{ConfigError, HeapConfig, SMALL_PAGE_SIZE},
    error::{error_to_string, ErrorCell, HeapError, PageError},
    heap::{Heap, HeapStats},
    page::{PageKind, PageSource},
};

#[cfg(feature = "alloc")]
pub use crate::page::Global;

#[cfg(all(unix, feature = "std"))]
pub use crate::page::Mmap;
