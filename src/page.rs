//! Page sources.
//!
//! A [`PageSource`] is the only part of the heap that talks to the operating
//! system. The heap requests two kinds of pages from it: a single small page
//! holding the size-class chain, and configured-size pages for objects and the
//! page ledger.
//!
//! On targets other than unix, use [`Global`] as the page source.

use core::ptr::NonNull;

use crate::{config::SMALL_PAGE_SIZE, error::PageError, HeapConfig};

#[cfg(feature = "alloc")]
use core::alloc::Layout;

/// The two sizes of page the heap requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// A [`SMALL_PAGE_SIZE`] page holding the size-class chain.
    Chain,

    /// A page of the configured page size, holding objects or ledger entries.
    Object,
}

impl PageKind {
    /// Returns the length in bytes of a page of this kind under `config`.
    #[inline]
    pub const fn bytes(self, config: &HeapConfig) -> usize {
        match self {
            PageKind::Chain => SMALL_PAGE_SIZE,
            PageKind::Object => config.page_size(),
        }
    }
}

/// Types which supply the heap with pages of raw memory.
///
/// # Safety
///
/// Implementors must guarantee that every page returned by `alloc_page`:
/// - is valid for reads and writes for `len` bytes until it is passed to
///   `free_page`,
/// - is aligned to at least [`SMALL_PAGE_SIZE`] bytes, and
/// - does not overlap any other page that has not been freed.
pub unsafe trait PageSource {
    /// Obtains a page of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::OutOfMemory`] if the system cannot back another
    /// page, or [`PageError::Platform`] if the request failed for any other
    /// reason.
    fn alloc_page(&mut self, len: usize) -> Result<NonNull<u8>, PageError>;

    /// Releases a page obtained from `alloc_page`.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by `self.alloc_page(len)` with the same
    /// `len`, and must not have been freed since.
    unsafe fn free_page(&mut self, page: NonNull<u8>, len: usize);
}

/// Pages mapped directly from the operating system with `mmap(2)`.
#[cfg(all(unix, feature = "std"))]
#[derive(Copy, Clone, Debug, Default)]
pub struct Mmap;

#[cfg(all(unix, feature = "std"))]
unsafe impl PageSource for Mmap {
    fn alloc_page(&mut self, len: usize) -> Result<NonNull<u8>, PageError> {
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            let code = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or_default();

            if code == libc::ENOMEM {
                log::debug!("mmap of {len} bytes: out of memory");
                return Err(PageError::OutOfMemory);
            }

            log::error!("mmap of {len} bytes failed with errno {code}");
            return Err(PageError::Platform { code });
        }

        log::trace!("mapped {len} bytes at {raw:p}");

        NonNull::new(raw.cast::<u8>()).ok_or(PageError::Platform { code: 0 })
    }

    unsafe fn free_page(&mut self, page: NonNull<u8>, len: usize) {
        let res = unsafe { libc::munmap(page.as_ptr().cast(), len) };

        if res != 0 {
            let err = std::io::Error::last_os_error();
            log::warn!("munmap of {len} bytes at {page:p} failed: {err}");
        } else {
            log::trace!("unmapped {len} bytes at {page:p}");
        }
    }
}

/// Pages allocated from the global memory allocator.
///
/// Useful where `mmap` is unavailable, and for testing.
#[cfg(feature = "alloc")]
#[derive(Copy, Clone, Debug, Default)]
pub struct Global;

#[cfg(feature = "alloc")]
impl Global {
    fn layout(len: usize) -> Result<Layout, PageError> {
        Layout::from_size_align(len, SMALL_PAGE_SIZE).map_err(|_| PageError::Platform { code: 0 })
    }
}

#[cfg(feature = "alloc")]
unsafe impl PageSource for Global {
    fn alloc_page(&mut self, len: usize) -> Result<NonNull<u8>, PageError> {
        if len == 0 {
            return Err(PageError::Platform { code: 0 });
        }

        let layout = Self::layout(len)?;

        // SAFETY: layout size is not zero
        let raw = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(PageError::OutOfMemory)
    }

    unsafe fn free_page(&mut self, page: NonNull<u8>, len: usize) {
        // Safe unwrap: the same layout was constructed successfully when the
        // page was allocated.
        let layout = Self::layout(len).unwrap();

        unsafe { alloc::alloc::dealloc(page.as_ptr(), layout) };
    }
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;

    fn exercise<S: PageSource>(source: &mut S, len: usize) {
        let page = source.alloc_page(len).unwrap();
        assert_eq!(page.as_ptr() as usize % SMALL_PAGE_SIZE, 0);

        unsafe {
            core::ptr::write_bytes(page.as_ptr(), 0xA5, len);
            assert_eq!(*page.as_ptr().add(len - 1), 0xA5);
            source.free_page(page, len);
        }
    }

    #[test]
    fn page_kinds_follow_config() {
        let config = HeapConfig::new(4 * SMALL_PAGE_SIZE, 16, 1024).unwrap();

        assert_eq!(PageKind::Chain.bytes(&config), SMALL_PAGE_SIZE);
        assert_eq!(PageKind::Object.bytes(&config), 4 * SMALL_PAGE_SIZE);
    }

    #[test]
    fn global_pages_are_usable() {
        exercise(&mut Global, SMALL_PAGE_SIZE);
        exercise(&mut Global, 16 * SMALL_PAGE_SIZE);
    }

    #[test]
    fn global_rejects_empty_pages() {
        assert_eq!(
            Global.alloc_page(0),
            Err(PageError::Platform { code: 0 })
        );
    }

    #[cfg(all(unix, feature = "std"))]
    #[test]
    fn mmap_pages_are_usable() {
        exercise(&mut Mmap, SMALL_PAGE_SIZE);
        exercise(&mut Mmap, 16 * SMALL_PAGE_SIZE);
    }

    #[cfg(all(unix, feature = "std"))]
    #[test]
    fn mmap_reports_platform_errors() {
        // A zero-length mapping is rejected with EINVAL.
        assert_eq!(
            Mmap.alloc_page(0),
            Err(PageError::Platform {
                code: libc::EINVAL
            })
        );
    }
}
