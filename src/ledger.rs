//! The page ledger.
//!
//! Every object page the heap obtains is recorded here so that it can be
//! released when the heap is finished, and dropped from the record when it is
//! reclaimed. The ledger is itself a chain of pages, each holding a fixed
//! number of entries.

use core::{iter, ptr::NonNull};

use crate::{
    base::{init_ledger_page, ledger_entries, ledger_live, LedgerPage},
    error::HeapError,
    PageSource,
};

pub(crate) struct Ledger {
    head: NonNull<LedgerPage>,
    capacity: usize,
}

impl Ledger {
    /// Creates an empty ledger in `page`.
    ///
    /// # Safety
    ///
    /// `page` must be valid for reads and writes for the page size the ledger is
    /// used with, and `capacity` entries plus the ledger header must fit in it.
    pub unsafe fn new(page: NonNull<u8>, capacity: usize) -> Ledger {
        debug_assert!(capacity > 0);

        Ledger {
            head: unsafe { init_ledger_page(page) },
            capacity,
        }
    }

    fn pages(&self) -> impl Iterator<Item = NonNull<LedgerPage>> + '_ {
        iter::successors(Some(self.head), |ledger| unsafe { ledger.as_ref().next })
    }

    /// Records `page`, growing the ledger by one page from `source` if every
    /// ledger page is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger needs to grow and `source` cannot supply
    /// a page. In that case `page` is not recorded.
    pub fn record<S: PageSource>(
        &mut self,
        page: NonNull<u8>,
        source: &mut S,
        page_len: usize,
    ) -> Result<(), HeapError> {
        let mut current = self.head;

        loop {
            let ledger = unsafe { &mut *current.as_ptr() };
            if ledger.count < self.capacity {
                break;
            }

            current = match ledger.next {
                Some(next) => next,
                None => {
                    let fresh = source.alloc_page(page_len)?;
                    log::trace!("ledger grew into {fresh:p}");

                    let fresh = unsafe { init_ledger_page(fresh) };
                    ledger.next = Some(fresh);
                    fresh
                }
            };
        }

        unsafe {
            let count = (*current.as_ptr()).count;
            ledger_entries(current).add(count).write(page);
            (*current.as_ptr()).count = count + 1;
        }

        Ok(())
    }

    /// Removes `page` from the ledger.
    ///
    /// A ledger page other than the first that becomes empty is unlinked and
    /// returned to `source`. Returns `false` if `page` was not recorded.
    pub fn remove<S: PageSource>(
        &mut self,
        page: NonNull<u8>,
        source: &mut S,
        page_len: usize,
    ) -> bool {
        let mut prev: Option<NonNull<LedgerPage>> = None;
        let mut current = Some(self.head);

        while let Some(ledger) = current {
            let live = unsafe { ledger_live(ledger) };

            if let Some(idx) = live.iter().position(|&p| p == page) {
                let last = live.len() - 1;
                live.swap(idx, last);

                unsafe {
                    let header = &mut *ledger.as_ptr();
                    header.count = last;

                    if let (0, Some(prev)) = (header.count, prev) {
                        (*prev.as_ptr()).next = header.next;
                        log::trace!("ledger page {ledger:p} emptied");
                        source.free_page(ledger.cast(), page_len);
                    }
                }

                return true;
            }

            prev = Some(ledger);
            current = unsafe { ledger.as_ref().next };
        }

        false
    }

    /// Returns whether `page` is recorded.
    #[cfg(test)]
    pub fn contains(&self, page: NonNull<u8>) -> bool {
        self.pages()
            .any(|ledger| unsafe { ledger_live(ledger) }.contains(&page))
    }

    /// Returns the number of recorded pages.
    pub fn recorded(&self) -> usize {
        self.pages()
            .map(|ledger| unsafe { ledger.as_ref().count })
            .sum()
    }

    /// Returns the number of pages the ledger itself occupies.
    pub fn ledger_pages(&self) -> usize {
        self.pages().count()
    }

    /// Releases every recorded page, then every ledger page.
    ///
    /// # Safety
    ///
    /// Every recorded page and every ledger page must have been obtained from
    /// `source` with `page_len`. The ledger must not be used afterwards.
    pub unsafe fn release<S: PageSource>(&mut self, source: &mut S, page_len: usize) {
        let mut current = Some(self.head);

        while let Some(ledger) = current {
            unsafe {
                for &page in ledger_live(ledger).iter() {
                    source.free_page(page, page_len);
                }

                current = ledger.as_ref().next;
                source.free_page(ledger.cast(), page_len);
            }
        }
    }
}
