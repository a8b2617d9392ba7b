//! Heap configuration.

use core::fmt;

use crate::base::{
    stride, BUCKET_HEADER_SIZE, LEDGER_ENTRY_SIZE, LEDGER_HEADER_SIZE, PAYLOAD_ALIGN,
};

/// Size of the page that holds the size-class chain.
///
/// This is also the granularity the configured page size must be a multiple of.
pub const SMALL_PAGE_SIZE: usize = 0x1000;

/// The error returned when a [`HeapConfig`] cannot be satisfied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    reason: &'static str,
}

impl ConfigError {
    /// Returns a description of the violated constraint.
    pub const fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid heap configuration: {}", self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

const fn invalid(reason: &'static str) -> Result<HeapConfig, ConfigError> {
    Err(ConfigError { reason })
}

/// Page and object size limits for a [`Heap`](crate::Heap).
///
/// Size classes start at `max_object_size` and halve down to no less than
/// `min_object_size`. Every object page and ledger page is `page_size` bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    page_size: usize,
    min_object_size: usize,
    max_object_size: usize,
}

impl HeapConfig {
    /// 64 KiB pages serving objects from 16 bytes to 8 KiB.
    pub const DEFAULT: HeapConfig = HeapConfig {
        page_size: 64 * 1024,
        min_object_size: 16,
        max_object_size: 8 * 1024,
    };

    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `page_size` is zero or not a multiple of [`SMALL_PAGE_SIZE`].
    /// - `max_object_size` is not a power of two.
    /// - `min_object_size` is smaller than [`PAYLOAD_ALIGN`] or larger than
    ///   `max_object_size`.
    /// - An object of `max_object_size` bytes plus its header does not fit in
    ///   a page.
    pub const fn new(
        page_size: usize,
        min_object_size: usize,
        max_object_size: usize,
    ) -> Result<HeapConfig, ConfigError> {
        if page_size == 0 || page_size % SMALL_PAGE_SIZE != 0 {
            return invalid("page size must be a non-zero multiple of 4096");
        }

        if !max_object_size.is_power_of_two() {
            return invalid("maximum object size must be a power of two");
        }

        if min_object_size < PAYLOAD_ALIGN {
            return invalid("minimum object size is below the payload alignment");
        }

        if min_object_size > max_object_size {
            return invalid("minimum object size exceeds maximum object size");
        }

        match max_object_size.checked_add(stride(0)) {
            Some(s) if s <= page_size => (),
            _ => return invalid("a maximum-size object does not fit in a page"),
        }

        if LEDGER_HEADER_SIZE + LEDGER_ENTRY_SIZE > page_size {
            return invalid("a ledger entry does not fit in a page");
        }

        let config = HeapConfig {
            page_size,
            min_object_size,
            max_object_size,
        };

        if config.max_size_classes() * BUCKET_HEADER_SIZE > SMALL_PAGE_SIZE {
            return invalid("size classes do not fit in the chain page");
        }

        Ok(config)
    }

    /// Returns the size of object and ledger pages.
    #[inline]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the smallest object size a size class may serve.
    #[inline]
    pub const fn min_object_size(&self) -> usize {
        self.min_object_size
    }

    /// Returns the largest request the heap accepts.
    #[inline]
    pub const fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Returns the number of objects of `object_size` bytes carved from one page.
    #[inline]
    pub const fn objects_per_page(&self, object_size: usize) -> usize {
        self.page_size / stride(object_size)
    }

    /// Returns the number of page entries a single ledger page can hold.
    #[inline]
    pub const fn ledger_capacity(&self) -> usize {
        (self.page_size - LEDGER_HEADER_SIZE) / LEDGER_ENTRY_SIZE
    }

    /// Returns the number of size classes the chain can grow to.
    pub const fn max_size_classes(&self) -> usize {
        let mut classes = 1;
        let mut size = self.max_object_size;
        while size / 2 >= self.min_object_size {
            size /= 2;
            classes += 1;
        }

        classes
    }

    /// Returns the object size of the size class that serves `size`-byte
    /// requests.
    ///
    /// Returns `None` if `size` is zero or larger than the maximum object size.
    pub const fn size_class(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.max_object_size {
            return None;
        }

        let mut class = self.max_object_size;
        while !fits(size, class) && class / 2 >= self.min_object_size {
            class /= 2;
        }

        Some(class)
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig::DEFAULT
    }
}

/// Returns whether a `size`-byte request belongs in a slot of `object_size`
/// bytes: it must fit and use more than half of the slot.
#[inline]
pub(crate) const fn fits(size: usize, object_size: usize) -> bool {
    size <= object_size && size > object_size / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::base::OBJECT_HEADER_SIZE;

    #[test]
    fn default_is_valid() {
        let d = HeapConfig::DEFAULT;
        assert_eq!(
            HeapConfig::new(d.page_size(), d.min_object_size(), d.max_object_size()),
            Ok(d)
        );
    }

    #[test]
    fn rejects_bad_page_sizes() {
        HeapConfig::new(0, 16, 1024).unwrap_err();
        HeapConfig::new(SMALL_PAGE_SIZE + 1, 16, 1024).unwrap_err();
        HeapConfig::new(3 * SMALL_PAGE_SIZE, 16, 1024).unwrap();
    }

    #[test]
    fn rejects_bad_object_sizes() {
        HeapConfig::new(SMALL_PAGE_SIZE, 16, 1000).unwrap_err();
        HeapConfig::new(SMALL_PAGE_SIZE, 1, 1024).unwrap_err();
        HeapConfig::new(SMALL_PAGE_SIZE, 2048, 1024).unwrap_err();
        HeapConfig::new(SMALL_PAGE_SIZE, 16, SMALL_PAGE_SIZE).unwrap_err();
        HeapConfig::new(2 * SMALL_PAGE_SIZE, 16, SMALL_PAGE_SIZE).unwrap();
    }

    #[test]
    fn error_names_the_constraint() {
        let err = HeapConfig::new(SMALL_PAGE_SIZE, 16, 1000).unwrap_err();
        assert_eq!(err.reason(), "maximum object size must be a power of two");
    }

    #[test]
    fn objects_per_page_accounts_for_headers() {
        let config = HeapConfig::new(SMALL_PAGE_SIZE, 16, 1024).unwrap();

        assert_eq!(
            config.objects_per_page(64),
            SMALL_PAGE_SIZE / (64 + OBJECT_HEADER_SIZE)
        );
        assert_eq!(config.objects_per_page(1024), 3);
    }

    #[test]
    fn size_classes_halve_down_to_minimum() {
        let config = HeapConfig::new(SMALL_PAGE_SIZE, 16, 1024).unwrap();

        assert_eq!(config.max_size_classes(), 7);
        assert_eq!(config.size_class(0), None);
        assert_eq!(config.size_class(1025), None);
        assert_eq!(config.size_class(1024), Some(1024));
        assert_eq!(config.size_class(513), Some(1024));
        assert_eq!(config.size_class(512), Some(512));
        assert_eq!(config.size_class(10), Some(16));
        assert_eq!(config.size_class(1), Some(16));
    }

    #[test]
    fn every_size_gets_a_class_at_least_as_large() {
        let config = HeapConfig::new(SMALL_PAGE_SIZE, 24, 2048).unwrap();

        for size in 1..=config.max_object_size() {
            let class = config.size_class(size).unwrap();
            assert!(class >= size);
            assert!(class / 2 < size || class / 2 < config.min_object_size());
        }
    }
}
