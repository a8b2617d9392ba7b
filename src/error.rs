use core::fmt;

/// The error type for heap operations.
///
/// These are also the kinds reported by the process-wide heap's `get_error`,
/// where the absence of an error is represented by `None`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeapError {
    /// The heap was initialized a second time without an intervening finish.
    AlreadyInitialized,

    /// An operation was attempted on a heap that has not been initialized.
    NotInitialized,

    /// The page source could not supply another page.
    OutOfMemory,

    /// The requested size exceeds the configured maximum object size.
    AllocationTooLarge,

    /// The pointer passed to `free` is null, foreign, or already free.
    CannotFree,

    /// The page source failed for a reason other than memory exhaustion.
    Platform,
}

impl HeapError {
    /// Returns the symbolic name of this error.
    pub const fn as_str(self) -> &'static str {
        match self {
            HeapError::AlreadyInitialized => "BUCKET_HEAP_ERROR_ALREADY_INIT",
            HeapError::NotInitialized => "BUCKET_HEAP_ERROR_NOT_INIT",
            HeapError::OutOfMemory => "BUCKET_HEAP_ERROR_NO_MEMORY",
            HeapError::AllocationTooLarge => "BUCKET_HEAP_ERROR_ALLOC_TOO_BIG",
            HeapError::CannotFree => "BUCKET_HEAP_ERROR_CANNOT_FREE",
            HeapError::Platform => "BUCKET_HEAP_ERROR_PLATFORM",
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HeapError::AlreadyInitialized => "heap is already initialized",
            HeapError::NotInitialized => "heap is not initialized",
            HeapError::OutOfMemory => "out of memory",
            HeapError::AllocationTooLarge => "allocation exceeds the maximum object size",
            HeapError::CannotFree => "pointer cannot be freed",
            HeapError::Platform => "page source failed",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HeapError {}

/// The error type for [`PageSource`](crate::PageSource) requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageError {
    /// The system has no memory left to back a new page.
    OutOfMemory,

    /// The request failed for another reason.
    ///
    /// `code` carries the platform error number where one is available.
    Platform {
        /// The platform error number, or zero if none was available.
        code: i32,
    },
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::OutOfMemory => f.write_str("out of memory"),
            PageError::Platform { code } => write!(f, "platform error (code {code})"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PageError {}

impl From<PageError> for HeapError {
    fn from(err: PageError) -> HeapError {
        match err {
            PageError::OutOfMemory => HeapError::OutOfMemory,
            PageError::Platform { .. } => HeapError::Platform,
        }
    }
}

/// Returns the symbolic name of `err`, or `BUCKET_HEAP_OK` for `None`.
pub const fn error_to_string(err: Option<HeapError>) -> &'static str {
    match err {
        Some(err) => err.as_str(),
        None => "BUCKET_HEAP_OK",
    }
}

/// A single pending error with read-and-clear semantics.
///
/// Recording an error overwrites whatever was pending; there is no queue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorCell {
    pending: Option<HeapError>,
}

impl ErrorCell {
    /// Creates a cell with no pending error.
    pub const fn new() -> ErrorCell {
        ErrorCell { pending: None }
    }

    /// Records `err`, replacing any pending error.
    pub fn record(&mut self, err: HeapError) {
        self.pending = Some(err);
    }

    /// Records the error of `res`, if any, and passes the value through.
    pub fn check<T>(&mut self, res: Result<T, HeapError>) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(e);
                None
            }
        }
    }

    /// Returns the pending error and clears it.
    pub fn take(&mut self) -> Option<HeapError> {
        self.pending.take()
    }

    /// Returns the pending error without clearing it.
    pub fn peek(&self) -> Option<HeapError> {
        self.pending
    }
}
