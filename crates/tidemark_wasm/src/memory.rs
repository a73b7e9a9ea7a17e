//! Page-granular linear memory.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use tidemark_core::memory::check_range;
use tidemark_core::{GuestMemory, MemoryError};

/// WASM page size in bytes
pub const PAGE_SIZE: u64 = 65536;

/// Memory limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Maximum memory in bytes
    pub max_bytes: u64,
    /// Initial memory in bytes
    pub initial_bytes: u64,
    /// Maximum number of pages
    pub max_pages: u64,
}

impl MemoryLimit {
    /// Create a new memory limit
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        let max_pages = max_bytes.div_ceil(PAGE_SIZE);
        Self {
            max_bytes,
            initial_bytes: max_bytes.min(PAGE_SIZE),
            max_pages,
        }
    }

    /// Create with a page count
    #[must_use]
    pub fn with_pages(max_pages: u64) -> Self {
        Self {
            max_bytes: max_pages * PAGE_SIZE,
            initial_bytes: PAGE_SIZE,
            max_pages,
        }
    }

    /// Set the initial size in pages
    #[must_use]
    pub fn with_initial_pages(mut self, pages: u64) -> Self {
        self.initial_bytes = pages * PAGE_SIZE;
        self
    }

    /// Convert bytes to pages
    #[must_use]
    pub fn bytes_to_pages(&self, bytes: u64) -> u64 {
        bytes.div_ceil(PAGE_SIZE)
    }

    /// Check if page count is within limit
    #[must_use]
    pub fn pages_within_limit(&self, pages: u64) -> bool {
        pages <= self.max_pages && pages * PAGE_SIZE <= u64::from(u32::MAX) + 1
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024) // 16MB default
    }
}

/// Growable guest linear memory
#[derive(Debug)]
pub struct LinearMemory {
    bytes: RefCell<Vec<u8>>,
    limit: MemoryLimit,
}

impl LinearMemory {
    /// Allocate the initial pages of `limit`
    ///
    /// # Errors
    ///
    /// Returns error if the initial size exceeds the limit
    pub fn new(limit: MemoryLimit) -> Result<Self, MemoryError> {
        let pages = limit.bytes_to_pages(limit.initial_bytes);
        if !limit.pages_within_limit(pages) {
            return Err(MemoryError::LimitExceeded {
                requested: pages * PAGE_SIZE,
                limit: limit.max_bytes,
            });
        }
        Ok(Self {
            bytes: RefCell::new(vec![0; (pages * PAGE_SIZE) as usize]),
            limit,
        })
    }

    /// Current size in pages
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.bytes.borrow().len() as u64 / PAGE_SIZE
    }

    /// Grow by `delta` pages, returning the previous page count
    ///
    /// # Errors
    ///
    /// Returns error if the new size exceeds the limit
    pub fn grow(&self, delta: u64) -> Result<u64, MemoryError> {
        let old = self.pages();
        let new = old + delta;
        if !self.limit.pages_within_limit(new) {
            return Err(MemoryError::LimitExceeded {
                requested: new * PAGE_SIZE,
                limit: self.limit.max_bytes,
            });
        }
        self.bytes.borrow_mut().resize((new * PAGE_SIZE) as usize, 0);
        Ok(old)
    }

    /// The configured limit
    #[must_use]
    pub fn limit(&self) -> &MemoryLimit {
        &self.limit
    }

    /// Copy of `[address, address + len)`
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    pub fn read_vec(&self, address: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0; len];
        self.read(address, &mut buf)?;
        Ok(buf)
    }
}

impl GuestMemory for LinearMemory {
    fn size(&self) -> u32 {
        u32::try_from(self.bytes.borrow().len()).unwrap_or(u32::MAX)
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.borrow();
        let range = check_range(address, buf.len(), self.size())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        let range = check_range(address, data.len(), self.size())?;
        self.bytes.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }
}
