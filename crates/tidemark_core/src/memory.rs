//! Access to a guest's linear memory.

use crate::error::MemoryError;

/// Byte-addressable view of a guest's linear memory
///
/// Methods take `&self` because the memory is shared with a guest that may be
/// running further up the stack; implementations use interior mutability.
pub trait GuestMemory {
    /// Current size in bytes
    fn size(&self) -> u32;

    /// Copy `buf.len()` bytes starting at `address` into `buf`
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside linear memory
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Copy `bytes` into memory starting at `address`
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside linear memory
    fn write(&self, address: u32, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Read a little-endian `u32`
    ///
    /// # Errors
    ///
    /// Returns error if the four bytes are outside linear memory
    fn read_u32(&self, address: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Whether `[address, address + len)` lies inside linear memory
    fn contains(&self, address: u32, len: usize) -> bool {
        u64::from(address) + len as u64 <= u64::from(self.size())
    }
}

/// Bounds check shared by implementations
///
/// # Errors
///
/// Returns error if `[address, address + len)` does not fit in `size` bytes
pub fn check_range(address: u32, len: usize, size: u32) -> Result<std::ops::Range<usize>, MemoryError> {
    let start = address as usize;
    match start.checked_add(len) {
        Some(end) if end <= size as usize => Ok(start..end),
        _ => Err(MemoryError::OutOfBounds { address, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct VecMemory(RefCell<Vec<u8>>);

    impl GuestMemory for VecMemory {
        fn size(&self) -> u32 {
            self.0.borrow().len() as u32
        }

        fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
            let range = check_range(address, buf.len(), self.size())?;
            buf.copy_from_slice(&self.0.borrow()[range]);
            Ok(())
        }

        fn write(&self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
            let range = check_range(address, bytes.len(), self.size())?;
            self.0.borrow_mut()[range].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_read_u32_little_endian() {
        let mem = VecMemory(RefCell::new(vec![0; 8]));
        mem.write(4, &[0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(mem.read_u32(4).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_out_of_bounds() {
        let mem = VecMemory(RefCell::new(vec![0; 8]));
        assert!(mem.read_u32(6).is_err());
        assert!(mem.contains(4, 4));
        assert!(!mem.contains(5, 4));
        assert!(!mem.contains(u32::MAX, 2));
    }

    #[test]
    fn test_check_range() {
        assert_eq!(check_range(2, 3, 8).unwrap(), 2..5);
        assert!(matches!(
            check_range(7, 2, 8),
            Err(MemoryError::OutOfBounds { address: 7, len: 2, size: 8 })
        ));
    }
}
