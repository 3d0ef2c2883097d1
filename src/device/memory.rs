//! # In-Memory Device
//!
//! Backing storage for the in-memory environment mode: one growable byte
//! buffer behind a lock. Flush is a no-op; the data dies with the
//! environment, which is the point of the mode.

use eyre::Result;
use parking_lot::RwLock;

use crate::error::{typed, StoreError};

use super::Device;

pub struct MemoryDevice {
    buf: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self {
            buf: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for MemoryDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.buf.read();
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(typed(
                StoreError::Io,
                format!(
                    "read of {} bytes at offset {offset} beyond buffer end {}",
                    buf.len(),
                    data.len()
                ),
            ));
        }
        buf.copy_from_slice(&data[offset as usize..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.buf.write();
        let end = offset as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn alloc_page(&self, page_size: u32) -> Result<u64> {
        let mut data = self.buf.write();
        let address = data.len() as u64;
        let new_len = data.len() + page_size as usize;
        data.resize(new_len, 0);
        Ok(address)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut data = self.buf.write();
        data.truncate(len as usize);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.buf.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let device = MemoryDevice::new();
        assert!(device.is_empty().unwrap());
    }

    #[test]
    fn write_extends_buffer() {
        let device = MemoryDevice::new();
        device.write(100, &[1, 2, 3]).unwrap();
        assert_eq!(device.len().unwrap(), 103);

        let mut buf = [0u8; 3];
        device.read(100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn holes_read_as_zero() {
        let device = MemoryDevice::new();
        device.write(64, &[9]).unwrap();

        let mut buf = [0xFFu8; 8];
        device.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn read_past_end_fails() {
        let device = MemoryDevice::new();
        device.alloc_page(1024).unwrap();

        let mut buf = [0u8; 16];
        assert!(device.read(1020, &mut buf).is_err());
    }
}
