use crate::error::{Error, Result};

/// Access to the target's memory.
///
/// The engine never dereferences raw pointers itself; every read and write goes
/// through this trait. Writes must be visible to subsequent reads through the
/// same view.
pub trait MemoryView {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<()>;

    fn read_u8(&self, address: u64) -> Result<u8> {
        let bytes = self.read_bytes(address, 1)?;
        bytes
            .first()
            .copied()
            .ok_or(Error::Fault { address, size: 1 })
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        let bytes = self.read_bytes(address, 4)?;
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Fault { address, size: 4 })?;
        Ok(i32::from_le_bytes(raw))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read_bytes(address, 8)?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Fault { address, size: 8 })?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    ///
    /// Reads byte by byte so a string ending right before an unmapped page is
    /// still readable. Returns `None` when no terminator is found in bounds.
    fn read_c_string(&self, address: u64, max_len: usize) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        for i in 0..max_len {
            let at = address
                .checked_add(i as u64)
                .ok_or(Error::Fault { address, size: i + 1 })?;
            match self.read_u8(at)? {
                0 => return Ok(Some(out)),
                b => out.push(b),
            }
        }
        Ok(None)
    }
}
