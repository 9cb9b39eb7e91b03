use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::memory::MemoryView;

/// A set of disjoint mapped regions. Any access not fully inside one region faults.
///
/// Every successful or attempted write is recorded, so callers can assert that a
/// rejected operation left memory untouched.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    regions: BTreeMap<u64, Vec<u8>>,
    writes: Vec<(u64, usize)>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`. Fails if the new region overlaps an existing one.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::config(format!("Region at 0x{:X} is empty", base)));
        }
        // Inclusive last address, so a region may end exactly at the top of the
        // address space.
        let last = base
            .checked_add(bytes.len() as u64 - 1)
            .ok_or(Error::Overflow {
                base,
                delta: bytes.len() as i64,
            })?;

        for (&start, existing) in &self.regions {
            let existing_last = start + (existing.len() as u64 - 1);
            if base <= existing_last && start <= last {
                return Err(Error::Overlap {
                    first_start: start,
                    first_end: existing_last.saturating_add(1),
                    second_start: base,
                    second_end: last.saturating_add(1),
                });
            }
        }

        self.regions.insert(base, bytes);
        Ok(())
    }

    /// Map `size` zero bytes at `base`.
    pub fn map_zeroed(&mut self, base: u64, size: usize) -> Result<()> {
        self.map(base, vec![0; size])
    }

    pub fn regions(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.regions.iter().map(|(&base, bytes)| (base, bytes.as_slice()))
    }

    /// Every write attempted through [`MemoryView::write_bytes`], as `(address, size)`.
    pub fn writes(&self) -> &[(u64, usize)] {
        &self.writes
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    fn locate(&self, address: u64, size: usize) -> Result<(u64, usize)> {
        let fault = || Error::Fault { address, size };
        let (&base, bytes) = self.regions.range(..=address).next_back().ok_or_else(fault)?;

        let start = (address - base) as usize;
        let end = start.checked_add(size).ok_or_else(fault)?;
        if end > bytes.len() {
            return Err(fault());
        }
        Ok((base, start))
    }
}

impl MemoryView for SparseMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let (base, start) = self.locate(address, size)?;
        let region = &self.regions[&base];
        Ok(region[start..start + size].to_vec())
    }

    fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.writes.push((address, bytes.len()));
        let (base, start) = self.locate(address, bytes.len())?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(Error::Fault {
                address,
                size: bytes.len(),
            })?;
        region[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_read_write_inside_region() {
        let mut memory = SparseMemory::new();
        memory.map_zeroed(0x1000, 0x100).unwrap();

        memory.write_bytes(0x1010, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read_bytes(0x100F, 5).unwrap(), vec![0, 1, 2, 3, 0]);
        assert_eq!(memory.write_count(), 1);
        assert_eq!(memory.writes(), &[(0x1010, 3)]);
    }

    #[test]
    fn test_access_across_boundary_faults() {
        let mut memory = SparseMemory::new();
        memory.map_zeroed(0x1000, 0x10).unwrap();
        memory.map_zeroed(0x1010, 0x10).unwrap();

        assert_eq!(memory.read_bytes(0x100C, 8).unwrap_err().kind(), ErrorKind::Fault);
        assert_eq!(memory.read_bytes(0xFFF, 1).unwrap_err().kind(), ErrorKind::Fault);
        assert_eq!(memory.read_bytes(0x1020, 1).unwrap_err().kind(), ErrorKind::Fault);
        assert!(memory.write_bytes(0x101F, &[0, 0]).is_err());
    }

    #[test]
    fn test_overlapping_map_rejected() {
        let mut memory = SparseMemory::new();
        memory.map_zeroed(0x1000, 0x100).unwrap();
        assert_eq!(
            memory.map_zeroed(0x10F0, 0x20).unwrap_err().kind(),
            ErrorKind::Overlap
        );
        assert_eq!(memory.map_zeroed(0xF00, 0x101).unwrap_err().kind(), ErrorKind::Overlap);
        memory.map_zeroed(0x1100, 0x10).unwrap();
    }

    #[test]
    fn test_region_at_top_of_address_space() {
        let mut memory = SparseMemory::new();
        memory.map_zeroed(u64::MAX - 0xF, 0x10).unwrap();
        memory.write_bytes(u64::MAX - 1, &[0xAA, 0xBB]).unwrap();
        assert_eq!(memory.read_bytes(u64::MAX, 1).unwrap(), vec![0xBB]);

        assert_eq!(
            memory.map_zeroed(u64::MAX - 0x1F, 0x11).unwrap_err().kind(),
            ErrorKind::Overlap
        );
        memory.map_zeroed(u64::MAX - 0x1F, 0x10).unwrap();
        assert_eq!(
            memory.map_zeroed(u64::MAX, 2).unwrap_err().kind(),
            ErrorKind::Overflow
        );
    }

    #[test]
    fn test_typed_reads() {
        let mut memory = SparseMemory::new();
        let mut bytes = vec![0u8; 0x20];
        bytes[0..4].copy_from_slice(&(-2i32).to_le_bytes());
        bytes[8..16].copy_from_slice(&0xFFFF_FFFF_8100_0000u64.to_le_bytes());
        bytes[16..20].copy_from_slice(b"abc\0");
        memory.map(0x2000, bytes).unwrap();

        assert_eq!(memory.read_i32(0x2000).unwrap(), -2);
        assert_eq!(memory.read_u64(0x2008).unwrap(), 0xFFFF_FFFF_8100_0000);
        assert_eq!(memory.read_c_string(0x2010, 16).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(memory.read_c_string(0x2010, 2).unwrap(), None);
    }
}
