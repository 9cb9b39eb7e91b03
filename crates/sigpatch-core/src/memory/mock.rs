//! Builder for synthetic memory layouts used in unit tests.

use crate::memory::{MemoryView, SparseMemory};

pub struct MockMemoryBuilder {
    memory: SparseMemory,
}

impl MockMemoryBuilder {
    pub fn new() -> Self {
        Self {
            memory: SparseMemory::new(),
        }
    }

    pub fn region(mut self, base: u64, size: usize) -> Self {
        self.memory.map_zeroed(base, size).expect("mock region overlaps");
        self
    }

    pub fn bytes(mut self, address: u64, bytes: &[u8]) -> Self {
        self.memory
            .write_bytes(address, bytes)
            .expect("mock bytes outside mapped region");
        self
    }

    /// Relative call/jump at `address` whose target is `target`.
    pub fn rel32(self, address: u64, opcode: u8, target: u64) -> Self {
        let disp = (target as i64 - (address as i64 + 5)) as i32;
        let mut insn = vec![opcode];
        insn.extend_from_slice(&disp.to_le_bytes());
        self.bytes(address, &insn)
    }

    /// Returns the memory with its write log cleared.
    pub fn build(self) -> SparseMemory {
        let mut fresh = SparseMemory::new();
        for (base, bytes) in self.memory.regions() {
            fresh.map(base, bytes.to_vec()).expect("regions are disjoint");
        }
        fresh
    }
}

impl Default for MockMemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
