//! Captured memory images for offline runs.
//!
//! An image is a JSON document listing mapped regions (bytes as hex strings) plus the
//! stack pointer observed when the trigger fired.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::SparseMemory;
use crate::pattern::{format_hex_bytes, parse_hex_bytes};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRegion {
    #[serde(with = "crate::hex::address")]
    pub base: u64,
    pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryImage {
    #[serde(with = "crate::hex::address")]
    pub stack_pointer: u64,
    pub regions: Vec<ImageRegion>,
}

impl MemoryImage {
    pub fn to_memory(&self) -> Result<SparseMemory> {
        let mut memory = SparseMemory::new();
        for region in &self.regions {
            let bytes = parse_hex_bytes(&region.bytes)
                .map_err(|e| e.in_entry(format!("region 0x{:X}", region.base)))?;
            memory.map(region.base, bytes)?;
        }
        Ok(memory)
    }

    pub fn from_memory(memory: &SparseMemory, stack_pointer: u64) -> Self {
        let regions = memory
            .regions()
            .map(|(base, bytes)| ImageRegion {
                base,
                bytes: format_hex_bytes(bytes),
            })
            .collect();

        Self {
            stack_pointer,
            regions,
        }
    }
}

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<MemoryImage> {
    let content = fs::read_to_string(&path)?;
    let image = serde_json::from_str(&content)?;
    Ok(image)
}

pub fn save_image<P: AsRef<Path>>(path: P, image: &MemoryImage) -> Result<()> {
    let content = serde_json::to_string_pretty(image)?;
    fs::write(path, content)?;
    Ok(())
}
