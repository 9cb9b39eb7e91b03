//! Scan command implementation.
//!
//! Walks every region of a captured image and prints the addresses where a
//! signature matches, which is how anchor and prologue patterns are tuned.

use std::path::Path;

use anyhow::{Context, Result};
use sigpatch_core::{MaskedPattern, SparseMemory, load_image};

/// Run the scan command
pub fn run(image: &Path, pattern: &str, limit: usize) -> Result<()> {
    let pattern = MaskedPattern::parse(pattern)?;
    let memory = load_image(image)
        .and_then(|image| image.to_memory())
        .with_context(|| format!("loading {}", image.display()))?;

    let matches = find_matches(&memory, &pattern, limit);
    println!("Signature: {}", pattern);
    for address in &matches {
        println!("  0x{:X}", address);
    }
    println!("{} match(es)", matches.len());
    Ok(())
}

pub(crate) fn find_matches(memory: &SparseMemory, pattern: &MaskedPattern, limit: usize) -> Vec<u64> {
    let mut found = Vec::new();
    for (base, bytes) in memory.regions() {
        if bytes.len() < pattern.len() {
            continue;
        }
        for offset in 0..=bytes.len() - pattern.len() {
            if found.len() >= limit {
                return found;
            }
            if pattern.matches(&bytes[offset..]) {
                found.push(base + offset as u64);
            }
        }
    }
    found
}
