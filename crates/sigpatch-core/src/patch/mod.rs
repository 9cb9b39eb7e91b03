//! Patch installation.
//!
//! [`PatchInstaller::install`] validates every placement, applies every fixup into a
//! scratch buffer and prepares the redirect before the first byte reaches memory. A
//! rejected request leaves the target untouched.

mod redirect;

use std::ops::Range;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::memory::MemoryView;
use crate::offset::ResolvedAddresses;
use crate::policy::AddressSpacePolicy;
use crate::template::{CodeTemplate, SiblingAddresses, TemplateId};

pub use redirect::{JUMP_LENGTH, Redirect};

/// One template and where it goes.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub template: &'a CodeTemplate,
    pub destination: u64,
}

impl Placement<'_> {
    fn end(&self, policy: &AddressSpacePolicy) -> Result<u64> {
        policy.offset(self.destination, self.template.len())
    }
}

/// Lay `templates` out back to back so that the last one ends exactly at `anchor`.
///
/// This is the usual way to find room for a patch: code that precedes an anchor
/// on the current call path has already executed and will not run again.
pub fn place_before<'a>(
    policy: &AddressSpacePolicy,
    anchor: u64,
    templates: &[&'a CodeTemplate],
) -> Result<Vec<Placement<'a>>> {
    let total = templates
        .iter()
        .try_fold(0usize, |acc, t| acc.checked_add(t.len()))
        .ok_or(Error::Overflow {
            base: anchor,
            delta: i64::MIN,
        })?;
    let mut destination = policy.offset_back(anchor, total)?;

    let mut placements = Vec::with_capacity(templates.len());
    for &template in templates {
        placements.push(Placement {
            template,
            destination,
        });
        destination = policy.offset(destination, template.len())?;
    }
    Ok(placements)
}

/// Everything one installation pass writes.
#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    /// Templates in placement order. The redirect targets the entry of the last one.
    pub placements: Vec<Placement<'a>>,
    /// Every placement must end at or below this address.
    pub boundary: u64,
    pub redirect: Redirect,
    /// Ranges written by earlier passes. Neither the placements nor the redirect
    /// may touch them.
    pub reserved: Vec<Range<u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPatch {
    pub template: TemplateId,
    #[serde(with = "crate::hex::address")]
    pub destination: u64,
    pub template_len: usize,
    #[serde(with = "crate::hex::address")]
    pub entry: u64,
    pub applied: bool,
}

struct PreparedWrite {
    address: u64,
    bytes: Vec<u8>,
}

pub struct PatchInstaller<'a> {
    policy: &'a AddressSpacePolicy,
}

impl<'a> PatchInstaller<'a> {
    pub fn new(policy: &'a AddressSpacePolicy) -> Self {
        Self { policy }
    }

    /// Install every placement of `request` and perform its redirect.
    ///
    /// `siblings` holds install addresses of templates placed by earlier passes;
    /// placements in this request are added to it automatically.
    pub fn install<M: MemoryView + ?Sized>(
        &self,
        memory: &mut M,
        request: &InstallRequest<'_>,
        symbols: &ResolvedAddresses,
        siblings: &SiblingAddresses,
    ) -> Result<Vec<InstalledPatch>> {
        let (writes, installed) = self.prepare(&*memory, request, symbols, siblings)?;

        for write in &writes {
            memory.write_bytes(write.address, &write.bytes)?;
        }

        for patch in &installed {
            info!(
                "  Installed {} at 0x{:X} ({} bytes, entry 0x{:X})",
                patch.template, patch.destination, patch.template_len, patch.entry
            );
        }
        Ok(installed)
    }

    fn prepare<M: MemoryView + ?Sized>(
        &self,
        memory: &M,
        request: &InstallRequest<'_>,
        symbols: &ResolvedAddresses,
        siblings: &SiblingAddresses,
    ) -> Result<(Vec<PreparedWrite>, Vec<InstalledPatch>)> {
        let last = request
            .placements
            .last()
            .ok_or_else(|| Error::config("Install request has no templates"))?;

        let mut ranges = Vec::with_capacity(request.placements.len());
        for placement in &request.placements {
            let id = placement.template.id().as_str();
            self.policy
                .validate(placement.destination)
                .map_err(|e| e.in_entry(id))?;
            let end = placement.end(self.policy).map_err(|e| e.in_entry(id))?;
            if end > request.boundary {
                return Err(Error::Overlap {
                    first_start: placement.destination,
                    first_end: end,
                    second_start: request.boundary,
                    second_end: request.boundary,
                }
                .in_entry(id));
            }
            ranges.push((placement.destination, end));
        }
        check_disjoint(&ranges)?;
        for &(start, end) in &ranges {
            check_reserved(&request.reserved, start, end)?;
        }

        let mut siblings = siblings.clone();
        for placement in &request.placements {
            siblings.insert(placement.template.id().clone(), placement.destination);
        }

        let mut writes = Vec::with_capacity(request.placements.len() + 1);
        let mut installed = Vec::with_capacity(request.placements.len());
        for placement in &request.placements {
            let bytes =
                placement
                    .template
                    .apply(self.policy, placement.destination, symbols, &siblings)?;
            let entry = self
                .policy
                .offset(placement.destination, placement.template.entry())?;
            debug!(
                "  {}: 0x{:X}..0x{:X}",
                placement.template.id(),
                placement.destination,
                placement.destination.saturating_add(bytes.len() as u64)
            );
            writes.push(PreparedWrite {
                address: placement.destination,
                bytes,
            });
            installed.push(InstalledPatch {
                template: placement.template.id().clone(),
                destination: placement.destination,
                template_len: placement.template.len(),
                entry,
                applied: true,
            });
        }

        let entry = self
            .policy
            .offset(last.destination, last.template.entry())?;
        let (address, bytes) = request.redirect.prepare(self.policy, entry)?;
        let redirect_end = address.saturating_add(bytes.len() as u64);
        if let Some(&(start, end)) = ranges
            .iter()
            .find(|&&(start, end)| address < end && start < redirect_end)
        {
            return Err(Error::Overlap {
                first_start: start,
                first_end: end,
                second_start: address,
                second_end: redirect_end,
            });
        }
        check_reserved(&request.reserved, address, redirect_end)?;
        writes.push(PreparedWrite { address, bytes });

        for write in &writes {
            memory.read_bytes(write.address, write.bytes.len())?;
        }

        Ok((writes, installed))
    }
}

fn check_disjoint(ranges: &[(u64, u64)]) -> Result<()> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let ((first_start, first_end), (second_start, second_end)) = (pair[0], pair[1]);
        if first_end > second_start {
            return Err(Error::Overlap {
                first_start,
                first_end,
                second_start,
                second_end,
            });
        }
    }
    Ok(())
}

fn check_reserved(reserved: &[Range<u64>], start: u64, end: u64) -> Result<()> {
    match reserved.iter().find(|r| start < r.end && r.start < end) {
        Some(taken) => Err(Error::Overlap {
            first_start: taken.start,
            first_end: taken.end,
            second_start: start,
            second_end: end,
        }),
        None => Ok(()),
    }
}
