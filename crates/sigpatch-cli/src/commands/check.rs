//! Check command implementation.

use std::path::PathBuf;

use anyhow::Result;
use owo_colors::OwoColorize;
use sigpatch_core::{Profile, TemplateId};

use super::load_profiles;

/// Run the check command
pub fn run(paths: &[PathBuf]) -> Result<()> {
    let set = load_profiles(paths)?;

    for (path, profile) in paths.iter().zip(set.profiles()) {
        println!("{} {}", "✓".green(), path.display());
        print_summary(profile);
        println!();
    }

    println!("Default profile: {}", set.default_profile().name.bold());
    Ok(())
}

fn print_summary(profile: &Profile) {
    let version = if profile.version.is_empty() {
        "-"
    } else {
        profile.version.as_str()
    };
    println!("  Name:    {} (version {})", profile.name, version);
    println!(
        "  Minimum: 0x{:X}",
        profile.policy.minimum_valid_address
    );
    println!(
        "  Stack:   0x{:X} words, anchor window 0x{:X}..0x{:X}, caller window ..0x{:X}",
        profile.stack_depth,
        profile.anchor.window_start,
        profile.anchor.window_end,
        profile.caller.window_end
    );
    println!("  Anchor:  {}", profile.anchor.pattern);
    println!(
        "  Offsets: {} relative to {}",
        profile.offsets.len(),
        profile.offsets.base
    );
    print_patch("Patch 1", profile, &profile.patch1);
    print_patch("Patch 2", profile, &profile.patch2);
}

fn print_patch(label: &str, profile: &Profile, ids: &[TemplateId]) {
    let parts: Vec<String> = ids
        .iter()
        .filter_map(|id| profile.template(id))
        .map(|t| format!("{} ({} bytes, {} fixups)", t.id(), t.len(), t.slots().len()))
        .collect();
    println!("  {}: {}", label, parts.join(", "));
}
