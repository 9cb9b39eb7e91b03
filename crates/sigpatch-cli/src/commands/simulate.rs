//! Simulate command implementation.
//!
//! Loads a captured image, fires a single session against it and reports each
//! pipeline step. The image is only ever modified in memory unless `--output` is
//! given.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use serde_json::json;
use sigpatch_core::{
    DiagnosticEvent, DiagnosticSink, MemoryImage, Outcome, PipelineState, Profile, Session,
    load_image, save_image,
};
use tracing::info;

use super::load_profiles;

pub struct SimulateArgs<'a> {
    pub profiles: &'a [PathBuf],
    pub version: Option<&'a str>,
    pub image: &'a Path,
    pub report: Option<&'a Path>,
    pub output: Option<&'a Path>,
}

/// Prints one line per step and keeps the events for the report.
#[derive(Default)]
struct ConsoleSink {
    events: Vec<DiagnosticEvent>,
}

fn render(event: &DiagnosticEvent) -> Vec<String> {
    let status = match event.outcome {
        Outcome::Success => format!("{} {}", "✓".green(), event.step),
        Outcome::Failure(kind) => format!("{} {} ({})", "✗".red(), event.step, kind.red()),
    };
    std::iter::once(status)
        .chain(
            event
                .addresses
                .iter()
                .map(|(name, address)| format!("    {:<18} 0x{:X}", name, address)),
        )
        .collect()
}

impl DiagnosticSink for ConsoleSink {
    fn emit(&mut self, event: DiagnosticEvent) {
        for line in render(&event) {
            println!("{}", line);
        }
        self.events.push(event);
    }
}

/// Run the simulate command
pub fn run(args: SimulateArgs<'_>) -> Result<()> {
    let set = load_profiles(args.profiles)?;
    let image = load_image(args.image).with_context(|| format!("loading {}", args.image.display()))?;
    let mut memory = image.to_memory()?;

    let lowest = image.regions.iter().map(|r| r.base).min().unwrap_or_default();
    let profile: Profile = match args.version {
        Some(version) => set
            .select(version)
            .with_context(|| format!("no profile for version '{}'", version))?
            .clone(),
        None => set.detect_version(lowest).clone(),
    };
    info!("Profile: {}", profile.name);

    let mut sink = ConsoleSink::default();
    let state = Session::new(profile.clone())?.fire(&mut memory, image.stack_pointer, &mut sink);

    if let Some(path) = args.report {
        write_report(path, &profile, &state, &sink.events)?;
        info!("Report written to {}", path.display());
    }
    if let Some(path) = args.output {
        save_image(path, &MemoryImage::from_memory(&memory, image.stack_pointer))?;
        info!("Patched image written to {}", path.display());
    }

    if let (Some(step), Some(kind)) = (state.failed_step, state.last_error) {
        bail!("pipeline stopped at {}: {}", step, kind);
    }
    println!("{}", "All steps completed".green().bold());
    Ok(())
}

fn write_report(
    path: &Path,
    profile: &Profile,
    state: &PipelineState,
    events: &[DiagnosticEvent],
) -> Result<()> {
    let report = json!({
        "profile": profile.name,
        "version": profile.version,
        "state": state,
        "events": events,
    });
    fs::write(path, serde_json::to_string_pretty(&report)?)?;
    Ok(())
}
