use serde::Serialize;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::pipeline::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "kind")]
pub enum Outcome {
    Success,
    Failure(ErrorKind),
}

/// One structured record per executed pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticEvent {
    pub step: Step,
    pub outcome: Outcome,
    /// Addresses discovered by this step, in discovery order.
    #[serde(serialize_with = "serialize_addresses")]
    pub addresses: Vec<(String, u64)>,
}

fn serialize_addresses<S: serde::Serializer>(
    addresses: &[(String, u64)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;

    #[derive(Serialize)]
    struct Entry<'a> {
        name: &'a str,
        address: String,
    }

    let mut seq = serializer.serialize_seq(Some(addresses.len()))?;
    for (name, address) in addresses {
        seq.serialize_element(&Entry {
            name,
            address: format!("0x{:X}", address),
        })?;
    }
    seq.end()
}

/// Receiver of pipeline diagnostics. How events are rendered is up to the sink.
pub trait DiagnosticSink {
    fn emit(&mut self, event: DiagnosticEvent);
}

/// Collects events, e.g. for a JSON report.
impl DiagnosticSink for Vec<DiagnosticEvent> {
    fn emit(&mut self, event: DiagnosticEvent) {
        self.push(event);
    }
}

/// Renders events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&mut self, event: DiagnosticEvent) {
        match event.outcome {
            Outcome::Success => {
                info!("[{}] ok", event.step);
                for (name, address) in &event.addresses {
                    info!("  {}: 0x{:X}", name, address);
                }
            }
            Outcome::Failure(kind) => warn!("[{}] failed: {}", event.step, kind),
        }
    }
}
