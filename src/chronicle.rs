//! The Chronicle seam: an audit-log collaborator `Volume` calls into but
//! does not own (§1, §13).

use log::{info, warn};

/// Events a volume may want audited. The collector is external; this is
/// the shape it receives.
#[derive(Clone, Debug)]
pub enum ChronicleEvent {
    Healed { word: u64 },
    BitmapCorrupt { word: u64 },
    SaturationChanged { used_pct: u8, latched: bool },
    EpochAdvanced { id: u64 },
    Undeleted { seed_id: u128 },
    Degraded { reason: String },
}

pub trait ChronicleSink: Send + Sync {
    fn record(&self, event: ChronicleEvent);
}

/// Discards every event. The default sink for volumes that do not care to
/// audit.
pub struct NullSink;

impl ChronicleSink for NullSink {
    fn record(&self, _event: ChronicleEvent) {}
}

/// Forwards events to the `log` facade, `warn!` for corruption/degraded
/// conditions and `info!` for everything else.
pub struct LogSink;

impl ChronicleSink for LogSink {
    fn record(&self, event: ChronicleEvent)
    {
        match event {
            ChronicleEvent::BitmapCorrupt { word } => warn!("bitmap word {word} uncorrectable"),
            ChronicleEvent::Degraded { reason } => warn!("volume degraded: {reason}"),
            ChronicleEvent::Healed { word } => info!("bitmap word {word} healed"),
            ChronicleEvent::SaturationChanged { used_pct, latched } => {
                info!("saturation changed: used_pct={used_pct} latched={latched}")
            }
            ChronicleEvent::EpochAdvanced { id } => info!("epoch advanced to {id}"),
            ChronicleEvent::Undeleted { seed_id } => info!("anchor {seed_id:#x} undeleted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_every_variant()
    {
        let sink = NullSink;
        sink.record(ChronicleEvent::Healed { word: 0 });
        sink.record(ChronicleEvent::Degraded { reason: "test".into() });
    }
}
