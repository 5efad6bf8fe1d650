//! Mount-time configuration: geometry/profile overrides and audit policy
//! (§13, ambient). Plain data constructed by the caller and passed into
//! `Volume::mount` — never global state (§9 "no singletons").

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chronicle::{ChronicleSink, NullSink};
use crate::device::DeviceType;

/// JSON-deserializable overrides for a device profile's tunables, applied
/// on top of `device::profile_for` at mount time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    pub genesis_probe_limit: Option<u32>,
    pub horizon_legal: Option<bool>,
}

/// Mount-time configuration. `chronicle` has no meaningful serde
/// representation, so configs loaded from JSON always start with
/// `NullSink` and the caller wires up logging afterward if it wants one.
/// Held as an `Arc` (rather than the teacher's usual `Box`) because a
/// `Config` is read by reference at mount time but the sink it names must
/// still be cheaply shareable into the `Volume` that outlives it.
pub struct Config {
    /// Whether a double-free on `Clear` (a block cleared twice with no
    /// intervening `Set`) is surfaced as an error rather than silently
    /// tolerated (§4.1.6).
    pub strict_audit: bool,
    pub device_type: DeviceType,
    pub profile_overrides: Option<ProfileOverrides>,
    pub chronicle: Arc<dyn ChronicleSink>,
}

impl Config {
    pub fn default_for(device_type: DeviceType) -> Self
    {
        Self { strict_audit: false, device_type, profile_overrides: None, chronicle: Arc::new(NullSink) }
    }

    /// Builds a `Config` from a JSON document holding `strict_audit`,
    /// `device_type` (one of `"ssd"`, `"hdd"`, `"zns"`, `"tape"`, `"usb"`,
    /// `"pico"`), and an optional `profile_overrides` object.
    pub fn from_json(text: &str) -> serde_json::Result<Config>
    {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            strict_audit: bool,
            device_type: WireDeviceType,
            #[serde(default)]
            profile_overrides: Option<ProfileOverrides>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "lowercase")]
        enum WireDeviceType {
            Ssd,
            Hdd,
            Zns,
            Tape,
            Usb,
            Pico,
        }

        let wire: Wire = serde_json::from_str(text)?;

        let device_type = match wire.device_type {
            WireDeviceType::Ssd => DeviceType::Ssd,
            WireDeviceType::Hdd => DeviceType::Hdd,
            WireDeviceType::Zns => DeviceType::Zns,
            WireDeviceType::Tape => DeviceType::Tape,
            WireDeviceType::Usb => DeviceType::Usb,
            WireDeviceType::Pico => DeviceType::Pico,
        };

        Ok(Config {
            strict_audit: wire.strict_audit,
            device_type,
            profile_overrides: wire.profile_overrides,
            chronicle: Arc::new(NullSink),
        })
    }

    pub fn with_chronicle(mut self, sink: Arc<dyn ChronicleSink>) -> Self
    {
        self.chronicle = sink;
        self
    }
}
