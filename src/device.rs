//! Device-type profile table (§4.1.1, §9 "dynamic dispatch").
//!
//! Device flavors differ only in trajectory limits and jitter suppression;
//! per the design notes, that is modeled as a data table indexed by a
//! device-type tag, not as a trait-object hierarchy.

use std::ops::RangeInclusive;

/// Supported device flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Ssd,
    Hdd,
    Zns,
    Tape,
    Usb,
    Pico,
}

/// Per-device-type placement policy.
#[derive(Clone, Debug)]
pub struct Profile {
    /// Inclusive range of orbit depths `k` tried during block allocation.
    pub k_budget: RangeInclusive<u8>,
    /// Jitter table indexed by `min(k, 15)`; all-zero on linear-profile
    /// devices (HDD, Tape, ZNS).
    pub theta_lut: [u64; 16],
    /// Whether the horizon (D1.5) fallback region is usable on this
    /// profile at all.
    pub horizon_legal: bool,
    /// Bounded Genesis probe count (§4.1.3): 20 on SSD-class devices, 128
    /// on USB.
    pub genesis_probe_limit: u32,
    /// True when this device requires a zone reset before each horizon
    /// wrap (ZNS).
    pub requires_zone_reset_on_wrap: bool,
}

/// A fixed jitter table; non-zero only for devices with true random-access
/// seek cost, where spreading orbit candidates reduces collision chains.
const SSD_THETA_LUT: [u64; 16] = [
    0, 3, 7, 11, 17, 23, 31, 41, 53, 67, 83, 101, 127, 157, 191, 229,
];
const ZERO_THETA_LUT: [u64; 16] = [0; 16];

pub fn profile_for(device_type: DeviceType) -> Profile
{
    match device_type {
        DeviceType::Ssd => Profile {
            k_budget: 0..=12,
            theta_lut: SSD_THETA_LUT,
            horizon_legal: true,
            genesis_probe_limit: 20,
            requires_zone_reset_on_wrap: false,
        },
        DeviceType::Hdd => Profile {
            k_budget: 0..=0,
            theta_lut: ZERO_THETA_LUT,
            horizon_legal: true,
            genesis_probe_limit: 20,
            requires_zone_reset_on_wrap: false,
        },
        DeviceType::Zns => Profile {
            k_budget: 0..=12,
            theta_lut: ZERO_THETA_LUT,
            horizon_legal: true,
            genesis_probe_limit: 20,
            requires_zone_reset_on_wrap: true,
        },
        DeviceType::Tape => Profile {
            k_budget: 0..=0,
            theta_lut: ZERO_THETA_LUT,
            horizon_legal: true,
            genesis_probe_limit: 20,
            requires_zone_reset_on_wrap: false,
        },
        DeviceType::Usb => Profile {
            k_budget: 0..=12,
            theta_lut: SSD_THETA_LUT,
            horizon_legal: true,
            genesis_probe_limit: 128,
            requires_zone_reset_on_wrap: false,
        },
        DeviceType::Pico => Profile {
            k_budget: 0..=0,
            theta_lut: ZERO_THETA_LUT,
            horizon_legal: true,
            genesis_probe_limit: 20,
            requires_zone_reset_on_wrap: false,
        },
    }
}

impl Profile {
    /// Jitter for orbit depth `k`, clamped to the table's last entry per
    /// §4.1.1 (`THETA_LUT[min(k,15)]`).
    pub fn theta(&self, k: u8) -> u64
    {
        self.theta_lut[k.min(15) as usize]
    }

    pub fn max_k(&self) -> u8
    {
        *self.k_budget.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_profiles_collapse_jitter_to_zero()
    {
        for dt in [DeviceType::Hdd, DeviceType::Tape, DeviceType::Zns] {
            let profile = profile_for(dt);

            assert!(profile.theta_lut.iter().all(|&t| t == 0), "{dt:?} must have zero jitter");
        }
    }

    #[test]
    fn hdd_tape_pico_restrict_to_k_zero()
    {
        for dt in [DeviceType::Hdd, DeviceType::Tape, DeviceType::Pico] {
            let profile = profile_for(dt);

            assert_eq!(profile.k_budget, 0..=0);
        }
    }

    #[test]
    fn ssd_budget_is_full_orbit_range()
    {
        assert_eq!(profile_for(DeviceType::Ssd).k_budget, 0..=12);
    }

    #[test]
    fn usb_has_wider_genesis_probe_limit()
    {
        assert_eq!(profile_for(DeviceType::Usb).genesis_probe_limit, 128);
        assert_eq!(profile_for(DeviceType::Ssd).genesis_probe_limit, 20);
    }

    #[test]
    fn theta_clamps_above_15()
    {
        let profile = profile_for(DeviceType::Ssd);

        assert_eq!(profile.theta(15), profile.theta(200));
    }

    #[test]
    fn zns_requires_zone_reset_on_wrap()
    {
        assert!(profile_for(DeviceType::Zns).requires_zone_reset_on_wrap);
        assert!(!profile_for(DeviceType::Ssd).requires_zone_reset_on_wrap);
    }
}
