//! The Flux Manifold allocator: ballistic placement, saturation control,
//! and the Horizon (linear-log) fallback (§4.1).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::addr::{mul_mod, Addr};
use crate::bitmap::{BitOp, VoidBitmap};
use crate::device::Profile;
use crate::error::{Error, HnResult, Info, Outcome};
use crate::hal::Hal;
use crate::qmask::{Intent, QualityMask};

/// The subset of an anchor's placement parameters the trajectory function
/// needs (§4.1.1).
#[derive(Clone, Copy, Debug)]
pub struct AnchorParams {
    pub gravity_center: u64,
    pub orbit_vector: u64,
    pub fractal_scale: u16,
}

/// Gravity-assist swizzle applied to the orbit vector at `k >= 4`. Must
/// never return the identity (§4.1.1).
const SWIZZLE_MAGIC: u64 = 0x9E37_79B9_7F4A_7C15;

pub fn swizzle(v: u64) -> u64
{
    v.rotate_left(17) ^ SWIZZLE_MAGIC
}

fn v_eff(v: u64, k: u8) -> u64
{
    if k < 4 {
        v
    } else {
        swizzle(v)
    }
}

/// Computes the physical block index for logical index `n` at orbit
/// depth `k`, given the anchor's placement parameters (§4.1.1).
pub fn trajectory(params: &AnchorParams, flux_start: Addr, available_d1_blocks: u64, n: u64, k: u8, profile: &Profile) -> Result<Addr, Error>
{
    let m = params.fractal_scale;
    if m >= 63 {
        return Err(Error::Geometry("fractal scale exceeds addressable range"));
    }

    let s = 1u64 << m;
    let phi = available_d1_blocks / s;
    if phi == 0 {
        return Err(Error::Geometry("trajectory window collapsed (phi == 0)"));
    }

    let g_unit = (params.gravity_center / s) % phi;
    let veff = v_eff(params.orbit_vector, k);
    let offset = (mul_mod(n, veff, phi) + g_unit) % phi;
    let theta = profile.theta(k);
    let entropy = params.gravity_center % s;

    let (scaled, _) = Addr::from_u64(offset).mul_by_u64(s);
    let (with_base, _) = flux_start.checked_add(&scaled);
    let (with_theta, _) = with_base.checked_add(&Addr::from_u64(theta));
    let (lba, _) = with_theta.checked_add(&Addr::from_u64(entropy));

    Ok(lba)
}

/// The Horizon (D1.5) fallback: a ring buffer between `horizon_start` and
/// `journal_start` (§4.1.4).
pub struct Horizon {
    pub horizon_start: Addr,
    pub ring_capacity: u64,
    pub journal_start: Addr,
    head: AtomicU64,
}

impl Horizon {
    pub fn new(horizon_start: Addr, journal_start: Addr, block_size: u32, sector_size: u32) -> Result<Self, Error>
    {
        let (diff, borrow) = journal_start.checked_sub(&horizon_start);
        if borrow || diff == Addr::ZERO {
            return Err(Error::Geometry("journal_start must follow horizon_start"));
        }
        if block_size % sector_size != 0 {
            return Err(Error::Geometry("block size is not a multiple of sector size"));
        }

        let ring_capacity = diff.to_u64_checked().ok_or(Error::Geometry("horizon ring exceeds 64-bit addressing"))?;
        if ring_capacity == 0 {
            return Err(Error::Geometry("horizon ring has zero capacity"));
        }

        Ok(Self { horizon_start, ring_capacity, journal_start, head: AtomicU64::new(0) })
    }

    pub fn head(&self) -> u64
    {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, v: u64)
    {
        self.head.store(v, Ordering::SeqCst);
    }

    /// Probes at most 4 consecutive slots starting at the current head.
    /// Returns the claimed block index and whether this allocation
    /// crossed a full lap of the ring (§4.1.4 point 3 / §9 Open Question:
    /// allocation across wrap marks Dirty, probe failure does not).
    pub fn alloc(&self, bitmap: &VoidBitmap, fractal_scale: u16) -> HnResult<(Addr, bool)>
    {
        if fractal_scale > 0 {
            return Err(Error::GravityCollapse);
        }

        for _ in 0..4 {
            let prev = self.head.fetch_add(1, Ordering::SeqCst);
            let slot = prev % self.ring_capacity;
            let wrapped = slot == 0;

            let (block, _) = self.horizon_start.checked_add(&Addr::from_u64(slot));
            let block_index = block.to_u64_checked().ok_or(Error::Geometry("horizon block exceeds 64-bit addressing"))?;

            if bitmap.bitmap_op(block_index, BitOp::Test)?.value {
                continue;
            }

            let set = bitmap.bitmap_op(block_index, BitOp::Set)?;
            if set.value {
                let info = if wrapped { Info::HorizonWrapped } else { Info::HorizonFallback };
                return Ok(Outcome::with_info((block, wrapped), info));
            }
        }

        Err(Error::Enospc)
    }
}

/// Sticky saturation latch with hysteresis (§4.1.5).
pub struct Saturation {
    genesis_pct: u8,
    update_pct: u8,
    recovery_pct: u8,
    latched: AtomicBool,
}

impl Saturation {
    pub fn new() -> Self
    {
        Self { genesis_pct: 90, update_pct: 95, recovery_pct: 85, latched: AtomicBool::new(false) }
    }

    pub fn is_latched(&self) -> bool
    {
        self.latched.load(Ordering::Relaxed)
    }

    /// Re-evaluates the latch against the current usage percentage.
    /// Setting is edge-triggered at `genesis_pct`; clearing only happens
    /// below `recovery_pct` (hysteresis).
    pub fn observe(&self, used_pct: u8)
    {
        if used_pct >= self.genesis_pct {
            self.latched.store(true, Ordering::Relaxed);
        } else if used_pct < self.recovery_pct {
            self.latched.store(false, Ordering::Relaxed);
        }
    }

    pub fn update_threshold_exceeded(&self, used_pct: u8) -> bool
    {
        used_pct >= self.update_pct
    }
}

impl Default for Saturation {
    fn default() -> Self
    {
        Self::new()
    }
}

fn gcd(a: u64, b: u64) -> u64
{
    if b == 0 { a } else { gcd(b, a % b) }
}

/// The Flux Manifold allocator: trajectory evaluation, per-k probing, the
/// saturation state machine, and the Horizon fallback.
///
/// Borrows its mutable state (`horizon`, `saturation`, `used_blocks`) from
/// the volume that owns it rather than holding it by value, so a fresh
/// `Allocator` can be built per call without losing state across calls
/// (§5: allocator state outlives any one operation).
pub struct Allocator<'a> {
    hal: &'a dyn Hal,
    bitmap: &'a VoidBitmap,
    qmask: &'a QualityMask,
    profile: Profile,
    flux_start: Addr,
    available_d1_blocks: u64,
    total_blocks: u64,
    is_system_profile: bool,
    pub horizon: &'a Horizon,
    pub saturation: &'a Saturation,
    used_blocks: &'a AtomicU64,
}

impl<'a> Allocator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hal: &'a dyn Hal,
        bitmap: &'a VoidBitmap,
        qmask: &'a QualityMask,
        profile: Profile,
        flux_start: Addr,
        available_d1_blocks: u64,
        total_blocks: u64,
        horizon: &'a Horizon,
        saturation: &'a Saturation,
        used_blocks: &'a AtomicU64,
        is_system_profile: bool,
    ) -> Self
    {
        Self {
            hal,
            bitmap,
            qmask,
            profile,
            flux_start,
            available_d1_blocks,
            total_blocks,
            is_system_profile,
            horizon,
            saturation,
            used_blocks,
        }
    }

    pub fn used_blocks(&self) -> u64
    {
        self.used_blocks.load(Ordering::Relaxed)
    }

    pub fn used_pct(&self) -> u8
    {
        if self.total_blocks == 0 {
            return 0;
        }
        ((self.used_blocks() * 100) / self.total_blocks).min(100) as u8
    }

    /// Increments the used-block counter on a true `Set` and re-evaluates
    /// saturation (§4.1.6).
    pub fn note_set(&self)
    {
        self.used_blocks.fetch_add(1, Ordering::SeqCst);
        self.saturation.observe(self.used_pct());
    }

    /// Decrements the used-block counter on a true `Clear`, saturating at
    /// zero. Returns `true` if an underflow was caught (a consistency
    /// bug, per §4.1.6, that the caller should mark Dirty for).
    pub fn note_clear(&self) -> bool
    {
        let prev = self.used_blocks.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some(v.saturating_sub(1))
        });
        self.saturation.observe(self.used_pct());

        matches!(prev, Ok(0))
    }

    /// `force_clear` decrements the same counter but the caller must NOT
    /// mark the volume Dirty for it (§4.1.6).
    pub fn note_force_clear(&self)
    {
        let _ = self.used_blocks.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
        self.saturation.observe(self.used_pct());
    }

    /// Generates a placement seed for a new file (§4.1.3).
    pub fn genesis(&self, intent: Intent) -> HnResult<(u64, u64)>
    {
        if self.saturation.is_latched() || self.used_pct() >= 90 {
            self.saturation.observe(self.used_pct().max(90));
            return Ok(Outcome::with_info((0, 0), Info::HorizonFallback));
        }

        let phi = self.available_d1_blocks;
        if phi == 0 {
            return Err(Error::Geometry("no addressable D1 blocks for genesis"));
        }

        for _ in 0..self.profile.genesis_probe_limit {
            let g = self.hal.get_random_u64();
            let mut v = self.hal.get_random_u64() | 1; // force odd

            for p in [3u64, 5, 7, 11, 13] {
                if v % p == 0 && phi % p == 0 {
                    v = v.wrapping_add(2);
                }
            }

            v %= phi;
            if v == 0 {
                v = 3 % phi.max(1);
            }
            if v == 0 {
                continue;
            }

            let _ = intent;
            let _ = gcd(v, phi); // informational only; the wheel projection approximates coprimality

            return Ok(Outcome::ok((g, v)));
        }

        Err(Error::Enospc)
    }

    /// Chooses a physical block for logical index `n` of an anchor whose
    /// placement parameters are `params` (§4.1.2).
    pub fn block(&self, params: &AnchorParams, n: u64, intent: Intent, is_update: bool) -> HnResult<(Addr, u8)>
    {
        let max_k = self.profile.max_k();

        for k in 0..=max_k {
            let lba = match trajectory(params, self.flux_start, self.available_d1_blocks, n, k, &self.profile) {
                Ok(lba) => lba,
                Err(_) => break, // Phi/M invalid regardless of k: stop probing, fall through to exhaustion.
            };

            let block_index = match lba.to_u64_checked() {
                Some(v) => v,
                None => continue,
            };

            let quality = match self.qmask.get(block_index) {
                Ok(q) => q,
                Err(_) => continue,
            };
            if !QualityMask::allows(quality, intent) {
                continue;
            }

            if self.bitmap.l2_maybe_used(block_index).unwrap_or(true) {
                match self.bitmap.bitmap_op(block_index, BitOp::Test) {
                    Ok(r) if r.value => continue,
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }

            let claim = self.bitmap.bitmap_op(block_index, BitOp::Set)?;
            if claim.value {
                self.note_set();
                return Ok(Outcome::ok((lba, k)));
            }
        }

        self.exhausted(params.fractal_scale, intent, is_update)
    }

    fn exhausted(&self, fractal_scale: u16, intent: Intent, is_update: bool) -> HnResult<(Addr, u8)>
    {
        if fractal_scale > 0 {
            return Err(Error::GravityCollapse);
        }

        if is_update && self.used_pct() as u32 >= 95 {
            return self.alloc_horizon(fractal_scale);
        }

        if self.is_system_profile || intent == Intent::Metadata {
            return Err(Error::Enospc);
        }

        self.alloc_horizon(fractal_scale)
    }

    fn alloc_horizon(&self, fractal_scale: u16) -> HnResult<(Addr, u8)>
    {
        let result = self.horizon.alloc(self.bitmap, fractal_scale)?;
        self.note_set();

        let (lba, wrapped) = result.value;
        if wrapped && self.profile.requires_zone_reset_on_wrap {
            let block_size = self.hal.get_caps().logical_block_size as usize;
            let mut discard = vec![0u8; block_size];
            self.hal.sync_io(crate::hal::IoOp::ZoneReset, lba, &mut discard, 1)?;
        }

        Ok(result.map(|(lba, _wrapped)| (lba, 15u8)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{profile_for, DeviceType};
    use crate::hal::MemHal;

    fn params(g: u64, v: u64, m: u16) -> AnchorParams
    {
        AnchorParams { gravity_center: g, orbit_vector: v, fractal_scale: m }
    }

    #[test]
    fn swizzle_never_returns_identity()
    {
        for v in [1u64, 2, 12345, u64::MAX / 3] {
            assert_ne!(swizzle(v), v);
        }
    }

    #[test]
    fn trajectory_is_deterministic()
    {
        let profile = profile_for(DeviceType::Ssd);
        let p = params(1000, 7, 0);

        let a = trajectory(&p, Addr::from_u64(0), 100_000, 42, 0, &profile).unwrap();
        let b = trajectory(&p, Addr::from_u64(0), 100_000, 42, 0, &profile).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn trajectory_rejects_phi_zero()
    {
        let profile = profile_for(DeviceType::Ssd);
        let p = params(0, 1, 20); // S = 2^20, way bigger than available blocks

        assert!(trajectory(&p, Addr::from_u64(0), 16, 0, 0, &profile).is_err());
    }

    #[test]
    fn genesis_then_block_zero_returns_same_region()
    {
        let hal = MemHal::new(1 << 20, 512);
        let bitmap = VoidBitmap::new(2000, 0);
        let qmask = QualityMask::new(2000);
        let profile = profile_for(DeviceType::Ssd);
        let horizon = Horizon::new(Addr::from_u64(1900), Addr::from_u64(1950), 512, 512).unwrap();
        let saturation = Saturation::new();
        let used_blocks = AtomicU64::new(0);

        let alloc = Allocator::new(&hal, &bitmap, &qmask, profile, Addr::from_u64(0), 1900, 2000, &horizon, &saturation, &used_blocks, false);

        let (g, v) = alloc.genesis(Intent::UserData).unwrap().value;
        let params = AnchorParams { gravity_center: g, orbit_vector: v, fractal_scale: 0 };

        let (lba, k) = alloc.block(&params, 0, Intent::UserData, false).unwrap().value;
        assert!(k <= 12);
        assert!(lba.to_u64_checked().unwrap() < 1900);
    }

    #[test]
    fn horizon_wraps_across_u64_max()
    {
        let bitmap = VoidBitmap::new(20, 0);
        let horizon = Horizon::new(Addr::from_u64(10), Addr::from_u64(20), 512, 512).unwrap();
        horizon.set_head(u64::MAX);

        let (first, _) = horizon.alloc(&bitmap, 0).unwrap().value;
        assert_eq!(first.to_u64_checked().unwrap(), 15); // 10 + (MAX % 10 == 5)

        let (second, _) = horizon.alloc(&bitmap, 0).unwrap().value;
        assert_eq!(second.to_u64_checked().unwrap(), 10); // 10 + 0
    }

    #[test]
    fn horizon_rejects_scaled_blocks()
    {
        let bitmap = VoidBitmap::new(20, 0);
        let horizon = Horizon::new(Addr::from_u64(10), Addr::from_u64(20), 512, 512).unwrap();

        assert_eq!(horizon.alloc(&bitmap, 1), Err(Error::GravityCollapse));
    }

    #[test]
    fn saturation_latches_and_releases_with_hysteresis()
    {
        let sat = Saturation::new();

        sat.observe(91);
        assert!(sat.is_latched());

        sat.observe(87);
        assert!(sat.is_latched(), "must stay latched between 85 and 90");

        sat.observe(84);
        assert!(!sat.is_latched());
    }

    #[test]
    fn genesis_redirects_to_horizon_when_saturated()
    {
        let hal = MemHal::new(1 << 20, 512);
        let bitmap = VoidBitmap::new(100, 0);
        let qmask = QualityMask::new(100);
        let profile = profile_for(DeviceType::Ssd);
        let horizon = Horizon::new(Addr::from_u64(90), Addr::from_u64(100), 512, 512).unwrap();
        let saturation = Saturation::new();
        let used_blocks = AtomicU64::new(0);

        let alloc = Allocator::new(&hal, &bitmap, &qmask, profile, Addr::from_u64(0), 90, 100, &horizon, &saturation, &used_blocks, false);

        for _ in 0..91 {
            alloc.note_set();
        }

        let result = alloc.genesis(Intent::UserData).unwrap();
        assert_eq!(result.info, Some(Info::HorizonFallback));
        assert!(alloc.saturation.is_latched());
    }

    #[test]
    fn used_blocks_saturates_at_zero_on_double_clear()
    {
        let hal = MemHal::new(1 << 20, 512);
        let bitmap = VoidBitmap::new(100, 0);
        let qmask = QualityMask::new(100);
        let profile = profile_for(DeviceType::Ssd);
        let horizon = Horizon::new(Addr::from_u64(90), Addr::from_u64(100), 512, 512).unwrap();
        let saturation = Saturation::new();
        let used_blocks = AtomicU64::new(0);
        let alloc = Allocator::new(&hal, &bitmap, &qmask, profile, Addr::from_u64(0), 90, 100, &horizon, &saturation, &used_blocks, false);

        let underflowed = alloc.note_clear();
        assert!(underflowed);
        assert_eq!(alloc.used_blocks(), 0);
    }

    #[test]
    fn horizon_wrap_marks_dirty_info_and_resets_zone_on_zns()
    {
        let hal = MemHal::new(1 << 20, 512);
        let bitmap = VoidBitmap::new(20, 0);
        let qmask = QualityMask::new(20);
        let profile = profile_for(DeviceType::Zns);
        assert!(profile.requires_zone_reset_on_wrap);

        let horizon = Horizon::new(Addr::from_u64(10), Addr::from_u64(20), 512, 512).unwrap();
        horizon.set_head(u64::MAX); // next probe lands on the last ring slot, then wraps
        let saturation = Saturation::new();
        let used_blocks = AtomicU64::new(0);

        let alloc = Allocator::new(&hal, &bitmap, &qmask, profile, Addr::from_u64(0), 10, 20, &horizon, &saturation, &used_blocks, false);

        // Dirty the block the wrap will land on so the zone reset is observable.
        let mut stain = [0xFFu8; 512];
        hal.sync_io(crate::hal::IoOp::Write, Addr::from_u64(10), &mut stain, 1).unwrap();

        let first = alloc.alloc_horizon(0).unwrap();
        assert_eq!(first.value.0.to_u64_checked().unwrap(), 15); // MAX % 10 == 5, not a wrap

        let second = alloc.alloc_horizon(0).unwrap();
        assert_eq!(second.info, Some(Info::HorizonWrapped));
        assert_eq!(second.value.0.to_u64_checked().unwrap(), 10);

        let mut check = [0u8; 512];
        hal.sync_io(crate::hal::IoOp::Read, Addr::from_u64(10), &mut check, 1).unwrap();
        assert_eq!(check, [0u8; 512], "zone reset must zero the wrapped-to block on ZNS");
    }
}
