//! `Volume`: the mount/unmount lifecycle binding every subsystem to one
//! HAL handle, plus the concurrency bookkeeping (ref-count, taint
//! counter, dirty state) that spans them (§3, §5, §12).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::Addr;
use crate::allocator::{trajectory, AnchorParams, Allocator, Horizon, Saturation};
use crate::bitmap::{BitOp, VoidBitmap};
use crate::chronicle::{ChronicleEvent, ChronicleSink};
use crate::config::Config;
use crate::cortex::{Anchor, NanoCortex};
use crate::device::{profile_for, DeviceType, Profile};
use crate::epoch::EpochRing;
use crate::error::{Error, HnResult, Outcome};
use crate::hal::Hal;
use crate::qmask::{Intent, QualityMask};
use crate::superblock::{self, CompatFlags, RegionLayout, StateFlags, SuperBlock, SUPERBLOCK_BYTES};

const EPOCH_RING_CAPACITY: u64 = 8;
const JOURNAL_CAPACITY: u64 = 4;

/// An open HN4 volume: one HAL handle, the full subsystem set, and the
/// bookkeeping that outlives any single operation.
pub struct Volume {
    hal: Box<dyn Hal>,
    profile: Profile,
    device_type: DeviceType,
    block_size: u32,
    total_blocks: u64,
    total_capacity: Addr,
    layout: RegionLayout,
    flux_start: Addr,
    available_d1_blocks: u64,
    is_system_profile: bool,
    volume_uuid: u128,

    state: Mutex<StateFlags>,
    copy_generation: AtomicU64,
    epoch_ring: Mutex<EpochRing>,

    bitmap: VoidBitmap,
    qmask: QualityMask,
    cortex: NanoCortex,
    horizon: Horizon,
    saturation: Saturation,
    used_blocks: AtomicU64,

    ref_count: AtomicU32,
    taint_counter: AtomicU32,
    next_seed_counter: AtomicU64,

    strict_audit: bool,
    chronicle: Arc<dyn ChronicleSink>,
}

/// Computes the fixed on-disk region layout for a device of `total_blocks`
/// blocks (§6 "On-disk layout"). The same formula runs at format time and
/// at mount time so a recovered superblock's layout always re-derives the
/// same slot counts.
fn plan_layout(total_blocks: u64, block_size: u32) -> Result<(RegionLayout, usize), Error>
{
    let sb_blocks = (SUPERBLOCK_BYTES as u64 + block_size as u64 - 1) / block_size as u64;
    let epoch_ring_start = sb_blocks;
    let cortex_slot_count = (total_blocks / 32).clamp(16, 4096) as usize;
    let cortex_start = epoch_ring_start + EPOCH_RING_CAPACITY;
    let void_bitmap_start = cortex_start + cortex_slot_count as u64;
    let qmask_start = void_bitmap_start + 1;
    let flux_start = qmask_start + 1;
    let horizon_capacity = (total_blocks / 16).max(8);
    let horizon_start = total_blocks.saturating_sub(horizon_capacity + JOURNAL_CAPACITY);
    let journal_start = horizon_start + horizon_capacity;

    if flux_start + 16 >= horizon_start {
        return Err(Error::Geometry("device too small for the HN4 region layout"));
    }

    let layout = RegionLayout {
        epoch_ring_start: Addr::from_u64(epoch_ring_start),
        cortex_start: Addr::from_u64(cortex_start),
        void_bitmap_start: Addr::from_u64(void_bitmap_start),
        qmask_start: Addr::from_u64(qmask_start),
        flux_start: Addr::from_u64(flux_start),
        horizon_start: Addr::from_u64(horizon_start),
        journal_start: Addr::from_u64(journal_start),
    };

    Ok((layout, cortex_slot_count))
}

fn apply_overrides(profile: &mut Profile, cfg: &Config)
{
    if let Some(ov) = &cfg.profile_overrides {
        if let Some(limit) = ov.genesis_probe_limit {
            profile.genesis_probe_limit = limit;
        }
        if let Some(legal) = ov.horizon_legal {
            profile.horizon_legal = legal;
        }
    }
}

impl Volume {
    /// Formats a fresh volume on `hal` and mounts it (§4.5.1 initial
    /// broadcast). Used by the demo binary's `--format` path and by
    /// tests; a volume with existing content should use [`Volume::mount`].
    pub fn format_and_mount(hal: Box<dyn Hal>, cfg: &Config) -> HnResult<Volume>
    {
        let caps = hal.get_caps();
        let block_size = caps.logical_block_size;
        let total_capacity = caps.total_capacity;
        let total_blocks = total_capacity.to_u64_checked().ok_or(Error::Geometry("capacity exceeds 64-bit block count"))? / block_size as u64;

        let (layout, cortex_slot_count) = plan_layout(total_blocks, block_size)?;
        let available_d1_blocks = layout.horizon_start.checked_sub(&layout.flux_start).0.to_u64_checked().unwrap_or(0);

        let volume_uuid = ((hal.get_random_u64() as u128) << 64) | hal.get_random_u64() as u128;

        let mut profile = profile_for(cfg.device_type);
        apply_overrides(&mut profile, cfg);

        let bitmap = VoidBitmap::new(total_blocks, volume_uuid);
        let qmask = QualityMask::new(total_blocks);
        let cortex = NanoCortex::new(cortex_slot_count, layout.cortex_start, block_size);
        let horizon = Horizon::new(layout.horizon_start, layout.journal_start, block_size, block_size)?;
        let mut epoch_ring = EpochRing::new(layout.epoch_ring_start, EPOCH_RING_CAPACITY);

        let sb = SuperBlock::new(block_size, total_capacity, layout, cfg.device_type, volume_uuid);
        superblock::broadcast(&*hal, &sb)?;
        epoch_ring.advance(&*hal)?;

        Ok(Outcome::ok(Volume {
            hal,
            profile,
            device_type: cfg.device_type,
            block_size,
            total_blocks,
            total_capacity,
            layout,
            flux_start: layout.flux_start,
            available_d1_blocks,
            is_system_profile: matches!(cfg.device_type, DeviceType::Pico),
            volume_uuid,
            state: Mutex::new(StateFlags(StateFlags::CLEAN)),
            copy_generation: AtomicU64::new(sb.copy_generation),
            epoch_ring: Mutex::new(epoch_ring),
            bitmap,
            qmask,
            cortex,
            horizon,
            saturation: Saturation::new(),
            used_blocks: AtomicU64::new(0),
            ref_count: AtomicU32::new(1),
            taint_counter: AtomicU32::new(0),
            next_seed_counter: AtomicU64::new(1),
            strict_audit: cfg.strict_audit,
            chronicle: cfg.chronicle.clone(),
        }))
    }

    /// Mounts an existing volume: quorum-recovers the superblock (§4.5.1),
    /// recovers the epoch ring, and rebuilds the in-RAM cortex cache and
    /// free-space bitmap from the durable anchor slots (§12).
    pub fn mount(hal: Box<dyn Hal>, cfg: &Config) -> HnResult<Volume>
    {
        let sb = superblock::recover(&*hal)?;

        let mut epoch_ring = EpochRing::new(sb.layout.epoch_ring_start, EPOCH_RING_CAPACITY);
        epoch_ring.recover(&*hal)?;

        let mut profile = profile_for(cfg.device_type);
        apply_overrides(&mut profile, cfg);

        let total_blocks = sb.total_capacity.to_u64_checked().unwrap_or(0) / sb.block_size as u64;
        let (_, cortex_slot_count) = plan_layout(total_blocks, sb.block_size)?;

        let bitmap = VoidBitmap::new(total_blocks, sb.volume_uuid);
        let qmask = QualityMask::new(total_blocks);
        let cortex = NanoCortex::recover(&*hal, cortex_slot_count, sb.layout.cortex_start, sb.block_size);

        let available_d1_blocks = sb.layout.horizon_start.checked_sub(&sb.layout.flux_start).0.to_u64_checked().unwrap_or(0);

        // Re-derive each live anchor's primary (k=0, n=0) block so the
        // bitmap reflects reality before any new allocation runs.
        let mut used_blocks = 0u64;
        for index in 0..cortex.slot_count() {
            let Some(anchor) = cortex.get(index) else { continue };
            if !anchor.data_class.has_valid() || anchor.data_class.has_tombstone() {
                continue;
            }

            let params = AnchorParams { gravity_center: anchor.gravity_center, orbit_vector: anchor.orbit_vector, fractal_scale: anchor.fractal_scale };
            let Ok(lba) = trajectory(&params, sb.layout.flux_start, available_d1_blocks, 0, 0, &profile) else { continue };
            let Some(block_index) = lba.to_u64_checked() else { continue };

            if bitmap.bitmap_op(block_index, BitOp::Set).map(|o| o.value).unwrap_or(false) {
                used_blocks += 1;
            }
        }

        let horizon = Horizon::new(sb.layout.horizon_start, sb.layout.journal_start, sb.block_size, sb.block_size)?;

        Ok(Outcome::ok(Volume {
            hal,
            profile,
            device_type: sb.device_type,
            block_size: sb.block_size,
            total_blocks,
            total_capacity: sb.total_capacity,
            layout: sb.layout,
            flux_start: sb.layout.flux_start,
            available_d1_blocks,
            is_system_profile: matches!(sb.device_type, DeviceType::Pico),
            volume_uuid: sb.volume_uuid,
            state: Mutex::new(sb.state),
            copy_generation: AtomicU64::new(sb.copy_generation),
            epoch_ring: Mutex::new(epoch_ring),
            bitmap,
            qmask,
            cortex,
            horizon,
            saturation: Saturation::new(),
            used_blocks: AtomicU64::new(used_blocks),
            ref_count: AtomicU32::new(1),
            taint_counter: AtomicU32::new(0),
            next_seed_counter: AtomicU64::new(1),
            strict_audit: cfg.strict_audit,
            chronicle: cfg.chronicle.clone(),
        }))
    }

    /// Ordered flush/advance/broadcast/barrier sequence, then refuses if
    /// any other handle is still open (§4.5.2, §12). Returns the HAL handle
    /// back to the caller on success: per §9's cyclic-reference design note,
    /// the device is owned by whoever called `mount`/`format_and_mount`, not
    /// by the volume, so unmounting hands it back rather than dropping it.
    pub fn unmount(self) -> HnResult<Box<dyn Hal>>
    {
        if self.ref_count.load(Ordering::SeqCst) > 1 {
            return Err(Error::Busy);
        }

        let (epoch_id, epoch_ptr) = self.epoch_ring.lock().advance(&*self.hal)?;
        self.chronicle.record(ChronicleEvent::EpochAdvanced { id: epoch_id });

        let mut state = *self.state.lock();
        state.clear(StateFlags::DIRTY);
        state.set(StateFlags::CLEAN);

        let mut sb = SuperBlock::new(self.block_size, self.total_capacity, self.layout, self.device_type, self.volume_uuid);
        sb.copy_generation = self.copy_generation.fetch_add(1, Ordering::SeqCst) + 1;
        sb.state = state;
        sb.epoch_id = epoch_id;
        sb.epoch_ptr = epoch_ptr;
        sb.taint_bits = self.taint_counter.load(Ordering::SeqCst);
        sb.compat = CompatFlags(CompatFlags::SOUTH_SB_PRESENT);

        if let Err(e) = superblock::broadcast(&*self.hal, &sb) {
            // §4.5.2 step 5 / §7: a quorum failure at unmount reverts to
            // DEGRADED and rebroadcasts, rather than leaving the on-media
            // state split-brained at the generation that almost committed.
            self.chronicle.record(ChronicleEvent::Degraded { reason: "superblock quorum failed at unmount".to_string() });

            let mut degraded = sb;
            degraded.copy_generation = self.copy_generation.fetch_add(1, Ordering::SeqCst) + 1;
            degraded.state.clear(StateFlags::CLEAN);
            degraded.state.set(StateFlags::DEGRADED);
            let _ = superblock::broadcast(&*self.hal, &degraded);

            return Err(e);
        }
        self.hal.barrier()?;

        // Scrub the in-RAM metadata caches before the volume handle drops;
        // the HAL itself is handed back untouched (§3).
        self.bitmap.secure_zero_all();
        self.cortex.secure_zero_all();

        Ok(Outcome::ok(self.hal))
    }

    pub fn strict_audit(&self) -> bool
    {
        self.strict_audit
    }

    pub fn chronicle(&self) -> &dyn ChronicleSink
    {
        &*self.chronicle
    }

    pub fn acquire(&self)
    {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self)
    {
        self.ref_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> u32
    {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self)
    {
        self.state.lock().set(StateFlags::DIRTY);
    }

    pub fn is_dirty(&self) -> bool
    {
        self.state.lock().has_dirty()
    }

    /// Latches the volume-level PANIC flag and audits the event (§7:
    /// "Bitmap DED -> PANIC flag set and operation fails"). `VoidBitmap`
    /// tracks its own panic bit for the syndrome-detection contract, but
    /// only the caller holding the `Volume` can set volume state and reach
    /// the Chronicle sink, so data-path call sites invoke this on
    /// `Error::BitmapCorrupt`.
    pub fn mark_panic(&self, word_index: u64)
    {
        self.state.lock().set(StateFlags::PANIC);
        self.chronicle.record(ChronicleEvent::BitmapCorrupt { word: word_index });
    }

    pub fn is_panicked(&self) -> bool
    {
        self.state.lock().has_panic()
    }

    pub fn hal(&self) -> &dyn Hal
    {
        &*self.hal
    }

    pub fn bitmap(&self) -> &VoidBitmap
    {
        &self.bitmap
    }

    pub fn qmask(&self) -> &QualityMask
    {
        &self.qmask
    }

    pub fn cortex(&self) -> &NanoCortex
    {
        &self.cortex
    }

    pub fn horizon(&self) -> &Horizon
    {
        &self.horizon
    }

    pub fn flux_start(&self) -> Addr
    {
        self.flux_start
    }

    pub fn available_d1_blocks(&self) -> u64
    {
        self.available_d1_blocks
    }

    pub fn profile(&self) -> &Profile
    {
        &self.profile
    }

    pub fn block_size(&self) -> u32
    {
        self.block_size
    }

    pub fn device_type(&self) -> DeviceType
    {
        self.device_type
    }

    pub fn allocator(&self) -> Allocator<'_>
    {
        Allocator::new(
            &*self.hal,
            &self.bitmap,
            &self.qmask,
            self.profile.clone(),
            self.flux_start,
            self.available_d1_blocks,
            self.total_blocks,
            &self.horizon,
            &self.saturation,
            &self.used_blocks,
            self.is_system_profile,
        )
    }

    fn next_seed_id(&self) -> u128
    {
        let n = self.next_seed_counter.fetch_add(1, Ordering::SeqCst);
        (self.volume_uuid ^ (n as u128)) | 1
    }

    /// Creates a new anchor and reserves it a placement seed (§4.1.3,
    /// §4.4 Creation). Returns the cortex slot index.
    pub fn create_file(&self, name: &str) -> Result<usize, Error>
    {
        if self.cortex.find_by_name(name).is_some() {
            return Err(Error::Eexist);
        }

        let genesis = self.allocator().genesis(Intent::UserData)?;
        if genesis.info == Some(crate::error::Info::HorizonFallback) {
            self.chronicle.record(ChronicleEvent::SaturationChanged { used_pct: self.allocator().used_pct(), latched: true });
        }
        let (gravity_center, orbit_vector) = genesis.value;

        let seed_id = self.next_seed_id();
        let now = self.hal.get_time_ns() as u32;

        let mut anchor = Anchor::new(seed_id, seed_id, now);
        anchor.set_name(name);
        anchor.gravity_center = gravity_center;
        anchor.orbit_vector = orbit_vector;

        self.cortex.create(&*self.hal, anchor)
    }

    /// Soft-deletes an anchor: sets the Tombstone bit but leaves its
    /// backing blocks untouched, so `undelete` can still recover it
    /// (§4.3.4, §4.4 Deletion).
    pub fn delete_file(&self, index: usize) -> Result<(), Error>
    {
        let now = self.hal.get_time_ns();
        self.cortex.tombstone(&*self.hal, index, now)
    }

    /// Finds a live anchor's slot index by name (full table scan, §9).
    pub fn find_file(&self, name: &str) -> Option<usize>
    {
        self.cortex.find_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemHal;

    fn cfg() -> Config
    {
        Config::default_for(DeviceType::Ssd)
    }

    #[test]
    fn format_then_mount_recovers_same_generation()
    {
        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let volume = Volume::format_and_mount(Box::new(hal), &cfg()).unwrap().value;
        let generation = volume.copy_generation.load(Ordering::SeqCst);

        // Re-mount against the same backing store the format wrote to.
        let remounted = Volume::mount(volume.hal, &cfg()).unwrap().value;
        assert_eq!(remounted.copy_generation.load(Ordering::SeqCst), generation);
    }

    #[test]
    fn unmount_refuses_when_ref_count_above_one()
    {
        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let volume = Volume::format_and_mount(Box::new(hal), &cfg()).unwrap().value;
        volume.acquire();

        assert!(matches!(volume.unmount(), Err(Error::Busy)));
    }

    #[test]
    fn create_file_rejects_duplicate_name()
    {
        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let volume = Volume::format_and_mount(Box::new(hal), &cfg()).unwrap().value;

        volume.create_file("dup.txt").unwrap();

        assert_eq!(volume.create_file("dup.txt").unwrap_err(), Error::Eexist);
    }

    #[test]
    fn create_file_then_mark_dirty_sets_flag()
    {
        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let volume = Volume::format_and_mount(Box::new(hal), &cfg()).unwrap().value;

        assert!(!volume.is_dirty());
        let index = volume.create_file("a.txt").unwrap();
        volume.mark_dirty();

        assert!(volume.is_dirty());
        assert!(volume.cortex().get(index).unwrap().data_class.has_valid());
    }

    #[test]
    fn delete_leaves_bitmap_untouched()
    {
        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let volume = Volume::format_and_mount(Box::new(hal), &cfg()).unwrap().value;
        let index = volume.create_file("b.txt").unwrap();

        volume.delete_file(index).unwrap();

        assert!(volume.cortex().get(index).unwrap().data_class.has_tombstone());
    }

    #[test]
    fn double_bit_bitmap_error_latches_volume_panic()
    {
        use crate::allocator::{trajectory, AnchorParams};

        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let volume = Volume::format_and_mount(Box::new(hal), &cfg()).unwrap().value;
        let index = volume.create_file("c.txt").unwrap();

        crate::io::atomic_write(&volume, index, 0, b"panic probe").unwrap();
        assert!(!volume.is_panicked());

        let anchor = volume.cortex().get(index).unwrap();
        let params = AnchorParams { gravity_center: anchor.gravity_center, orbit_vector: anchor.orbit_vector, fractal_scale: anchor.fractal_scale };
        let lba = trajectory(&params, volume.flux_start(), volume.available_d1_blocks(), 0, 0, volume.profile()).unwrap();
        let block_index = lba.to_u64_checked().unwrap();

        volume.bitmap().test_corrupt_l3_word(block_index, 0x3); // two-bit flip: uncorrectable

        let err = crate::io::atomic_read(&volume, &anchor, 0).unwrap_err();

        assert!(matches!(err, Error::BitmapCorrupt(_)));
        assert!(volume.is_panicked());
    }
}
