//! The mutable superblock, Cardinal replica geometry and quorum protocol
//! (§3, §4.5.1).

use crate::addr::Addr;
use crate::crc::crc32;
use crate::device::DeviceType;
use crate::error::Error;
use crate::hal::{Caps, Hal, IoOp};

pub const SUPERBLOCK_MAGIC: u32 = 0x484e_3453; // "HN4S"
pub const SUPERBLOCK_BYTES: usize = 4096;

/// Superblock state flags, teacher `has_*` idiom (`e2fs::CompatFeatures`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const CLEAN: u32 = 0x0001;
    pub const DIRTY: u32 = 0x0002;
    pub const PANIC: u32 = 0x0004;
    pub const TOXIC: u32 = 0x0008;
    pub const DEGRADED: u32 = 0x0010;
    pub const LOCKED: u32 = 0x0020;
    pub const RUNTIME_SATURATED: u32 = 0x0040;
    pub const METADATA_ZEROED: u32 = 0x0080;

    pub fn has_clean(&self) -> bool { self.0 & Self::CLEAN != 0 }
    pub fn has_dirty(&self) -> bool { self.0 & Self::DIRTY != 0 }
    pub fn has_panic(&self) -> bool { self.0 & Self::PANIC != 0 }
    pub fn has_toxic(&self) -> bool { self.0 & Self::TOXIC != 0 }
    pub fn has_degraded(&self) -> bool { self.0 & Self::DEGRADED != 0 }
    pub fn has_locked(&self) -> bool { self.0 & Self::LOCKED != 0 }
    pub fn has_runtime_saturated(&self) -> bool { self.0 & Self::RUNTIME_SATURATED != 0 }
    pub fn has_metadata_zeroed(&self) -> bool { self.0 & Self::METADATA_ZEROED != 0 }

    pub fn set(&mut self, bit: u32) { self.0 |= bit; }
    pub fn clear(&mut self, bit: u32) { self.0 &= !bit; }

    pub fn has_unknown(&self) -> bool
    {
        self.0 & !(Self::CLEAN | Self::DIRTY | Self::PANIC | Self::TOXIC | Self::DEGRADED
            | Self::LOCKED | Self::RUNTIME_SATURATED | Self::METADATA_ZEROED) != 0
    }
}

/// On-disk compat flags (teacher `CompatFeatures` idiom).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompatFlags(pub u32);

impl CompatFlags {
    pub const SOUTH_SB_PRESENT: u32 = 0x0001;

    pub fn has_south_sb_present(&self) -> bool { self.0 & Self::SOUTH_SB_PRESENT != 0 }
}

/// Region table: starting block offsets for every fixed on-disk region
/// (§3, §6 "On-disk layout").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    pub epoch_ring_start: Addr,
    pub cortex_start: Addr,
    pub void_bitmap_start: Addr,
    pub qmask_start: Addr,
    pub flux_start: Addr,
    pub horizon_start: Addr,
    pub journal_start: Addr,
}

/// Volume geometry and state, replicated across the four Cardinal slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub total_capacity: Addr,
    pub layout: RegionLayout,
    pub copy_generation: u64,
    pub state: StateFlags,
    pub epoch_id: u64,
    pub epoch_ptr: u64,
    pub dirty_bits: u32,
    pub taint_bits: u32,
    pub compat: CompatFlags,
    pub format_profile: u32,
    pub device_type: DeviceType,
    pub volume_uuid: u128,
}

impl SuperBlock {
    pub fn new(block_size: u32, total_capacity: Addr, layout: RegionLayout, device_type: DeviceType, volume_uuid: u128) -> Self
    {
        Self {
            magic: SUPERBLOCK_MAGIC,
            version: 1,
            block_size,
            total_capacity,
            layout,
            copy_generation: 0,
            state: StateFlags(StateFlags::CLEAN),
            epoch_id: 0,
            epoch_ptr: 0,
            dirty_bits: 0,
            taint_bits: 0,
            compat: CompatFlags(CompatFlags::SOUTH_SB_PRESENT),
            format_profile: 0,
            device_type,
            volume_uuid,
        }
    }

    /// Serializes the superblock body (everything but the trailer CRC) to a
    /// fixed `SUPERBLOCK_BYTES` buffer, little-endian, per §6.
    pub fn to_bytes(&self) -> Vec<u8>
    {
        let mut buf = vec![0u8; SUPERBLOCK_BYTES];
        let mut w = 0usize;

        macro_rules! put {
            ($v:expr) => {{
                let bytes = $v.to_le_bytes();
                buf[w..w + bytes.len()].copy_from_slice(&bytes);
                w += bytes.len();
            }};
        }

        put!(self.magic);
        put!(self.version);
        put!(self.block_size);
        put!(self.total_capacity.lo);
        put!(self.total_capacity.hi);
        put!(self.layout.epoch_ring_start.lo);
        put!(self.layout.cortex_start.lo);
        put!(self.layout.void_bitmap_start.lo);
        put!(self.layout.qmask_start.lo);
        put!(self.layout.flux_start.lo);
        put!(self.layout.horizon_start.lo);
        put!(self.layout.journal_start.lo);
        put!(self.copy_generation);
        put!(self.state.0);
        put!(self.epoch_id);
        put!(self.epoch_ptr);
        put!(self.dirty_bits);
        put!(self.taint_bits);
        put!(self.compat.0);
        put!(self.format_profile);
        put!(device_type_tag(self.device_type));
        put!((self.volume_uuid as u64));
        put!(((self.volume_uuid >> 64) as u64));

        let crc = crc32(&buf[..w]);
        buf[SUPERBLOCK_BYTES - 4..].copy_from_slice(&crc.to_le_bytes());

        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error>
    {
        if buf.len() < SUPERBLOCK_BYTES {
            return Err(Error::Geometry("superblock buffer too short"));
        }

        let stored_crc = u32::from_le_bytes(buf[SUPERBLOCK_BYTES - 4..SUPERBLOCK_BYTES].try_into().unwrap());
        let mut r = 0usize;

        macro_rules! take {
            ($ty:ty) => {{
                let n = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes(buf[r..r + n].try_into().unwrap());
                r += n;
                v
            }};
        }

        let magic: u32 = take!(u32);
        if magic != SUPERBLOCK_MAGIC {
            return Err(Error::Geometry("superblock magic mismatch"));
        }

        let version: u32 = take!(u32);
        let block_size: u32 = take!(u32);
        let cap_lo: u64 = take!(u64);
        let cap_hi: u64 = take!(u64);
        let epoch_ring_start: u64 = take!(u64);
        let cortex_start: u64 = take!(u64);
        let void_bitmap_start: u64 = take!(u64);
        let qmask_start: u64 = take!(u64);
        let flux_start: u64 = take!(u64);
        let horizon_start: u64 = take!(u64);
        let journal_start: u64 = take!(u64);
        let copy_generation: u64 = take!(u64);
        let state: u32 = take!(u32);
        let epoch_id: u64 = take!(u64);
        let epoch_ptr: u64 = take!(u64);
        let dirty_bits: u32 = take!(u32);
        let taint_bits: u32 = take!(u32);
        let compat: u32 = take!(u32);
        let format_profile: u32 = take!(u32);
        let device_tag: u64 = take!(u64);
        let uuid_lo: u64 = take!(u64);
        let uuid_hi: u64 = take!(u64);

        let _ = r;

        if crc32(&buf[..SUPERBLOCK_BYTES - 4]) != stored_crc {
            return Err(Error::Geometry("superblock header CRC mismatch"));
        }

        Ok(Self {
            magic,
            version,
            block_size,
            total_capacity: Addr { lo: cap_lo, hi: cap_hi },
            layout: RegionLayout {
                epoch_ring_start: Addr::from_u64(epoch_ring_start),
                cortex_start: Addr::from_u64(cortex_start),
                void_bitmap_start: Addr::from_u64(void_bitmap_start),
                qmask_start: Addr::from_u64(qmask_start),
                flux_start: Addr::from_u64(flux_start),
                horizon_start: Addr::from_u64(horizon_start),
                journal_start: Addr::from_u64(journal_start),
            },
            copy_generation,
            state: StateFlags(state),
            epoch_id,
            epoch_ptr,
            dirty_bits,
            taint_bits,
            compat: CompatFlags(compat),
            format_profile,
            device_type: device_type_from_tag(device_tag),
            volume_uuid: ((uuid_hi as u128) << 64) | uuid_lo as u128,
        })
    }
}

fn device_type_tag(dt: DeviceType) -> u64
{
    match dt {
        DeviceType::Ssd => 0,
        DeviceType::Hdd => 1,
        DeviceType::Zns => 2,
        DeviceType::Tape => 3,
        DeviceType::Usb => 4,
        DeviceType::Pico => 5,
    }
}

fn device_type_from_tag(tag: u64) -> DeviceType
{
    match tag {
        1 => DeviceType::Hdd,
        2 => DeviceType::Zns,
        3 => DeviceType::Tape,
        4 => DeviceType::Usb,
        5 => DeviceType::Pico,
        _ => DeviceType::Ssd,
    }
}

/// The four Cardinal replica slots, named after compass points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cardinal {
    North,
    East,
    West,
    South,
}

impl Cardinal {
    /// Computes the byte offset of each replica. East/West/South are
    /// rounded up to block-size alignment per §4.5.1.
    pub fn offset(self, caps: &Caps) -> Addr
    {
        let block_size = caps.logical_block_size as u64;
        let total = caps.total_capacity.to_u64_checked().unwrap_or(u64::MAX);

        let align = |v: u64| -> u64 {
            let rem = v % block_size;
            if rem == 0 { v } else { v + (block_size - rem) }
        };

        match self {
            Cardinal::North => Addr::ZERO,
            Cardinal::East => Addr::from_u64(align(total / 3)),
            Cardinal::West => Addr::from_u64(align((total * 2) / 3)),
            Cardinal::South => Addr::from_u64(align(total.saturating_sub(SUPERBLOCK_BYTES as u64))),
        }
    }
}

/// Writes the superblock to all four Cardinal slots and evaluates the
/// quorum rule for the result (§4.5.1).
pub fn broadcast(hal: &dyn Hal, sb: &SuperBlock) -> Result<(), Error>
{
    let caps = hal.get_caps();
    let bytes = sb.to_bytes();
    let sectors = (SUPERBLOCK_BYTES as u32 + caps.logical_block_size - 1) / caps.logical_block_size;

    if caps.flags.has_zns_native() {
        let mut buf = bytes;
        hal.sync_io(IoOp::Write, Cardinal::North.offset(&caps), &mut buf, sectors)?;
        hal.barrier()?;
        return Ok(());
    }

    let mut ok = [false; 4];
    for (i, slot) in [Cardinal::North, Cardinal::East, Cardinal::West, Cardinal::South].into_iter().enumerate() {
        let mut buf = bytes.clone();
        ok[i] = hal.sync_io(IoOp::Write, slot.offset(&caps), &mut buf, sectors).is_ok();
    }

    let north_ok = ok[0];
    let mirrors_ok = ok[1..].iter().filter(|&&v| v).count();

    let quorum = (north_ok && mirrors_ok >= 1) || (!north_ok && mirrors_ok >= 3);

    if !quorum {
        return Err(Error::HwIo);
    }

    hal.barrier()?;
    Ok(())
}

/// Reads all four Cardinal slots, discards any failing CRC/magic, and
/// picks the highest `copy_generation` (ties broken N>E>W>S). Self-heals
/// North if it did not win.
pub fn recover(hal: &dyn Hal) -> Result<SuperBlock, Error>
{
    let caps = hal.get_caps();
    let sectors = (SUPERBLOCK_BYTES as u32 + caps.logical_block_size - 1) / caps.logical_block_size;

    let slots = [Cardinal::North, Cardinal::East, Cardinal::West, Cardinal::South];
    let mut candidates: Vec<(Cardinal, SuperBlock)> = Vec::new();

    for slot in slots {
        let mut buf = vec![0u8; sectors as usize * caps.logical_block_size as usize];
        if hal.sync_io(IoOp::Read, slot.offset(&caps), &mut buf, sectors).is_err() {
            continue;
        }

        if let Ok(sb) = SuperBlock::from_bytes(&buf) {
            candidates.push((slot, sb));
        }
    }

    let winner = candidates
        .iter()
        .max_by_key(|(slot, sb)| (sb.copy_generation, std::cmp::Reverse(*slot)))
        .cloned()
        .ok_or(Error::Geometry("no valid superblock replica found"))?;

    if winner.0 != Cardinal::North {
        let mut buf = winner.1.to_bytes();
        let _ = hal.sync_io(IoOp::Write, Cardinal::North.offset(&caps), &mut buf, sectors);
    }

    Ok(winner.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemHal;

    fn layout() -> RegionLayout
    {
        RegionLayout {
            epoch_ring_start: Addr::from_u64(8),
            cortex_start: Addr::from_u64(64),
            void_bitmap_start: Addr::from_u64(512),
            qmask_start: Addr::from_u64(640),
            flux_start: Addr::from_u64(768),
            horizon_start: Addr::from_u64(900_000),
            journal_start: Addr::from_u64(950_000),
        }
    }

    #[test]
    fn superblock_byte_roundtrip()
    {
        let sb = SuperBlock::new(512, Addr::from_u64(1_000_000), layout(), DeviceType::Ssd, 0x1234_5678_9abc_def0);
        let bytes = sb.to_bytes();
        let parsed = SuperBlock::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.magic, SUPERBLOCK_MAGIC);
        assert_eq!(parsed.block_size, 512);
        assert_eq!(parsed.volume_uuid, sb.volume_uuid);
        assert_eq!(parsed.layout, sb.layout);
    }

    #[test]
    fn corrupt_crc_is_rejected()
    {
        let sb = SuperBlock::new(512, Addr::from_u64(1_000_000), layout(), DeviceType::Ssd, 1);
        let mut bytes = sb.to_bytes();
        bytes[0] ^= 0xFF;

        assert!(SuperBlock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn cardinal_offsets_are_ordered_and_aligned()
    {
        let hal = MemHal::new(1_048_576, 512);
        let caps = hal.get_caps();

        let n = Cardinal::North.offset(&caps);
        let e = Cardinal::East.offset(&caps);
        let w = Cardinal::West.offset(&caps);
        let s = Cardinal::South.offset(&caps);

        assert!(n < e);
        assert!(e < w);
        assert!(w < s);
        assert_eq!(e.to_u64_checked().unwrap() % 512, 0);
        assert_eq!(w.to_u64_checked().unwrap() % 512, 0);
        assert_eq!(s.to_u64_checked().unwrap() % 512, 0);
    }

    #[test]
    fn split_brain_highest_generation_wins_and_self_heals()
    {
        let hal = MemHal::new(4 * 1024 * 1024, 512);
        let sb_low = SuperBlock { copy_generation: 10, ..SuperBlock::new(512, Addr::from_u64(4 * 1024 * 1024), layout(), DeviceType::Ssd, 7) };
        let mut sb_high = sb_low.clone();
        sb_high.copy_generation = 11;

        let caps = hal.get_caps();
        let sectors = (SUPERBLOCK_BYTES as u32 + caps.logical_block_size - 1) / caps.logical_block_size;

        let mut north_buf = sb_low.to_bytes();
        hal.sync_io(IoOp::Write, Cardinal::North.offset(&caps), &mut north_buf, sectors).unwrap();

        let mut east_buf = sb_high.to_bytes();
        hal.sync_io(IoOp::Write, Cardinal::East.offset(&caps), &mut east_buf, sectors).unwrap();

        let recovered = recover(&hal).unwrap();
        assert_eq!(recovered.copy_generation, 11);

        let mut reread = vec![0u8; sectors as usize * caps.logical_block_size as usize];
        hal.sync_io(IoOp::Read, Cardinal::North.offset(&caps), &mut reread, sectors).unwrap();
        let healed = SuperBlock::from_bytes(&reread).unwrap();
        assert!(healed.copy_generation >= 11);
    }
}
