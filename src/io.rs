//! The block I/O data path: block header, atomic read, shadow-hop atomic
//! write, read-modify-write, and the Lazarus undelete/pulse-check
//! protocol (§4.3).

use crate::addr::Addr;
use crate::allocator::{trajectory, AnchorParams};
use crate::bitmap::BitOp;
use crate::crc::crc32;
use crate::cortex::Anchor;
use crate::device::Profile;
use crate::error::{Error, HnResult, Info, Outcome};
use crate::hal::{Hal, IoOp};
use crate::qmask::Intent;
use crate::volume::Volume;

pub const BLOCK_HEADER_MAGIC: u32 = 0x484e_3442; // "HN4B"
pub const BLOCK_HEADER_BYTES: usize = 48;

/// Fixed block header preceding every payload (§4.3.1, byte layout §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub well_id: u128,
    pub logical_idx: u64,
    pub write_gen: u32,
    pub payload_len: u32,
}

impl BlockHeader {
    pub fn to_bytes(&self, payload: &[u8]) -> Vec<u8>
    {
        let mut header = [0u8; BLOCK_HEADER_BYTES];
        let mut w = 0;

        header[w..w + 4].copy_from_slice(&self.magic.to_le_bytes()); w += 4;
        header[w..w + 16].copy_from_slice(&self.well_id.to_le_bytes()); w += 16;
        header[w..w + 8].copy_from_slice(&self.logical_idx.to_le_bytes()); w += 8;
        header[w..w + 4].copy_from_slice(&self.write_gen.to_le_bytes()); w += 4;
        header[w..w + 4].copy_from_slice(&self.payload_len.to_le_bytes()); w += 4;
        w += 4; // reserved

        let header_crc = crc32(&header[..w]);
        header[w..w + 4].copy_from_slice(&header_crc.to_le_bytes()); w += 4;

        let payload_crc = crc32(payload);
        header[w..w + 4].copy_from_slice(&payload_crc.to_le_bytes());

        let mut out = header.to_vec();
        out.extend_from_slice(payload);
        out
    }

    /// Parses the header and verifies both CRCs against `payload`
    /// (§4.3.2 steps 2-3). Returns `(header, header_ok, payload_ok)`.
    pub fn from_bytes(buf: &[u8]) -> Result<(BlockHeader, bool, u32, u32), Error>
    {
        if buf.len() < BLOCK_HEADER_BYTES {
            return Err(Error::Geometry("block buffer shorter than header"));
        }

        let mut r = 0;
        macro_rules! take {
            ($ty:ty) => {{ let n = std::mem::size_of::<$ty>(); let v = <$ty>::from_le_bytes(buf[r..r + n].try_into().unwrap()); r += n; v }};
        }

        let magic: u32 = take!(u32);
        let well_id: u128 = take!(u128);
        let logical_idx: u64 = take!(u64);
        let write_gen: u32 = take!(u32);
        let payload_len: u32 = take!(u32);
        r += 4; // reserved
        let header_crc: u32 = take!(u32);
        let payload_crc: u32 = take!(u32);

        let header_ok = magic == BLOCK_HEADER_MAGIC && crc32(&buf[..r - 8]) == header_crc;

        Ok((BlockHeader { magic, well_id, logical_idx, write_gen, payload_len }, header_ok, header_crc, payload_crc))
    }
}

/// Converts a block index (the unit `trajectory` and the bitmap/cortex
/// deal in) to the byte offset the HAL's `sync_io` expects.
fn byte_offset(block_index: Addr, block_size: u32) -> Addr
{
    block_index.mul_by_u64(block_size as u64).0
}

fn candidate_trajectories(params: &AnchorParams, flux_start: Addr, available_d1_blocks: u64, n: u64, profile: &Profile) -> Vec<(Addr, u8)>
{
    let mut out = Vec::new();

    for k in 0..=profile.max_k() {
        if let Ok(lba) = trajectory(params, flux_start, available_d1_blocks, n, k, profile) {
            out.push((lba, k));
        }
    }

    out
}

/// Reads logical index `n` of `anchor`, scanning ballistic candidates
/// (plus the horizon slot, if `Horizon-hint` is set) and verifying the
/// block's identity before trusting it (§4.3.2).
pub fn atomic_read(volume: &Volume, anchor: &Anchor, n: u64) -> HnResult<Vec<u8>>
{
    let params = AnchorParams {
        gravity_center: anchor.gravity_center,
        orbit_vector: anchor.orbit_vector,
        fractal_scale: anchor.fractal_scale,
    };

    let mut candidates = candidate_trajectories(&params, volume.flux_start(), volume.available_d1_blocks(), n, volume.profile());

    if anchor.data_class.has_horizon_hint() {
        // The horizon ring has no trajectory function to re-derive a slot
        // from, so `atomic_write` persists the absolute block index it was
        // given directly into `gravity_center` when it takes this path.
        candidates.push((Addr::from_u64(anchor.gravity_center), 15));
    }

    let block_size = volume.block_size();

    for (lba, _k) in candidates {
        let block_index = match lba.to_u64_checked() {
            Some(v) => v,
            None => continue,
        };

        let allocated = match volume.bitmap().bitmap_op(block_index, BitOp::Test) {
            Ok(o) => {
                if o.info == Some(Info::Healed) {
                    volume.chronicle().record(crate::chronicle::ChronicleEvent::Healed { word: block_index / crate::bitmap::BLOCKS_PER_WORD });
                }
                o.value
            }
            Err(Error::BitmapCorrupt(word)) => {
                // §4.2.2 point 5: a double-bit error never proceeds with the
                // op; surface it rather than silently trying the next
                // candidate trajectory.
                volume.mark_panic(word);
                return Err(Error::BitmapCorrupt(word));
            }
            Err(_) => false,
        };
        if !allocated {
            continue;
        }

        let mut buf = vec![0u8; block_size as usize];
        if volume.hal().sync_io(IoOp::Read, byte_offset(lba, block_size), &mut buf, 1).is_err() {
            continue;
        }

        let (header, header_ok, _hcrc, payload_crc) = match BlockHeader::from_bytes(&buf) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if !header_ok || header.well_id != anchor.seed_id || header.logical_idx != n {
            continue;
        }

        if header.write_gen < anchor.write_gen {
            // Stale block left by a write that never completed its shadow hop.
            continue;
        }

        let payload = &buf[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + header.payload_len as usize];

        if crc32(payload) == payload_crc {
            return Ok(Outcome::ok(payload.to_vec()));
        }

        return Err(Error::DataRot);
    }

    Ok(Outcome::with_info(vec![0u8; block_size as usize], Info::Sparse))
}

/// Allocates a new shadow block, writes the payload, and CASes the anchor
/// to point at it; rolls back the new allocation on commit failure
/// (§4.3.3).
pub fn atomic_write(volume: &Volume, anchor_index: usize, n: u64, payload: &[u8]) -> HnResult<()>
{
    let anchor = volume.cortex().get(anchor_index).ok_or(Error::NotFound)?;
    let intent = if anchor.data_class.has_is_directory() { Intent::Metadata } else { Intent::UserData };
    // write_gen is bumped on every prior materialization, so > 0 means this anchor
    // already holds data and we're re-placing it rather than doing first Genesis.
    let is_update = anchor.write_gen > 0;

    let params = AnchorParams {
        gravity_center: anchor.gravity_center,
        orbit_vector: anchor.orbit_vector,
        fractal_scale: anchor.fractal_scale,
    };

    let alloc_outcome = match volume.allocator().block(&params, n, intent, is_update) {
        Ok(o) => o,
        Err(Error::BitmapCorrupt(word)) => {
            volume.mark_panic(word);
            return Err(Error::BitmapCorrupt(word));
        }
        Err(e) => return Err(e),
    };
    if alloc_outcome.info == Some(Info::HorizonWrapped) {
        volume.mark_dirty();
    }
    let (new_lba, k) = alloc_outcome.value;
    let new_block_index = new_lba.to_u64_checked().ok_or(Error::Geometry("allocated block exceeds 64-bit addressing"))?;

    let next_gen = anchor.write_gen.wrapping_add(1);
    let header = BlockHeader {
        magic: BLOCK_HEADER_MAGIC,
        well_id: anchor.seed_id,
        logical_idx: n,
        write_gen: next_gen,
        payload_len: payload.len() as u32,
    };

    let mut frame = header.to_bytes(payload);
    frame.resize(volume.block_size() as usize, 0);

    if volume.hal().sync_io(IoOp::Write, byte_offset(new_lba, volume.block_size()), &mut frame, 1).is_err() {
        volume.bitmap().bitmap_op(new_block_index, BitOp::ForceClear).ok();
        volume.allocator().note_force_clear();
        return Err(Error::HwIo);
    }

    let mut updated = anchor.clone();
    updated.gravity_center = params.gravity_center;
    updated.orbit_vector = params.orbit_vector;
    updated.write_gen = next_gen;
    updated.mass = updated.mass.max((n + 1) * volume.block_size() as u64);
    updated.mod_clock = volume.hal().get_time_ns();

    // k == 15 is the horizon sentinel (§4.1.4): the placement didn't come
    // from the ballistic trajectory function, so there's nothing for
    // `gravity_center`/`orbit_vector` to predict. Stash the literal block
    // index there instead and flag it so `atomic_read` knows to trust it
    // verbatim rather than run it through `trajectory`.
    if k == 15 {
        updated.gravity_center = new_block_index;
        updated.data_class.set(crate::cortex::DataClassFlags::HORIZON_HINT);
    } else {
        updated.data_class.clear(crate::cortex::DataClassFlags::HORIZON_HINT);
    }

    let old_lba = if is_update {
        if anchor.data_class.has_horizon_hint() {
            Some(Addr::from_u64(anchor.gravity_center))
        } else {
            trajectory(&AnchorParams {
                gravity_center: anchor.gravity_center,
                orbit_vector: anchor.orbit_vector,
                fractal_scale: anchor.fractal_scale,
            }, volume.flux_start(), volume.available_d1_blocks(), n, 0, volume.profile()).ok()
        }
    } else {
        None
    };

    match volume.cortex().write_anchor_atomic(volume.hal(), anchor_index, &updated) {
        Ok(()) => {
            volume.mark_dirty();

            // `force_clear` is reserved for the rollback branch below
            // (§4.1.6): a successful shadow hop frees the old block through
            // the regular `Clear` op, so a spurious double-free here still
            // trips the strict-audit contract instead of being silently
            // absorbed.
            if let Some(old) = old_lba {
                if let Some(old_index) = old.to_u64_checked() {
                    if old_index != new_block_index {
                        if let Ok(r) = volume.bitmap().bitmap_op(old_index, BitOp::Clear) {
                            if r.value {
                                if volume.allocator().note_clear() {
                                    volume.mark_dirty(); // used_blocks underflow: consistency bug (§4.1.6)
                                }
                            } else if volume.strict_audit() {
                                volume.mark_dirty();
                            }
                        }
                    }
                }
            }

            Ok(Outcome::ok(()))
        }
        Err(e) => {
            volume.bitmap().bitmap_op(new_block_index, BitOp::ForceClear).ok();
            volume.allocator().note_force_clear();
            Err(e)
        }
    }
}

/// Partial-block write: reads the old block into a scratch buffer,
/// overlays `new_bytes` at `offset`, and writes the result as a new
/// shadow (§4.3.3, "Partial-block writes").
pub fn read_modify_write(volume: &Volume, anchor_index: usize, n: u64, offset: usize, new_bytes: &[u8]) -> HnResult<()>
{
    let anchor = volume.cortex().get(anchor_index).ok_or(Error::NotFound)?;
    let mut scratch = atomic_read(volume, &anchor, n).map(|o| o.value).unwrap_or_else(|_| vec![0u8; volume.block_size() as usize]);

    if scratch.len() < offset + new_bytes.len() {
        scratch.resize(offset + new_bytes.len(), 0);
    }
    scratch[offset..offset + new_bytes.len()].copy_from_slice(new_bytes);

    atomic_write(volume, anchor_index, n, &scratch)
}

/// Recovers a tombstoned anchor by name, re-verifying the backing block's
/// identity before clearing the Tombstone bit (§4.3.4).
pub fn undelete(volume: &Volume, name: &str) -> HnResult<()>
{
    let index = volume.cortex().find_tombstoned_by_name(name).ok_or(Error::NotFound)?;
    let anchor = volume.cortex().get(index).ok_or(Error::NotFound)?;

    let params = AnchorParams {
        gravity_center: anchor.gravity_center,
        orbit_vector: anchor.orbit_vector,
        fractal_scale: anchor.fractal_scale,
    };

    let lba = trajectory(&params, volume.flux_start(), volume.available_d1_blocks(), 0, 0, volume.profile())?;
    let block_index = lba.to_u64_checked().ok_or(Error::Geometry("undelete block exceeds 64-bit addressing"))?;

    let still_allocated = match volume.bitmap().bitmap_op(block_index, BitOp::Test) {
        Ok(o) => o.value,
        Err(Error::BitmapCorrupt(word)) => {
            volume.mark_panic(word);
            return Err(Error::BitmapCorrupt(word));
        }
        Err(e) => return Err(e),
    };
    if !still_allocated {
        return Err(Error::DataRot);
    }

    let mut buf = vec![0u8; volume.block_size() as usize];
    volume.hal().sync_io(IoOp::Read, byte_offset(lba, volume.block_size()), &mut buf, 1).map_err(|_| Error::HwIo)?;

    let (header, header_ok, _hcrc, payload_crc) = BlockHeader::from_bytes(&buf)?;
    if !header_ok {
        return Err(Error::HeaderRot);
    }
    if header.well_id != anchor.seed_id {
        return Err(Error::IdMismatch);
    }

    let payload = &buf[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + header.payload_len as usize];
    if crc32(payload) != payload_crc {
        return Err(Error::DataRot);
    }

    let mut restored = anchor.clone();
    restored.data_class.clear(crate::cortex::DataClassFlags::TOMBSTONE);
    restored.mod_clock = volume.hal().get_time_ns();

    volume.cortex().write_anchor_atomic(volume.hal(), index, &restored)?;
    volume.chronicle().record(crate::chronicle::ChronicleEvent::Undeleted { seed_id: anchor.seed_id });

    Ok(Outcome::ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::DeviceType;

    fn mounted_volume() -> Volume
    {
        let hal = crate::hal::MemHal::new(4 * 1024 * 1024, 512);
        Volume::format_and_mount(Box::new(hal), &Config::default_for(DeviceType::Ssd)).unwrap().value
    }

    #[test]
    fn write_then_read_round_trips()
    {
        let volume = mounted_volume();
        let index = volume.create_file("greeting.txt").unwrap();

        let payload = b"hello, flux manifold".to_vec();
        atomic_write(&volume, index, 0, &payload).unwrap();

        let anchor = volume.cortex().get(index).unwrap();
        let read_back = atomic_read(&volume, &anchor, 0).unwrap();

        assert_eq!(&read_back.value[..payload.len()], &payload[..]);
    }

    #[test]
    fn sparse_read_is_zero_fill()
    {
        let volume = mounted_volume();
        let index = volume.create_file("empty.txt").unwrap();
        let anchor = volume.cortex().get(index).unwrap();

        let result = atomic_read(&volume, &anchor, 3).unwrap();

        assert_eq!(result.info, Some(Info::Sparse));
        assert!(result.value.iter().all(|&b| b == 0));
    }

    #[test]
    fn delete_then_undelete_preserves_seed_id()
    {
        let volume = mounted_volume();
        let index = volume.create_file("recoverable.txt").unwrap();
        atomic_write(&volume, index, 0, b"data").unwrap();

        let original_seed = volume.cortex().get(index).unwrap().seed_id;

        volume.delete_file(index).unwrap();
        undelete(&volume, "recoverable.txt").unwrap();

        let recovered = volume.cortex().get(index).unwrap();
        assert_eq!(recovered.seed_id, original_seed);
        assert!(!recovered.data_class.has_tombstone());
    }
}
