//! The Epoch Ring — a fixed-capacity circular log of unmount generations
//! (§3, §4.5.2).

use crate::addr::Addr;
use crate::crc::crc32;
use crate::error::Error;
use crate::hal::{Hal, IoOp};

pub const EPOCH_RECORD_BYTES: usize = 12; // epoch_id: u64, crc: u32

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpochRecord {
    pub epoch_id: u64,
    pub crc: u32,
}

impl EpochRecord {
    fn to_bytes(self) -> [u8; EPOCH_RECORD_BYTES]
    {
        let mut buf = [0u8; EPOCH_RECORD_BYTES];
        buf[0..8].copy_from_slice(&self.epoch_id.to_le_bytes());
        let crc = crc32(&buf[0..8]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<EpochRecord>
    {
        if buf.len() < EPOCH_RECORD_BYTES {
            return None;
        }

        let epoch_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let crc = u32::from_le_bytes(buf[8..12].try_into().unwrap());

        if crc32(&buf[0..8]) != crc {
            return None;
        }

        Some(EpochRecord { epoch_id, crc })
    }
}

/// A fixed-capacity circular array of epoch records on media.
pub struct EpochRing {
    pub ring_start: Addr,
    pub ring_capacity: u64,
    pub current_id: u64,
    pub current_ptr: u64,
}

impl EpochRing {
    pub fn new(ring_start: Addr, ring_capacity: u64) -> Self
    {
        Self { ring_start, ring_capacity, current_id: 0, current_ptr: 0 }
    }

    /// `ring_start` is a block index; this converts to the byte offset
    /// `hal.sync_io` expects, one block per slot.
    fn slot_offset(&self, hal: &dyn Hal, ptr: u64) -> Addr
    {
        let block_size = hal.get_caps().logical_block_size as u64;

        let (base, _) = self.ring_start.mul_by_u64(block_size);
        let (offset, _) = Addr::from_u64(ptr).mul_by_u64(block_size);
        base.checked_add(&offset).0
    }

    /// Scans the ring and recovers the newest record (highest id, with
    /// wrap detection by sequence rather than raw numeric comparison).
    pub fn recover(&mut self, hal: &dyn Hal) -> Result<(), Error>
    {
        if self.ring_capacity == 0 {
            return Err(Error::Geometry("epoch ring has zero capacity"));
        }

        let block_size = hal.get_caps().logical_block_size as u32;
        let mut best: Option<(u64, u64)> = None; // (ptr, epoch_id)

        for ptr in 0..self.ring_capacity {
            let mut buf = vec![0u8; block_size as usize];
            if hal.sync_io(IoOp::Read, self.slot_offset(hal, ptr), &mut buf, 1).is_err() {
                continue;
            }

            if let Some(rec) = EpochRecord::from_bytes(&buf) {
                let newer = match best {
                    None => true,
                    Some((_, best_id)) => is_newer(rec.epoch_id, best_id),
                };

                if newer {
                    best = Some((ptr, rec.epoch_id));
                }
            }
        }

        if let Some((ptr, id)) = best {
            self.current_ptr = ptr;
            self.current_id = id;
        }

        Ok(())
    }

    /// Advances the ring: computes the next id/pointer, writes the record,
    /// and fences. Does not itself write the superblock broadcast — the
    /// caller sequences that per §4.5.2's ordering invariant.
    pub fn advance(&mut self, hal: &dyn Hal) -> Result<(u64, u64), Error>
    {
        let next_id = self.current_id.wrapping_add(1);
        let next_ptr = (self.current_ptr + 1) % self.ring_capacity;

        let rec = EpochRecord { epoch_id: next_id, crc: 0 };
        let mut buf = vec![0u8; hal.get_caps().logical_block_size as usize];
        let encoded = rec.to_bytes();
        buf[..encoded.len()].copy_from_slice(&encoded);

        hal.sync_io(IoOp::Write, self.slot_offset(hal, next_ptr), &mut buf, 1).map_err(|_| Error::HwIo)?;
        hal.barrier()?;

        self.current_id = next_id;
        self.current_ptr = next_ptr;

        Ok((next_id, next_ptr))
    }
}

/// True if `candidate` should be treated as newer than `incumbent`,
/// tolerating one wrap of the 64-bit id space (in practice ids never wrap
/// in a volume's lifetime, but §3 calls for sequence-based, not raw
/// numeric, comparison).
fn is_newer(candidate: u64, incumbent: u64) -> bool
{
    candidate.wrapping_sub(incumbent) as i64 > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemHal;

    #[test]
    fn advance_increments_id_and_wraps_pointer()
    {
        let hal = MemHal::new(1 << 20, 512);
        let mut ring = EpochRing::new(Addr::from_u64(0), 4);

        let (id1, ptr1) = ring.advance(&hal).unwrap();
        assert_eq!((id1, ptr1), (1, 1));

        for _ in 0..3 {
            ring.advance(&hal).unwrap();
        }

        assert_eq!(ring.current_ptr, 1); // wrapped back around the 4-slot ring
    }

    #[test]
    fn recover_picks_highest_id()
    {
        let hal = MemHal::new(1 << 20, 512);
        let mut ring = EpochRing::new(Addr::from_u64(0), 4);

        for _ in 0..6 {
            ring.advance(&hal).unwrap();
        }

        let mut reader = EpochRing::new(Addr::from_u64(0), 4);
        reader.recover(&hal).unwrap();

        assert_eq!(reader.current_id, ring.current_id);
        assert_eq!(reader.current_ptr, ring.current_ptr);
    }

    #[test]
    fn zero_capacity_is_geometry_error()
    {
        let hal = MemHal::new(1 << 20, 512);
        let mut ring = EpochRing::new(Addr::from_u64(0), 0);

        assert_eq!(ring.recover(&hal), Err(Error::Geometry("epoch ring has zero capacity")));
    }
}
