//! The Nano-Cortex anchor table: the in-RAM file-metadata array with
//! atomic anchor commits, shadow-hop updates, and generation counters
//! (§3, §4.4).

use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::addr::Addr;
use crate::crc::crc32;
use crate::error::Error;
use crate::hal::{Hal, IoOp};

pub const ANCHOR_BYTES: usize = 116;
pub const INLINE_NAME_BYTES: usize = 28;

/// `data_class` bits, teacher `has_*` flag-wrapper idiom.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataClassFlags(pub u64);

impl DataClassFlags {
    pub const VALID: u64 = 0x01;
    pub const TOMBSTONE: u64 = 0x02;
    pub const IS_DIRECTORY: u64 = 0x04;
    pub const HORIZON_HINT: u64 = 0x08;
    pub const EXTENDED_NAME: u64 = 0x10;

    pub fn has_valid(&self) -> bool { self.0 & Self::VALID != 0 }
    pub fn has_tombstone(&self) -> bool { self.0 & Self::TOMBSTONE != 0 }
    pub fn has_is_directory(&self) -> bool { self.0 & Self::IS_DIRECTORY != 0 }
    pub fn has_horizon_hint(&self) -> bool { self.0 & Self::HORIZON_HINT != 0 }
    pub fn has_extended_name(&self) -> bool { self.0 & Self::EXTENDED_NAME != 0 }

    pub fn set(&mut self, bit: u64) { self.0 |= bit; }
    pub fn clear(&mut self, bit: u64) { self.0 &= !bit; }
}

/// Fixed-size file record placed in the nano-cortex (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Anchor {
    pub seed_id: u128,
    pub public_id: u128,
    pub gravity_center: u64,
    /// 48-bit stride; the top 16 bits are always zero.
    pub orbit_vector: u64,
    pub fractal_scale: u16,
    pub mass: u64,
    pub permissions: u32,
    pub create_clock: u32,
    pub mod_clock: u64,
    pub write_gen: u32,
    pub data_class: DataClassFlags,
    /// Inline name, or (if `has_extended_name`) the first 8 bytes hold the
    /// little-endian LBA of the extension block that holds the full name
    /// (§3, §9 Open Questions: 28-byte inline, spill regardless of name
    /// length choice).
    pub inline_buffer: [u8; INLINE_NAME_BYTES],
}

impl Anchor {
    pub fn new(seed_id: u128, public_id: u128, create_clock: u32) -> Self
    {
        Self {
            seed_id,
            public_id,
            gravity_center: 0,
            orbit_vector: 0,
            fractal_scale: 0,
            mass: 0,
            permissions: 0,
            create_clock,
            mod_clock: create_clock as u64,
            write_gen: 0,
            data_class: DataClassFlags(DataClassFlags::VALID),
            inline_buffer: [0u8; INLINE_NAME_BYTES],
        }
    }

    pub fn set_name(&mut self, name: &str)
    {
        let bytes = name.as_bytes();

        if bytes.len() <= INLINE_NAME_BYTES {
            self.inline_buffer = [0u8; INLINE_NAME_BYTES];
            self.inline_buffer[..bytes.len()].copy_from_slice(bytes);
            self.data_class.clear(DataClassFlags::EXTENDED_NAME);
        } else {
            // Extension block LBA is filled in by the caller once the
            // block is allocated; placeholder zero here.
            self.inline_buffer = [0u8; INLINE_NAME_BYTES];
            self.data_class.set(DataClassFlags::EXTENDED_NAME);
        }
    }

    pub fn inline_name(&self) -> Option<String>
    {
        if self.data_class.has_extended_name() {
            return None;
        }

        let end = self.inline_buffer.iter().position(|&b| b == 0).unwrap_or(INLINE_NAME_BYTES);
        String::from_utf8(self.inline_buffer[..end].to_vec()).ok()
    }

    pub fn extension_lba(&self) -> Option<Addr>
    {
        if !self.data_class.has_extended_name() {
            return None;
        }

        Some(Addr::from_u64(u64::from_le_bytes(self.inline_buffer[0..8].try_into().unwrap())))
    }

    pub fn set_extension_lba(&mut self, lba: Addr)
    {
        self.inline_buffer[0..8].copy_from_slice(&lba.to_u64_checked().unwrap_or(0).to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; ANCHOR_BYTES]
    {
        let mut buf = [0u8; ANCHOR_BYTES];
        let mut w = 0;

        buf[w..w + 16].copy_from_slice(&self.seed_id.to_le_bytes()); w += 16;
        buf[w..w + 16].copy_from_slice(&self.public_id.to_le_bytes()); w += 16;
        buf[w..w + 8].copy_from_slice(&self.gravity_center.to_le_bytes()); w += 8;
        buf[w..w + 6].copy_from_slice(&self.orbit_vector.to_le_bytes()[0..6]); w += 6;
        buf[w..w + 2].copy_from_slice(&self.fractal_scale.to_le_bytes()); w += 2;
        buf[w..w + 8].copy_from_slice(&self.mass.to_le_bytes()); w += 8;
        buf[w..w + 4].copy_from_slice(&self.permissions.to_le_bytes()); w += 4;
        buf[w..w + 4].copy_from_slice(&self.create_clock.to_le_bytes()); w += 4;
        buf[w..w + 8].copy_from_slice(&self.mod_clock.to_le_bytes()); w += 8;
        buf[w..w + 4].copy_from_slice(&self.write_gen.to_le_bytes()); w += 4;
        buf[w..w + 8].copy_from_slice(&self.data_class.0.to_le_bytes()); w += 8;
        buf[w..w + INLINE_NAME_BYTES].copy_from_slice(&self.inline_buffer); w += INLINE_NAME_BYTES;

        let checksum = crc32(&buf[..w]);
        buf[w..w + 4].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    pub fn from_bytes(buf: &[u8; ANCHOR_BYTES]) -> Result<Self, Error>
    {
        let stored_checksum = u32::from_le_bytes(buf[ANCHOR_BYTES - 4..].try_into().unwrap());
        if crc32(&buf[..ANCHOR_BYTES - 4]) != stored_checksum {
            return Err(Error::HeaderRot);
        }

        let mut r = 0;
        macro_rules! take_arr {
            ($n:expr) => {{ let a: [u8; $n] = buf[r..r + $n].try_into().unwrap(); r += $n; a }};
        }

        let seed_id = u128::from_le_bytes(take_arr!(16));
        let public_id = u128::from_le_bytes(take_arr!(16));
        let gravity_center = u64::from_le_bytes(take_arr!(8));
        let mut orbit_buf = [0u8; 8];
        orbit_buf[0..6].copy_from_slice(&take_arr!(6));
        let orbit_vector = u64::from_le_bytes(orbit_buf);
        let fractal_scale = u16::from_le_bytes(take_arr!(2));
        let mass = u64::from_le_bytes(take_arr!(8));
        let permissions = u32::from_le_bytes(take_arr!(4));
        let create_clock = u32::from_le_bytes(take_arr!(4));
        let mod_clock = u64::from_le_bytes(take_arr!(8));
        let write_gen = u32::from_le_bytes(take_arr!(4));
        let data_class = u64::from_le_bytes(take_arr!(8));
        let inline_buffer: [u8; INLINE_NAME_BYTES] = take_arr!(INLINE_NAME_BYTES);

        Ok(Self {
            seed_id,
            public_id,
            gravity_center,
            orbit_vector,
            fractal_scale,
            mass,
            permissions,
            create_clock,
            mod_clock,
            write_gen,
            data_class: DataClassFlags(data_class),
            inline_buffer,
        })
    }
}

/// The in-RAM anchor slot array, backed by a persistent region starting at
/// `cortex_start`. Lookups hash `seed_id` into a slot index; collisions
/// walk linearly (§4.4).
pub struct NanoCortex {
    slots: Vec<Mutex<Option<Anchor>>>,
    table_lock: Mutex<()>,
    cortex_start: Addr,
    block_size: u32,
}

impl NanoCortex {
    pub fn new(slot_count: usize, cortex_start: Addr, block_size: u32) -> Self
    {
        Self {
            slots: (0..slot_count).map(|_| Mutex::new(None)).collect(),
            table_lock: Mutex::new(()),
            cortex_start,
            block_size,
        }
    }

    /// Wipes every cached anchor's identity fields in place before the
    /// table itself is dropped (§3 "destroyed by unmount with secure
    /// zeroing"). The durable slots on the device are untouched; this
    /// only scrubs the in-RAM cache rebuilt by `recover`.
    pub fn secure_zero_all(&self)
    {
        for slot in &self.slots {
            let mut guard = slot.lock();
            if let Some(anchor) = guard.as_mut() {
                anchor.seed_id.zeroize();
                anchor.public_id.zeroize();
                anchor.gravity_center.zeroize();
                anchor.orbit_vector.zeroize();
                anchor.inline_buffer.zeroize();
            }
            *guard = None;
        }
    }

    /// Rebuilds the in-RAM cache from the persistent slot array at mount
    /// time (§12: the cortex cache does not survive unmount, but the
    /// durable slots do).
    pub fn recover(hal: &dyn Hal, slot_count: usize, cortex_start: Addr, block_size: u32) -> Self
    {
        let cortex = Self::new(slot_count, cortex_start, block_size);

        for index in 0..slot_count {
            let mut buf = vec![0u8; block_size as usize];
            if hal.sync_io(IoOp::Read, cortex.slot_offset(index), &mut buf, 1).is_err() {
                continue;
            }

            if buf.len() < ANCHOR_BYTES {
                continue;
            }

            let slice: [u8; ANCHOR_BYTES] = match buf[..ANCHOR_BYTES].try_into() {
                Ok(a) => a,
                Err(_) => continue,
            };

            if let Ok(anchor) = Anchor::from_bytes(&slice) {
                if anchor.data_class.has_valid() {
                    *cortex.slots[index].lock() = Some(anchor);
                }
            }
        }

        cortex
    }

    pub fn slot_count(&self) -> usize
    {
        self.slots.len()
    }

    fn hash_slot(&self, seed_id: u128) -> usize
    {
        let mixed = (seed_id as u64) ^ ((seed_id >> 64) as u64);
        (mixed as usize) % self.slots.len().max(1)
    }

    /// `cortex_start` is a block index; one anchor slot occupies exactly
    /// one block, so this converts directly to the byte offset
    /// `hal.sync_io` expects.
    fn slot_offset(&self, index: usize) -> Addr
    {
        let (base, _) = self.cortex_start.mul_by_u64(self.block_size as u64);
        let (delta, _) = Addr::from_u64(index as u64).mul_by_u64(self.block_size as u64);
        base.checked_add(&delta).0
    }

    fn write_anchor_at(&self, hal: &dyn Hal, index: usize, anchor: &Anchor) -> Result<(), Error>
    {
        let mut buf = vec![0u8; self.block_size as usize];
        let encoded = anchor.to_bytes();
        buf[..encoded.len()].copy_from_slice(&encoded);

        hal.sync_io(IoOp::Write, self.slot_offset(index), &mut buf, 1).map_err(|_| Error::HwIo)?;
        Ok(())
    }

    /// Finds the in-RAM slot index owning `seed_id`, if any.
    pub fn lookup(&self, seed_id: u128) -> Option<usize>
    {
        let start = self.hash_slot(seed_id);

        for probe in 0..self.slots.len() {
            let index = (start + probe) % self.slots.len();
            let guard = self.slots[index].lock();

            match guard.as_ref() {
                Some(a) if a.data_class.has_valid() && a.seed_id == seed_id => return Some(index),
                None => return None, // hit a truly empty slot: the probe chain ends here
                _ => continue,
            }
        }

        None
    }

    pub fn get(&self, index: usize) -> Option<Anchor>
    {
        self.slots.get(index).and_then(|s| s.lock().clone())
    }

    /// Scans for a `Valid && Tombstone` slot whose inline name matches
    /// (§4.3.4 Lazarus step 1).
    pub fn find_tombstoned_by_name(&self, name: &str) -> Option<usize>
    {
        for (index, slot) in self.slots.iter().enumerate() {
            let guard = slot.lock();
            if let Some(a) = guard.as_ref() {
                if a.data_class.has_valid() && a.data_class.has_tombstone() && a.inline_name().as_deref() == Some(name) {
                    return Some(index);
                }
            }
        }

        None
    }

    /// Scans for a live (`Valid && !Tombstone`) slot whose inline name
    /// matches. Linear, same as `find_tombstoned_by_name` — §9 Non-goals
    /// excludes a directory index, so lookup-by-name is a full table scan.
    pub fn find_by_name(&self, name: &str) -> Option<usize>
    {
        for (index, slot) in self.slots.iter().enumerate() {
            let guard = slot.lock();
            if let Some(a) = guard.as_ref() {
                if a.data_class.has_valid() && !a.data_class.has_tombstone() && a.inline_name().as_deref() == Some(name) {
                    return Some(index);
                }
            }
        }

        None
    }

    /// Reserves a free slot (Valid=0 or Tombstone=1) for a new anchor,
    /// marking it Valid under the table lock so concurrent creators do not
    /// double-claim it, then durably commits before publishing to the
    /// in-RAM cache (§4.4 Creation; §5 ordering).
    pub fn create(&self, hal: &dyn Hal, mut anchor: Anchor) -> Result<usize, Error>
    {
        let _table_guard = self.table_lock.lock();
        let start = self.hash_slot(anchor.seed_id);

        let mut found = None;
        for probe in 0..self.slots.len() {
            let index = (start + probe) % self.slots.len();
            let guard = self.slots[index].lock();
            let is_free = match guard.as_ref() {
                None => true,
                Some(a) => !a.data_class.has_valid() || a.data_class.has_tombstone(),
            };

            if is_free {
                found = Some(index);
                break;
            }
        }

        let index = found.ok_or(Error::Enospc)?;

        anchor.data_class.set(DataClassFlags::VALID);
        anchor.data_class.clear(DataClassFlags::TOMBSTONE);

        self.write_anchor_at(hal, index, &anchor)?;

        *self.slots[index].lock() = Some(anchor);

        Ok(index)
    }

    /// Writes the full anchor record at its persistent slot offset, then
    /// refreshes the in-RAM cache only after the durable write succeeds
    /// (§4.4 Update).
    pub fn write_anchor_atomic(&self, hal: &dyn Hal, index: usize, anchor: &Anchor) -> Result<(), Error>
    {
        self.write_anchor_at(hal, index, anchor)?;
        *self.slots[index].lock() = Some(anchor.clone());
        Ok(())
    }

    /// Sets the Tombstone bit, bumps `mod_clock`, and commits (§4.4
    /// Deletion).
    pub fn tombstone(&self, hal: &dyn Hal, index: usize, now_ns: u64) -> Result<(), Error>
    {
        let mut anchor = self.slots.get(index).and_then(|s| s.lock().clone()).ok_or(Error::NotFound)?;

        anchor.data_class.set(DataClassFlags::TOMBSTONE);
        anchor.mod_clock = now_ns;

        self.write_anchor_atomic(hal, index, &anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemHal;

    fn hal_with_cortex() -> MemHal
    {
        MemHal::new(1 << 20, 512)
    }

    #[test]
    fn anchor_byte_roundtrip()
    {
        let mut a = Anchor::new(0x1111, 0x2222, 7);
        a.set_name("hello.txt");
        a.mass = 4096;
        a.orbit_vector = 0xABCDEF;

        let bytes = a.to_bytes();
        let parsed = Anchor::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, a);
        assert_eq!(parsed.inline_name().unwrap(), "hello.txt");
    }

    #[test]
    fn corrupt_anchor_checksum_rejected()
    {
        let a = Anchor::new(1, 2, 0);
        let mut bytes = a.to_bytes();
        bytes[0] ^= 0xFF;

        assert_eq!(Anchor::from_bytes(&bytes), Err(Error::HeaderRot));
    }

    #[test]
    fn create_then_lookup_finds_same_slot()
    {
        let hal = hal_with_cortex();
        let cortex = NanoCortex::new(64, Addr::from_u64(0), 512);

        let mut a = Anchor::new(0xDEAD_BEEF, 1, 0);
        a.set_name("file.bin");

        let index = cortex.create(&hal, a.clone()).unwrap();
        let found = cortex.lookup(0xDEAD_BEEF).unwrap();

        assert_eq!(index, found);
        assert_eq!(cortex.get(found).unwrap().inline_name().unwrap(), "file.bin");
    }

    #[test]
    fn tombstone_then_find_by_name()
    {
        let hal = hal_with_cortex();
        let cortex = NanoCortex::new(64, Addr::from_u64(0), 512);

        let mut a = Anchor::new(42, 1, 0);
        a.set_name("deleted.txt");
        let index = cortex.create(&hal, a).unwrap();

        cortex.tombstone(&hal, index, 999).unwrap();

        let found = cortex.find_tombstoned_by_name("deleted.txt").unwrap();
        assert_eq!(found, index);
        assert_eq!(cortex.get(index).unwrap().mod_clock, 999);
    }

    #[test]
    fn long_name_sets_extended_name_flag()
    {
        let mut a = Anchor::new(1, 1, 0);
        a.set_name(&"x".repeat(40));

        assert!(a.data_class.has_extended_name());
        assert_eq!(a.inline_name(), None);
    }
}
