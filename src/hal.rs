//! The HAL contract (§6).
//!
//! The block-layer HAL is an external collaborator: synchronous I/O, zone
//! resets, barriers, capability discovery, RNG and the clock all live
//! outside the core. This module defines the seam the core calls through,
//! plus two reference implementations (`MemHal`, `FileHal`) so the rest of
//! the crate is testable and demonstrable without a real device driver.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;

use crate::addr::Addr;
use crate::error::Error;

/// The operation requested of `sync_io`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    ZoneReset,
    ZoneAppend,
}

/// Hardware capability flags (teacher `has_*` idiom, mirroring
/// `e2fs::CompatFeatures`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwFlags(pub u32);

impl HwFlags {
    pub const ZNS_NATIVE: u32 = 0x1;
    pub const NVM: u32 = 0x2;
    pub const ROTATIONAL: u32 = 0x4;

    pub fn has_zns_native(&self) -> bool { self.0 & Self::ZNS_NATIVE != 0 }
    pub fn has_nvm(&self) -> bool { self.0 & Self::NVM != 0 }
    pub fn has_rotational(&self) -> bool { self.0 & Self::ROTATIONAL != 0 }
}

/// Device capabilities, as reported by `get_caps`.
#[derive(Clone, Copy, Debug)]
pub struct Caps {
    pub total_capacity: Addr,
    pub logical_block_size: u32,
    pub flags: HwFlags,
}

/// The HAL contract. All calls are synchronous from the caller's
/// perspective (§5: "no async runtime").
pub trait Hal: Send + Sync {
    /// Performs a synchronous I/O operation. For `ZoneAppend`, the
    /// implementation returns the physical LBA actually written, which may
    /// differ from the requested `lba`.
    fn sync_io(&self, op: IoOp, lba: Addr, buf: &mut [u8], sectors: u32) -> Result<Option<Addr>, Error>;

    /// Orders prior writes before subsequent ones.
    fn barrier(&self) -> Result<(), Error>;

    fn get_caps(&self) -> Caps;

    /// Monotonic nanosecond clock.
    fn get_time_ns(&self) -> u64;

    /// Cryptographically-adequate random value.
    fn get_random_u64(&self) -> u64;
}

/// An in-memory HAL backed by a `Vec<u8>`. Used by unit and integration
/// tests; never the production device path.
pub struct MemHal {
    storage: Mutex<Vec<u8>>,
    block_size: u32,
    flags: HwFlags,
    clock: AtomicU64,
    rng: Mutex<rand::rngs::StdRng>,
}

impl MemHal {
    pub fn new(capacity_bytes: u64, block_size: u32) -> Self
    {
        use rand::SeedableRng;

        Self {
            storage: Mutex::new(vec![0u8; capacity_bytes as usize]),
            block_size,
            flags: HwFlags(HwFlags::NVM),
            clock: AtomicU64::new(0),
            rng: Mutex::new(rand::rngs::StdRng::seed_from_u64(0x4845_4c4c)),
        }
    }

    pub fn with_flags(mut self, flags: HwFlags) -> Self
    {
        self.flags = flags;
        self
    }
}

impl Hal for MemHal {
    fn sync_io(&self, op: IoOp, lba: Addr, buf: &mut [u8], sectors: u32) -> Result<Option<Addr>, Error>
    {
        let offset = lba.to_u64_checked().ok_or(Error::Geometry("lba exceeds 64 bits on MemHal"))? as usize;
        let len = (sectors as usize) * self.block_size as usize;
        let mut storage = self.storage.lock();

        if offset + len > storage.len() {
            return Err(Error::Geometry("I/O request exceeds device capacity"));
        }

        match op {
            IoOp::Read => {
                buf[..len].copy_from_slice(&storage[offset..offset + len]);
                Ok(None)
            }
            IoOp::Write | IoOp::ZoneAppend => {
                storage[offset..offset + len].copy_from_slice(&buf[..len]);
                Ok(if op == IoOp::ZoneAppend { Some(lba) } else { None })
            }
            IoOp::Flush => Ok(None),
            IoOp::ZoneReset => {
                storage[offset..offset + len].fill(0);
                Ok(None)
            }
        }
    }

    fn barrier(&self) -> Result<(), Error>
    {
        Ok(())
    }

    fn get_caps(&self) -> Caps
    {
        Caps {
            total_capacity: Addr::from_u64(self.storage.lock().len() as u64),
            logical_block_size: self.block_size,
            flags: self.flags,
        }
    }

    fn get_time_ns(&self) -> u64
    {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn get_random_u64(&self) -> u64
    {
        use rand::RngCore;

        self.rng.lock().next_u64()
    }
}

/// A file-backed HAL, used by the demo binary against a real (or
/// loopback) block device path.
pub struct FileHal {
    file: Mutex<File>,
    block_size: u32,
    flags: HwFlags,
    rng: Mutex<rand::rngs::StdRng>,
}

impl FileHal {
    pub fn new(file: File, block_size: u32, flags: HwFlags) -> Self
    {
        use rand::SeedableRng;

        Self {
            file: Mutex::new(file),
            block_size,
            flags,
            rng: Mutex::new(rand::rngs::StdRng::from_entropy()),
        }
    }
}

impl Hal for FileHal {
    fn sync_io(&self, op: IoOp, lba: Addr, buf: &mut [u8], sectors: u32) -> Result<Option<Addr>, Error>
    {
        let offset = lba.to_u64_checked().ok_or(Error::Geometry("lba exceeds 64 bits on FileHal"))?;
        let len = (sectors as usize) * self.block_size as usize;
        let mut file = self.file.lock();

        file.seek(SeekFrom::Start(offset)).map_err(|_| Error::HwIo)?;

        match op {
            IoOp::Read => {
                file.read_exact(&mut buf[..len]).map_err(|_| Error::HwIo)?;
                Ok(None)
            }
            IoOp::Write | IoOp::ZoneAppend => {
                file.write_all(&buf[..len]).map_err(|_| Error::HwIo)?;
                Ok(if op == IoOp::ZoneAppend { Some(lba) } else { None })
            }
            IoOp::Flush => {
                file.flush().map_err(|_| Error::HwIo)?;
                file.sync_data().map_err(|_| Error::HwIo)?;
                Ok(None)
            }
            IoOp::ZoneReset => {
                let zeros = vec![0u8; len];
                file.write_all(&zeros).map_err(|_| Error::HwIo)?;
                Ok(None)
            }
        }
    }

    fn barrier(&self) -> Result<(), Error>
    {
        self.file.lock().sync_data().map_err(|_| Error::HwIo)
    }

    fn get_caps(&self) -> Caps
    {
        let len = self.file.lock().metadata().map(|m| m.len()).unwrap_or(0);

        Caps {
            total_capacity: Addr::from_u64(len),
            logical_block_size: self.block_size,
            flags: self.flags,
        }
    }

    fn get_time_ns(&self) -> u64
    {
        use std::time::{SystemTime, UNIX_EPOCH};

        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn get_random_u64(&self) -> u64
    {
        use rand::RngCore;

        self.rng.lock().next_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_hal_write_then_read_roundtrips()
    {
        let hal = MemHal::new(4096, 512);
        let mut write_buf = vec![0xAB; 512];

        hal.sync_io(IoOp::Write, Addr::from_u64(0), &mut write_buf, 1).unwrap();

        let mut read_buf = vec![0u8; 512];
        hal.sync_io(IoOp::Read, Addr::from_u64(0), &mut read_buf, 1).unwrap();

        assert_eq!(read_buf, write_buf);
    }

    #[test]
    fn mem_hal_zone_reset_zeroes()
    {
        let hal = MemHal::new(4096, 512);
        let mut write_buf = vec![0xFF; 512];
        hal.sync_io(IoOp::Write, Addr::from_u64(0), &mut write_buf, 1).unwrap();

        let mut discard = vec![0u8; 512];
        hal.sync_io(IoOp::ZoneReset, Addr::from_u64(0), &mut discard, 1).unwrap();

        let mut read_buf = vec![0xAAu8; 512];
        hal.sync_io(IoOp::Read, Addr::from_u64(0), &mut read_buf, 1).unwrap();

        assert!(read_buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn mem_hal_out_of_bounds_is_geometry_error()
    {
        let hal = MemHal::new(512, 512);
        let mut buf = vec![0u8; 512];

        let err = hal.sync_io(IoOp::Read, Addr::from_u64(512), &mut buf, 1).unwrap_err();

        assert_eq!(err, Error::Geometry("I/O request exceeds device capacity"));
    }

    #[test]
    fn hw_flags_report_set_bits()
    {
        let flags = HwFlags(HwFlags::ZNS_NATIVE | HwFlags::NVM);

        assert!(flags.has_zns_native());
        assert!(flags.has_nvm());
        assert!(!flags.has_rotational());
    }
}
