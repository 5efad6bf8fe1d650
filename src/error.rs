//! The error/info taxonomy.
//!
//! The C source this core was distilled from shares one signed-integer enum
//! between informational and failing outcomes (positive = info, negative =
//! error, zero = OK) so that C callers could switch on a single return code.
//! Rust has a strictly better idiom for "succeeded, but the caller might
//! want to know something about how": an `Outcome<T>` riding inside
//! `Result::Ok`, with the hard failures in `Result::Err`.

use std::fmt;
use thiserror::Error;

/// Informational outcomes a successful operation may want to surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Info {
    /// A single-bit ECC error was detected and corrected in place.
    Healed,
    /// A Genesis or Block allocation was redirected to the horizon path.
    HorizonFallback,
    /// A Horizon allocation crossed a full lap of the ring; the caller must
    /// mark the volume Dirty (probing alone, without an allocation, does
    /// not count).
    HorizonWrapped,
    /// A read returned zero-fill because the logical index was never
    /// written (not because the block went missing).
    Sparse,
}

/// A successful result, optionally carrying an [`Info`] the caller may log
/// or otherwise act on; absence of `info` is the plain-success case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    pub info: Option<Info>,
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self
    {
        Self { value, info: None }
    }

    pub fn with_info(value: T, info: Info) -> Self
    {
        Self { value, info: Some(info) }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U>
    {
        Outcome { value: f(self.value), info: self.info }
    }
}

pub type HnResult<T> = Result<Outcome<T>, Error>;

/// Hard failures. §7 of the design calls for "surface" as the default
/// recovery action unless noted otherwise on the variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No free block could be found within policy (device-class/metadata
    /// constraints exhausted the search).
    #[error("no space left on device")]
    Enospc,
    /// Global saturation trip: the volume is latched Runtime-Saturated and
    /// this operation cannot be redirected to the horizon.
    #[error("event horizon: volume is saturated")]
    EventHorizon,
    /// All ballistic orbits for a scaled-block (`fractal_scale > 0`) anchor
    /// were exhausted; the horizon cannot absorb scaled blocks.
    #[error("gravity collapse: scaled-block trajectory exhausted")]
    GravityCollapse,
    /// A geometry or bounds violation (out-of-range block index, malformed
    /// ring, non-block-size-aligned region, ...).
    #[error("geometry violation: {0}")]
    Geometry(&'static str),
    /// Double-bit (or otherwise unrecoverable) ECC error detected in the
    /// void bitmap, carrying the offending word index. The volume's PANIC
    /// flag is set as a side effect by the caller holding the volume handle
    /// (`VoidBitmap` itself has no reference to the volume's state).
    #[error("bitmap corrupt: uncorrectable ECC error in word {0}")]
    BitmapCorrupt(u64),
    /// Payload CRC mismatch with no mirror available.
    #[error("data rot: payload checksum mismatch")]
    DataRot,
    /// Header CRC mismatch.
    #[error("header rot: header checksum mismatch")]
    HeaderRot,
    /// Block's `well_id` does not match the anchor's `seed_id`.
    #[error("identity mismatch: well_id does not match seed_id")]
    IdMismatch,
    /// The HAL reported an I/O failure.
    #[error("hardware I/O error")]
    HwIo,
    /// Unmount attempted with `ref_count > 1`.
    #[error("volume busy: open handles remain")]
    Busy,
    /// A write was attempted through a read-only/snapshot view.
    #[error("time paradox: write attempted on a snapshot view")]
    TimeParadox,
    /// The quality mask rejected every candidate block (caller should
    /// advance to the next orbit, not surface unless every `k` is exhausted).
    #[error("media toxic: quality mask rejected candidate block")]
    MediaToxic,
    /// Policy denied the operation.
    #[error("access denied")]
    AccessDenied,
    /// The target anchor/file is marked immutable.
    #[error("immutable")]
    Immutable,
    /// No anchor or block matches the lookup.
    #[error("not found")]
    NotFound,
    /// A live anchor already exists under the requested name.
    #[error("already exists")]
    Eexist,
}

/// POSIX-style error code, for adapters that need to map core errors onto a
/// `errno`-shaped surface. The adapter itself is external (§1); this table
/// is part of the taxonomy the adapter consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PosixCode {
    ENOENT,
    EACCES,
    EPERM,
    ENOSPC,
    EEXIST,
    EIO,
    EROFS,
}

impl fmt::Display for PosixCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "{:?}", self)
    }
}

impl Error {
    /// Maps a core error onto the POSIX-style code an adapter would return
    /// to a caller, per §7's "User-visible failures" table. Variants with
    /// no direct POSIX analogue (e.g. `BitmapCorrupt`) return `None`: the
    /// adapter is expected to fall back to a generic `EIO` for those.
    pub fn posix_code(&self) -> Option<PosixCode>
    {
        match self {
            Error::NotFound => Some(PosixCode::ENOENT),
            Error::AccessDenied => Some(PosixCode::EACCES),
            Error::Immutable => Some(PosixCode::EPERM),
            Error::Enospc => Some(PosixCode::ENOSPC),
            Error::HwIo => Some(PosixCode::EIO),
            Error::Busy => Some(PosixCode::EROFS),
            Error::Eexist => Some(PosixCode::EEXIST),
            _ => None,
        }
    }
}
