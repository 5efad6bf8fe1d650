//! The Armored Void Bitmap: an ECC-protected, versioned, shard-locked
//! free-space map with a two-level summary index and self-healing reads
//! (§4.2).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::error::{Error, HnResult, Info, Outcome};

pub const BLOCKS_PER_WORD: u64 = 64;
pub const WORDS_PER_L2_GROUP: u64 = 8;
pub const BLOCKS_PER_L2_BIT: u64 = BLOCKS_PER_WORD * WORDS_PER_L2_GROUP;
const SHARD_COUNT: usize = 64;
const VERSION_MASK56: u64 = (1u64 << 56) - 1;

/// A 128-bit armored bitmap cell: 64 data bits, SEC-DED ECC, and a 56-bit
/// monotonic version. `#[repr(align(16))]` satisfies the alignment a real
/// 128-bit CAS would require; this port serializes the word explicitly
/// rather than relying on that layout matching the on-disk image (§9).
#[repr(align(16))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArmoredWord {
    pub data: u64,
    pub ecc: u8,
    /// Low byte of the 56-bit version counter (named `reserved` per the
    /// on-disk record in §3 — it carries version bits, not padding).
    pub reserved: u8,
    pub ver_lo: u16,
    pub ver_hi: u32,
}

impl Default for ArmoredWord {
    fn default() -> Self
    {
        let mut w = Self { data: 0, ecc: 0, reserved: 0, ver_lo: 0, ver_hi: 0 };
        w.ecc = compute_ecc(0);
        w
    }
}

impl ArmoredWord {
    pub fn to_bytes(self) -> [u8; 16]
    {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.data.to_le_bytes());
        buf[8] = self.ecc;
        buf[9] = self.reserved;
        buf[10..12].copy_from_slice(&self.ver_lo.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ver_hi.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; 16]) -> Self
    {
        Self {
            data: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            ecc: buf[8],
            reserved: buf[9],
            ver_lo: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            ver_hi: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    fn version_raw(&self) -> u64
    {
        (self.reserved as u64) | ((self.ver_lo as u64) << 8) | ((self.ver_hi as u64) << 24)
    }

    fn set_version_raw(&mut self, raw: u64)
    {
        let raw = raw & VERSION_MASK56;
        self.reserved = raw as u8;
        self.ver_lo = (raw >> 8) as u16;
        self.ver_hi = (raw >> 24) as u32;
    }

    /// Bumps the version counter, XORed with the per-volume epoch mask
    /// (§4.2.3). Healing does not call this — healing preserves the
    /// version.
    fn bump_version(&mut self, epoch_mask: u64)
    {
        let logical = self.version_raw() ^ (epoch_mask & VERSION_MASK56);
        let next = (logical.wrapping_add(1)) & VERSION_MASK56;
        self.set_version_raw(next ^ (epoch_mask & VERSION_MASK56));
    }
}

/// Parity bit `k` covers every data bit whose 1-indexed position has bit
/// `k` set — standard Hamming parity-group construction.
fn parity_bits(data: u64) -> [bool; 7]
{
    let mut p = [false; 7];

    for bitpos in 0..64u32 {
        if (data >> bitpos) & 1 == 1 {
            let position = bitpos + 1;
            for (k, slot) in p.iter_mut().enumerate() {
                if (position >> k) & 1 == 1 {
                    *slot = !*slot;
                }
            }
        }
    }

    p
}

fn global_parity(data: u64, parity: &[bool; 7]) -> bool
{
    let mut g = data.count_ones() % 2 == 1;
    for &b in parity {
        if b {
            g = !g;
        }
    }
    g
}

fn compute_ecc(data: u64) -> u8
{
    let p = parity_bits(data);
    let g = global_parity(data, &p);

    let mut ecc = 0u8;
    for (k, &bit) in p.iter().enumerate() {
        if bit {
            ecc |= 1 << k;
        }
    }
    if g {
        ecc |= 1 << 7;
    }

    ecc
}

/// Lazily-initialized syndrome → corrected-bit-position table (§4.2.2
/// point 6). `None` at an index means the syndrome either indicates no
/// data-bit error (syndrome 0) or an error confined to a parity bit
/// (syndrome > 64), neither of which requires flipping a data bit.
fn syndrome_lut() -> &'static [Option<u8>; 128]
{
    static LUT: OnceLock<[Option<u8>; 128]> = OnceLock::new();

    LUT.get_or_init(|| {
        let mut table = [None; 128];
        for (syndrome, slot) in table.iter_mut().enumerate().take(65).skip(1) {
            *slot = Some((syndrome - 1) as u8);
        }
        table
    })
}

enum EccCheck {
    Clean,
    SingleBit { corrected_data: u64 },
    Double,
}

fn check_and_correct(data: u64, stored_ecc: u8) -> EccCheck
{
    let computed_parity = parity_bits(data);
    let stored_parity: [bool; 7] = std::array::from_fn(|k| (stored_ecc >> k) & 1 == 1);

    let mut syndrome: usize = 0;
    for k in 0..7 {
        if computed_parity[k] != stored_parity[k] {
            syndrome |= 1 << k;
        }
    }

    let computed_global = global_parity(data, &computed_parity);
    let stored_global = (stored_ecc >> 7) & 1 == 1;
    // The raw parity comparison alone flips in and out of agreement as the
    // corrupted bit's 1-indexed position's popcount changes; fold in the
    // syndrome's own parity so any nonzero syndrome reads as a mismatch.
    let global_mismatch = (computed_global != stored_global) ^ (syndrome.count_ones() % 2 == 1);

    match (syndrome, global_mismatch) {
        (0, false) => EccCheck::Clean,
        (0, true) => EccCheck::SingleBit { corrected_data: data },
        (s, true) => match syndrome_lut().get(s).copied().flatten() {
            Some(bitpos) => EccCheck::SingleBit { corrected_data: data ^ (1u64 << bitpos) },
            None => EccCheck::SingleBit { corrected_data: data },
        },
        (_, false) => EccCheck::Double,
    }
}

/// The mutating operation requested of `bitmap_op` (§4.2, intro).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    Test,
    Set,
    Clear,
    ForceClear,
}

/// A plain array of armored words partitioned across `SHARD_COUNT` lock
/// shards, `shard = (word_index / 64) % 64` (§4.2.1). Shared by the L3
/// free-space bitmap and the L2 summary index — both are "array indexed
/// by integer offsets" per §9, not graphs.
struct ArmoredWordArray {
    shards: Vec<Mutex<Vec<ArmoredWord>>>,
    word_count: u64,
}

impl ArmoredWordArray {
    fn new(word_count: u64) -> Self
    {
        let mut shards: Vec<Mutex<Vec<ArmoredWord>>> = (0..SHARD_COUNT).map(|_| Mutex::new(Vec::new())).collect();

        for word_index in 0..word_count {
            let shard = Self::shard_of(word_index);
            shards[shard].lock().push(ArmoredWord::default());
        }

        Self { shards, word_count }
    }

    fn shard_of(word_index: u64) -> usize
    {
        ((word_index / 64) % 64) as usize
    }

    fn local_of(word_index: u64) -> usize
    {
        (((word_index / 4096) * 64) + (word_index % 64)) as usize
    }

    /// Runs `f` against the word at `word_index` under its shard lock.
    fn with_word<R>(&self, word_index: u64, f: impl FnOnce(&mut ArmoredWord) -> R) -> Result<R, Error>
    {
        if word_index >= self.word_count {
            return Err(Error::Geometry("armored word index out of range"));
        }

        let shard = Self::shard_of(word_index);
        let local = Self::local_of(word_index);
        let mut guard = self.shards[shard].lock();
        let word = guard.get_mut(local).ok_or(Error::Geometry("armored word index out of range"))?;

        Ok(f(word))
    }

    /// Scrubs every cached word's data and version bits in place.
    fn secure_zero_all(&self)
    {
        for shard in &self.shards {
            let mut guard = shard.lock();
            for word in guard.iter_mut() {
                word.data.zeroize();
                word.ver_lo.zeroize();
                word.ver_hi.zeroize();
                word.ecc = compute_ecc(0);
            }
        }
    }
}

/// The Armored Void Bitmap: the L3 free-space map plus its L2 summary
/// index, both ECC-protected and shard-locked.
pub struct VoidBitmap {
    l3: ArmoredWordArray,
    l2: ArmoredWordArray,
    block_count: u64,
    version_epoch_mask: u64,
    heal_count: AtomicU64,
    panic: AtomicBool,
}

impl VoidBitmap {
    pub fn new(block_count: u64, volume_uuid: u128) -> Self
    {
        let l3_words = block_count.div_ceil(BLOCKS_PER_WORD).max(1);
        let l2_bits = block_count.div_ceil(BLOCKS_PER_L2_BIT).max(1);
        let l2_words = l2_bits.div_ceil(BLOCKS_PER_WORD).max(1);

        Self {
            l3: ArmoredWordArray::new(l3_words),
            l2: ArmoredWordArray::new(l2_words),
            block_count,
            version_epoch_mask: volume_uuid as u64,
            heal_count: AtomicU64::new(0),
            panic: AtomicBool::new(false),
        }
    }

    /// Wipes every cached L3/L2 word before the bitmap is dropped (§3
    /// "destroyed by unmount with secure zeroing"). The durable image on
    /// the device is untouched; this only scrubs the in-RAM cache.
    pub fn secure_zero_all(&self)
    {
        self.l3.secure_zero_all();
        self.l2.secure_zero_all();
    }

    pub fn block_count(&self) -> u64
    {
        self.block_count
    }

    pub fn heal_count(&self) -> u64
    {
        self.heal_count.load(Ordering::Relaxed)
    }

    pub fn is_panicked(&self) -> bool
    {
        self.panic.load(Ordering::Relaxed)
    }

    /// The single primitive through which all bitmap mutation and testing
    /// flows (§4.2 intro). `out_changed`/the returned `bool` is overloaded
    /// by `op`: for `Test` it is the bit's value, for the mutators it is
    /// true iff a physical flip occurred (§4.2.5).
    pub fn bitmap_op(&self, block_index: u64, op: BitOp) -> HnResult<bool>
    {
        if block_index >= self.block_count {
            return Err(Error::Geometry("bitmap block index out of range"));
        }

        let word_index = block_index / BLOCKS_PER_WORD;
        let bit = (block_index % BLOCKS_PER_WORD) as u32;

        let outcome = self.l3.with_word(word_index, |word| -> Result<(bool, Option<Info>), Error> {
            match check_and_correct(word.data, word.ecc) {
                EccCheck::Double => {
                    self.panic.store(true, Ordering::SeqCst);
                    return Err(Error::BitmapCorrupt(word_index));
                }
                EccCheck::SingleBit { corrected_data } => {
                    word.data = corrected_data;
                    word.ecc = compute_ecc(word.data);
                    self.heal_count.fetch_add(1, Ordering::Relaxed);

                    let result = self.apply_logical_op(word, bit, op);
                    return Ok((result, Some(Info::Healed)));
                }
                EccCheck::Clean => {}
            }

            let changed = self.apply_logical_op(word, bit, op);
            Ok((changed, None))
        })??;

        let (changed, info) = outcome;

        if matches!(op, BitOp::Set | BitOp::Clear | BitOp::ForceClear) {
            self.update_l2_after(block_index, op, changed)?;
        }

        Ok(match info {
            Some(i) => Outcome::with_info(changed, i),
            None => Outcome::ok(changed),
        })
    }

    /// Applies the logical op to an already-ECC-clean word, returning the
    /// overloaded bool contract of §4.2.5, and bumping the version for
    /// real mutations (healing already happened by the time this runs and
    /// must not itself bump the version, §4.2.3).
    fn apply_logical_op(&self, word: &mut ArmoredWord, bit: u32, op: BitOp) -> bool
    {
        let was_set = (word.data >> bit) & 1 == 1;

        match op {
            BitOp::Test => was_set,
            BitOp::Set => {
                if was_set {
                    false
                } else {
                    word.data |= 1 << bit;
                    word.ecc = compute_ecc(word.data);
                    word.bump_version(self.version_epoch_mask);
                    true
                }
            }
            BitOp::Clear | BitOp::ForceClear => {
                if !was_set {
                    false
                } else {
                    word.data &= !(1u64 << bit);
                    word.ecc = compute_ecc(word.data);
                    word.bump_version(self.version_epoch_mask);
                    true
                }
            }
        }
    }

    /// L2 coherence rules (§4.2.4). Runs after the L3 mutation has been
    /// committed, outside the L3 shard lock.
    fn update_l2_after(&self, block_index: u64, op: BitOp, l3_flipped: bool) -> Result<(), Error>
    {
        let l2_bit_index = block_index / BLOCKS_PER_L2_BIT;
        let l2_word_index = l2_bit_index / BLOCKS_PER_WORD;
        let l2_bit = (l2_bit_index % BLOCKS_PER_WORD) as u32;

        match op {
            BitOp::Set => {
                self.l2.with_word(l2_word_index, |word| {
                    if (word.data >> l2_bit) & 1 == 0 {
                        word.data |= 1 << l2_bit;
                        word.ecc = compute_ecc(word.data);
                        word.bump_version(self.version_epoch_mask);
                    }
                })?;
                Ok(())
            }
            BitOp::Clear | BitOp::ForceClear => {
                if !l3_flipped {
                    return Ok(());
                }

                let group_start_word = (block_index / BLOCKS_PER_WORD / WORDS_PER_L2_GROUP) * WORDS_PER_L2_GROUP;
                let mut region_empty = true;

                for w in group_start_word..group_start_word + WORDS_PER_L2_GROUP {
                    let is_zero = self.l3.with_word(w, |word| word.data == 0).unwrap_or(true);
                    if !is_zero {
                        region_empty = false;
                        break;
                    }
                }

                if region_empty {
                    self.l2.with_word(l2_word_index, |word| {
                        if (word.data >> l2_bit) & 1 == 1 {
                            word.data &= !(1u64 << l2_bit);
                            word.ecc = compute_ecc(word.data);
                            word.bump_version(self.version_epoch_mask);
                        }
                    })?;
                }

                Ok(())
            }
            BitOp::Test => Ok(()),
        }
    }

    /// Advisory L2 read, consulted before the authoritative L3 check
    /// during allocation probing (§4.1.2 step 3). `true` means "maybe
    /// used somewhere in this 512-block region"; `false` is a hard
    /// guarantee of all-free.
    pub fn l2_maybe_used(&self, block_index: u64) -> Result<bool, Error>
    {
        let l2_bit_index = block_index / BLOCKS_PER_L2_BIT;
        let l2_word_index = l2_bit_index / BLOCKS_PER_WORD;
        let l2_bit = (l2_bit_index % BLOCKS_PER_WORD) as u32;

        self.l2.with_word(l2_word_index, |word| (word.data >> l2_bit) & 1 == 1)
    }

    /// Flips bits in the L3 word covering `block_index` without going
    /// through `bitmap_op`, simulating a media bit-flip for tests that live
    /// outside this module (e.g. `volume`'s panic-propagation coverage).
    #[cfg(test)]
    pub(crate) fn test_corrupt_l3_word(&self, block_index: u64, xor_mask: u64)
    {
        let word_index = block_index / BLOCKS_PER_WORD;
        self.l3.with_word(word_index, |w| w.data ^= xor_mask).unwrap();
    }
}
