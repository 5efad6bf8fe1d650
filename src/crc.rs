//! Thin wrappers over the `crc` crate.
//!
//! The CRC32 library itself is an external collaborator per §1; this module
//! only adapts it to the two checksum flavors the on-disk formats need:
//! plain CRC-32 (IEEE) for block/anchor/superblock checksums, and the
//! ext4-style CRC-32C (Castagnoli) seeded-chain construction for anywhere a
//! checksum needs to be mixed with a volume-wide seed (ported from the
//! teacher's `ext4_style_crc32c_le`).

/// Plain CRC-32 (IEEE 802.3 polynomial) over a buffer.
pub fn crc32(buf: &[u8]) -> u32
{
    crc::crc32::checksum_ieee(buf)
}

/// CRC-32C (Castagnoli), seeded and inverted the way ext4-family checksums
/// chain a volume seed through successive buffers.
pub fn crc32c_seeded(seed: u32, buf: &[u8]) -> u32
{
    crc::crc32::update(seed ^ !0, &crc::crc32::CASTAGNOLI_TABLE, buf) ^ !0u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_is_deterministic()
    {
        assert_eq!(crc32(b"hydra-nexus"), crc32(b"hydra-nexus"));
    }

    #[test]
    fn crc32_differs_on_different_input()
    {
        assert_ne!(crc32(b"flux"), crc32(b"horizon"));
    }

    #[test]
    fn crc32c_seeded_is_deterministic()
    {
        let a = crc32c_seeded(0, b"anchor");
        let b = crc32c_seeded(0, b"anchor");

        assert_eq!(a, b);
    }

    #[test]
    fn crc32c_seeded_chains_with_seed()
    {
        let unseeded = crc32c_seeded(0, b"payload");
        let seeded = crc32c_seeded(0xDEAD_BEEF, b"payload");

        assert_ne!(unseeded, seeded);
    }
}
