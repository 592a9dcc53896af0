// =============================================================================
// Bit utilities (PEXT helpers, bit indexing, discriminative bits)
// =============================================================================
//
// Bit positions are absolute indexes into a big-endian key: bit 0 is the MSB of
// byte 0, bit 7 its LSB, bit 8 the MSB of byte 1, and so on. Smaller indexes are
// more significant, so ordering bits by index orders them by key significance.

use smallvec::SmallVec;

use crate::key::MAX_KEY_LEN;

/// Sorted (ascending) set of absolute discriminative bit positions.
///
/// A node never has more than 31 discriminative bits, so this never spills.
pub(crate) type DiscriminativeBits = SmallVec<[u16; 32]>;

#[inline]
pub(crate) fn bit_byte_index(bit: u16) -> u16 {
    bit / 8
}

/// Bit index within its byte, where `0` is the MSB and `7` is the LSB.
#[inline]
pub(crate) fn bit_in_byte_msb0(bit: u16) -> u8 {
    (bit % 8) as u8
}

/// Value of the bit at `pos`; bytes past the end of `key` read as zero.
#[inline]
pub(crate) fn bit_at(key: &[u8], pos: u16) -> bool {
    let byte_idx = bit_byte_index(pos) as usize;
    let shift = 7 - bit_in_byte_msb0(pos);
    key.get(byte_idx).map_or(false, |b| (b >> shift) & 1 == 1)
}

#[inline]
fn pext_u64_fallback(value: u64, mut mask: u64) -> u64 {
    let mut out = 0u64;
    let mut out_bit = 1u64;
    while mask != 0 {
        let lsb = mask & mask.wrapping_neg();
        if (value & lsb) != 0 {
            out |= out_bit;
        }
        mask ^= lsb;
        out_bit <<= 1;
    }
    out
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "bmi2")]
unsafe fn pext_u64_bmi2(value: u64, mask: u64) -> u64 {
    core::arch::x86_64::_pext_u64(value, mask)
}

/// Parallel bit extract: gathers the bits of `value` selected by `mask` into the
/// low bits of the result, preserving their relative order.
#[inline]
pub(crate) fn pext_u64(value: u64, mask: u64) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("bmi2") {
            // SAFETY: feature detected at runtime.
            return unsafe { pext_u64_bmi2(value, mask) };
        }
    }
    pext_u64_fallback(value, mask)
}

#[inline]
pub(crate) fn pext_u32(value: u32, mask: u32) -> u32 {
    pext_u64(u64::from(value), u64::from(mask)) as u32
}

/// The most significant bit position at which two keys differ, plus the value
/// that bit has in the *new* key (the second argument of [`mismatch`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscriminativeBit {
    pub byte_index: u16,
    pub bit_in_byte: u8,
    pub absolute: u16,
    pub value: bool,
}

impl DiscriminativeBit {
    #[inline]
    pub(crate) fn new(absolute: u16, value: bool) -> Self {
        Self {
            byte_index: bit_byte_index(absolute),
            bit_in_byte: bit_in_byte_msb0(absolute),
            absolute,
            value,
        }
    }
}

/// Finds the first differing bit between `existing` and `new`.
///
/// Keys are compared as if zero-padded to the longer of the two (capped at
/// [`MAX_KEY_LEN`]). Returns `None` if they are equal over that length.
pub fn mismatch(existing: &[u8], new: &[u8]) -> Option<DiscriminativeBit> {
    let len = existing.len().max(new.len()).min(MAX_KEY_LEN);
    for i in 0..len {
        let a = existing.get(i).copied().unwrap_or(0);
        let b = new.get(i).copied().unwrap_or(0);
        let diff = a ^ b;
        if diff != 0 {
            let bit_in_byte = diff.leading_zeros() as u8;
            let absolute = (i as u16) * 8 + u16::from(bit_in_byte);
            return Some(DiscriminativeBit {
                byte_index: i as u16,
                bit_in_byte,
                absolute,
                value: (b >> (7 - bit_in_byte)) & 1 == 1,
            });
        }
    }
    None
}

/// `true` if both keys are equal under zero padding.
#[inline]
pub(crate) fn keys_equal(a: &[u8], b: &[u8]) -> bool {
    mismatch(a, b).is_none()
}
