// =============================================================================
// Partial-key mappings (SingleMask / MultiMask)
// =============================================================================
//
// A mapping gathers a node's discriminative bits out of a search key into a
// dense partial key. Both representations produce the same canonical order:
// the most significant discriminative bit (smallest absolute index) becomes the
// most significant bit of the dense key.

use crate::bits::{bit_byte_index, bit_in_byte_msb0, pext_u64, DiscriminativeBits};

/// All discriminative bits lie in one 8-byte window of the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SingleMaskPartialKeyMapping {
    most_significant_bit: u16,
    least_significant_bit: u16,
    /// Byte offset of the 8-byte window used for extraction.
    byte_offset: u16,
    /// Extraction mask over the 64-bit big-endian window.
    extraction_mask: u64,
}

impl SingleMaskPartialKeyMapping {
    #[inline]
    fn num_bits(self) -> u16 {
        self.extraction_mask.count_ones() as u16
    }

    fn discriminative_bits(self, out: &mut DiscriminativeBits) {
        let mut mask = self.extraction_mask;
        while mask != 0 {
            // Walk from the top of the window so bits come out ascending.
            let idx_from_msb = mask.leading_zeros();
            mask &= !(1u64 << (63 - idx_from_msb));

            let rel_byte = (idx_from_msb / 8) as u16;
            let rel_bit_msb0 = (idx_from_msb % 8) as u16;
            out.push((self.byte_offset + rel_byte) * 8 + rel_bit_msb0);
        }
    }

    fn try_from_bits(discriminative_bits: &[u16]) -> Option<Self> {
        let msb = *discriminative_bits.first()?;
        let lsb = *discriminative_bits.last()?;

        let msb_byte = bit_byte_index(msb);
        let lsb_byte = bit_byte_index(lsb);
        if lsb_byte - msb_byte > 7 {
            return None;
        }

        let byte_offset = lsb_byte.saturating_sub(7);
        let mut extraction_mask = 0u64;
        for &bit in discriminative_bits {
            let rel_byte = bit_byte_index(bit) - byte_offset;
            debug_assert!(rel_byte <= 7);
            let rel_bit_msb0 = u64::from(bit_in_byte_msb0(bit));
            extraction_mask |= 1u64 << (63 - (u64::from(rel_byte) * 8 + rel_bit_msb0));
        }

        Some(Self {
            most_significant_bit: msb,
            least_significant_bit: lsb,
            byte_offset,
            extraction_mask,
        })
    }

    #[inline]
    fn extract(self, key: &[u8]) -> u32 {
        let off = self.byte_offset as usize;
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = key.get(off + i).copied().unwrap_or(0);
        }
        pext_u64(u64::from_be_bytes(bytes), self.extraction_mask) as u32
    }
}

/// Up to eight key bytes gathered into one big-endian word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ByteGroup {
    /// Key byte the offsets count from.
    base: u16,
    len: u8,
    offsets: [u8; 8],
    /// Bits kept from each gathered byte; gathered byte `i` sits in word byte `i`.
    mask: u64,
}

impl ByteGroup {
    #[inline]
    fn gather(&self, key: &[u8]) -> u64 {
        let mut word = [0u8; 8];
        for (slot, &offset) in word.iter_mut().zip(&self.offsets[..usize::from(self.len)]) {
            *slot = key.get(usize::from(self.base) + usize::from(offset)).copied().unwrap_or(0);
        }
        u64::from_be_bytes(word)
    }

    /// Starts a new gathered byte, or reports that `byte` belongs in the next group.
    fn push_byte(&mut self, byte: u16) -> bool {
        if self.len == 0 {
            self.base = byte;
        } else if self.len == 8 || byte - self.base > u16::from(u8::MAX) {
            return false;
        }
        self.offsets[usize::from(self.len)] = (byte - self.base) as u8;
        self.len += 1;
        true
    }

    /// Keeps `bit_msb0` of the most recently pushed byte.
    fn keep_bit(&mut self, bit_msb0: u8) {
        let shift = 8 * (7 - u32::from(self.len - 1));
        self.mask |= u64::from(0x80u8 >> bit_msb0) << shift;
    }
}

/// Discriminative bits spread over up to `8 * N` distinct key bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MultiMaskPartialKeyMapping<const N: usize> {
    most_significant_bit: u16,
    least_significant_bit: u16,
    /// Filled front to back; the dense key concatenates them in order.
    groups: [ByteGroup; N],
}

impl<const N: usize> MultiMaskPartialKeyMapping<N> {
    #[inline]
    fn num_bits(self) -> u16 {
        self.groups.iter().map(|g| g.mask.count_ones() as u16).sum()
    }

    fn discriminative_bits(self, out: &mut DiscriminativeBits) {
        for group in &self.groups {
            let masks = group.mask.to_be_bytes();
            for (&offset, &mask) in group.offsets.iter().zip(&masks).take(usize::from(group.len)) {
                let first_bit = (group.base + u16::from(offset)) * 8;
                out.extend((0u16..8).filter(|b| mask & (0x80 >> b) != 0).map(|b| first_bit + b));
            }
        }
    }

    /// Bits must be sorted: bits of one byte are then adjacent and bytes ascend,
    /// so groups fill in a single pass.
    fn try_from_bits(discriminative_bits: &[u16]) -> Option<Self> {
        let msb = *discriminative_bits.first()?;
        let lsb = *discriminative_bits.last()?;

        let mut groups = [ByteGroup::default(); N];
        let mut current = 0usize;
        let mut last_byte = None;
        for &bit in discriminative_bits {
            let byte = bit_byte_index(bit);
            if last_byte != Some(byte) {
                if !groups[current].push_byte(byte) {
                    current += 1;
                    if current == N {
                        return None;
                    }
                    groups[current].push_byte(byte);
                }
                last_byte = Some(byte);
            }
            groups[current].keep_bit(bit_in_byte_msb0(bit));
        }

        Some(Self {
            most_significant_bit: msb,
            least_significant_bit: lsb,
            groups,
        })
    }

    #[inline]
    fn extract(self, key: &[u8]) -> u32 {
        self.groups
            .iter()
            .take_while(|g| g.len > 0)
            .fold(0u32, |dense, g| {
                let part = pext_u64(g.gather(key), g.mask) as u32;
                (dense << g.mask.count_ones()) | part
            })
    }
}

/// How a node's discriminative bits are laid out in the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PartialKeyMapping {
    Single(SingleMaskPartialKeyMapping),
    /// Up to 8 distinct bytes.
    Multi1(MultiMaskPartialKeyMapping<1>),
    /// Up to 16 distinct bytes, at most 16 bits.
    Multi2(MultiMaskPartialKeyMapping<2>),
    /// Up to 32 distinct bytes.
    Multi4(MultiMaskPartialKeyMapping<4>),
}

impl PartialKeyMapping {
    #[inline]
    pub(crate) fn most_significant_bit(self) -> u16 {
        match self {
            Self::Single(m) => m.most_significant_bit,
            Self::Multi1(m) => m.most_significant_bit,
            Self::Multi2(m) => m.most_significant_bit,
            Self::Multi4(m) => m.most_significant_bit,
        }
    }

    #[inline]
    pub(crate) fn least_significant_bit(self) -> u16 {
        match self {
            Self::Single(m) => m.least_significant_bit,
            Self::Multi1(m) => m.least_significant_bit,
            Self::Multi2(m) => m.least_significant_bit,
            Self::Multi4(m) => m.least_significant_bit,
        }
    }

    #[inline]
    pub(crate) fn num_bits(self) -> u16 {
        match self {
            Self::Single(m) => m.num_bits(),
            Self::Multi1(m) => m.num_bits(),
            Self::Multi2(m) => m.num_bits(),
            Self::Multi4(m) => m.num_bits(),
        }
    }

    /// Dense partial key of `key` under this mapping.
    #[inline]
    pub(crate) fn extract(self, key: &[u8]) -> u32 {
        match self {
            Self::Single(m) => m.extract(key),
            Self::Multi1(m) => m.extract(key),
            Self::Multi2(m) => m.extract(key),
            Self::Multi4(m) => m.extract(key),
        }
    }

    /// The mapped bit positions, ascending.
    pub(crate) fn discriminative_bits(self) -> DiscriminativeBits {
        let mut out = DiscriminativeBits::new();
        match self {
            Self::Single(m) => m.discriminative_bits(&mut out),
            Self::Multi1(m) => m.discriminative_bits(&mut out),
            Self::Multi2(m) => m.discriminative_bits(&mut out),
            Self::Multi4(m) => m.discriminative_bits(&mut out),
        }
        debug_assert!(out.windows(2).all(|w| w[0] < w[1]));
        out
    }

    /// Cheapest mapping able to represent `discriminative_bits` (sorted, non-empty).
    pub(crate) fn build_minimal(discriminative_bits: &[u16]) -> Self {
        debug_assert!(!discriminative_bits.is_empty() && discriminative_bits.len() < 32);
        debug_assert!(discriminative_bits.windows(2).all(|w| w[0] < w[1]));

        if let Some(m) = SingleMaskPartialKeyMapping::try_from_bits(discriminative_bits) {
            return Self::Single(m);
        }
        if let Some(m) = MultiMaskPartialKeyMapping::<1>::try_from_bits(discriminative_bits) {
            return Self::Multi1(m);
        }
        if discriminative_bits.len() <= 16 {
            if let Some(m) = MultiMaskPartialKeyMapping::<2>::try_from_bits(discriminative_bits) {
                return Self::Multi2(m);
            }
        }
        match MultiMaskPartialKeyMapping::<4>::try_from_bits(discriminative_bits) {
            Some(m) => Self::Multi4(m),
            // At most 31 bits touch at most 31 bytes, all within a 256-byte key.
            None => unreachable!(
                "{} discriminative bits did not fit 32 extraction bytes",
                discriminative_bits.len()
            ),
        }
    }
}
