use crate::peer::PeerError;
use bytes::Bytes;

/// Fixed-size piece bitfield with a maintained set-bit count.
///
/// `set` and `clear` keep `count` current, so completeness checks are O(1)
/// on the hot paths (every HAVE, every piece verification). The count is
/// only ever recomputed once, when a bitfield arrives off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u32,
    count: u32,
}

impl Bitfield {
    /// An all-zero bitfield for `len` pieces.
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; Self::byte_len(len)],
            len,
            count: 0,
        }
    }

    /// An all-one bitfield for `len` pieces.
    pub fn full(len: u32) -> Self {
        let mut field = Self {
            bits: vec![0xff; Self::byte_len(len)],
            len,
            count: len,
        };
        field.clear_spare_bits();
        field
    }

    /// Builds from wire bytes. The length must match exactly; set spare
    /// bits in the final byte are cleared rather than rejected, since some
    /// clients pad with ones.
    pub fn from_bytes(bytes: &[u8], len: u32) -> Result<Self, PeerError> {
        if bytes.len() != Self::byte_len(len) {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield length {} for {} pieces",
                bytes.len(),
                len
            )));
        }
        let mut field = Self {
            bits: bytes.to_vec(),
            len,
            count: 0,
        };
        field.clear_spare_bits();
        field.count = field.bits.iter().map(|b| b.count_ones()).sum();
        Ok(field)
    }

    fn byte_len(len: u32) -> usize {
        (len as usize + 7) / 8
    }

    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) as u32 - self.len;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }

    pub fn get(&self, index: u32) -> bool {
        index < self.len && self.bits[index as usize / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn set(&mut self, index: u32) {
        debug_assert!(index < self.len);
        let byte = &mut self.bits[index as usize / 8];
        let mask = 0x80 >> (index % 8);
        if *byte & mask == 0 {
            *byte |= mask;
            self.count += 1;
        }
    }

    pub fn clear(&mut self, index: u32) {
        debug_assert!(index < self.len);
        let byte = &mut self.bits[index as usize / 8];
        let mask = 0x80 >> (index % 8);
        if *byte & mask != 0 {
            *byte &= !mask;
            self.count -= 1;
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of pieces this bitfield covers.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn complete(&self) -> bool {
        self.count == self.len
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates the indices of set bits.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear_maintain_count() {
        let mut field = Bitfield::new(10);
        assert_eq!(field.count(), 0);

        field.set(3);
        field.set(9);
        assert_eq!(field.count(), 2);
        assert!(field.get(3));
        assert!(!field.get(4));

        // Setting an already-set bit must not double count.
        field.set(3);
        assert_eq!(field.count(), 2);

        field.clear(3);
        field.clear(3);
        assert_eq!(field.count(), 1);
        assert!(!field.get(3));
    }

    #[test]
    fn test_complete() {
        let mut field = Bitfield::new(3);
        field.set(0);
        field.set(1);
        assert!(!field.complete());
        field.set(2);
        assert!(field.complete());
        assert_eq!(field, Bitfield::full(3));
    }

    #[test]
    fn test_full_clears_spare_bits() {
        let field = Bitfield::full(9);
        assert_eq!(field.count(), 9);
        assert_eq!(&field.to_bytes()[..], &[0xff, 0x80]);
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let mut field = Bitfield::new(12);
        field.set(0);
        field.set(11);
        let parsed = Bitfield::from_bytes(&field.to_bytes(), 12).unwrap();
        assert_eq!(parsed, field);
        assert_eq!(parsed.count(), 2);
    }

    #[test]
    fn test_from_bytes_rejects_length_mismatch() {
        assert!(Bitfield::from_bytes(&[0xff], 12).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xf0, 0x00], 12).is_err());
    }

    #[test]
    fn test_from_bytes_clears_set_spare_bits() {
        let field = Bitfield::from_bytes(&[0xff, 0xff], 12).unwrap();
        assert_eq!(field.count(), 12);
        assert_eq!(&field.to_bytes()[..], &[0xff, 0xf0]);
        assert!(!field.get(12));
    }

    #[test]
    fn test_iter_set() {
        let mut field = Bitfield::new(20);
        for i in [1, 8, 19] {
            field.set(i);
        }
        assert_eq!(field.iter_set().collect::<Vec<_>>(), vec![1, 8, 19]);
    }

    #[test]
    fn test_get_out_of_range_is_false() {
        let field = Bitfield::full(8);
        assert!(!field.get(8));
    }
}
