use bytes::Bytes;
use thiserror::Error;

/// Errors from bitfield operations that combine or decode bitfields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    /// Two bitfields of different lengths were combined.
    #[error("bitfield length mismatch: {0} vs {1}")]
    LengthMismatch(usize, usize),

    /// A serialized bitfield did not match the declared piece count.
    #[error("bitfield has {got} bytes, expected {expected} for {pieces} pieces")]
    InvalidByteLength {
        got: usize,
        expected: usize,
        pieces: usize,
    },

    /// A serialized bitfield had bits set past the declared piece count.
    #[error("bitfield has spare bits set past piece {0}")]
    SpareBitsSet(usize),
}

/// A fixed-length boolean vector over piece indices.
///
/// Bits are packed MSB-first per byte: piece 0 is the high bit of byte 0.
/// The length is fixed at construction and the bitfield is never resized.
/// Indexing out of `[0, len)` panics, like slice indexing; wire-facing
/// indices must be validated before they reach a bitfield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Creates an all-false bitfield for the given number of pieces.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Creates an all-true bitfield for the given number of pieces.
    pub fn full(len: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; len.div_ceil(8)],
            len,
        };
        bf.mask_spare_bits();
        bf
    }

    /// Decodes a wire bitfield.
    ///
    /// The buffer must be exactly `ceil(len / 8)` bytes and every bit past
    /// `len` must be zero; anything else is rejected.
    pub fn from_bytes(len: usize, bytes: &[u8]) -> Result<Self, BitfieldError> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::InvalidByteLength {
                got: bytes.len(),
                expected,
                pieces: len,
            });
        }

        let bf = Self {
            bits: bytes.to_vec(),
            len,
        };

        let spare = expected * 8 - len;
        if spare > 0 {
            let last = bf.bits[expected - 1];
            if last & !(0xFFu8 << spare) != 0 {
                return Err(BitfieldError::SpareBitsSet(len));
            }
        }

        Ok(bf)
    }

    /// Encodes the bitfield for the wire, zero-padding the final byte.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Returns the number of pieces this bitfield covers.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the bitfield covers zero pieces.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the bit at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit index {index} out of range {}", self.len);
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Sets the bit at `index` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len`.
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bit index {index} out of range {}", self.len);
        let mask = 1u8 << (7 - index % 8);
        if value {
            self.bits[index / 8] |= mask;
        } else {
            self.bits[index / 8] &= !mask;
        }
    }

    /// Sets every bit to `value`.
    pub fn set_all(&mut self, value: bool) {
        let fill = if value { 0xFF } else { 0x00 };
        self.bits.fill(fill);
        if value {
            self.mask_spare_bits();
        }
    }

    /// Returns the number of true bits.
    pub fn count_true(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns the number of true bits also set in `mask`.
    pub fn count_true_masked(&self, mask: &Bitfield) -> Result<usize, BitfieldError> {
        self.check_len(mask)?;
        Ok(self
            .bits
            .iter()
            .zip(&mask.bits)
            .map(|(a, b)| (a & b).count_ones() as usize)
            .sum())
    }

    /// Returns true if every bit is set.
    pub fn all_true(&self) -> bool {
        self.count_true() == self.len
    }

    /// Returns true if no bit is set.
    pub fn all_false(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the first true bit in `[start, end)`, or `None`.
    pub fn first_true(&self, start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.len);
        (start..end).find(|&i| self.get(i))
    }

    /// Bitwise OR with another bitfield of the same length.
    pub fn union(&mut self, other: &Bitfield) -> Result<(), BitfieldError> {
        self.check_len(other)?;
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
        Ok(())
    }

    /// Bitwise AND with another bitfield of the same length.
    pub fn intersect(&mut self, other: &Bitfield) -> Result<(), BitfieldError> {
        self.check_len(other)?;
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a &= b;
        }
        Ok(())
    }

    /// Bitwise XOR with another bitfield of the same length.
    pub fn xor(&mut self, other: &Bitfield) -> Result<(), BitfieldError> {
        self.check_len(other)?;
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a ^= b;
        }
        Ok(())
    }

    /// Inverts every bit in place.
    pub fn invert(&mut self) {
        for b in &mut self.bits {
            *b = !*b;
        }
        self.mask_spare_bits();
    }

    fn check_len(&self, other: &Bitfield) -> Result<(), BitfieldError> {
        if self.len != other.len {
            return Err(BitfieldError::LengthMismatch(self.len, other.len));
        }
        Ok(())
    }

    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.len;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut bf = Bitfield::new(100);
        assert!(!bf.get(0));
        bf.set(0, true);
        bf.set(99, true);
        assert!(bf.get(0));
        assert!(bf.get(99));
        assert_eq!(bf.count_true(), 2);
        bf.set(0, false);
        assert!(!bf.get(0));
    }

    #[test]
    #[should_panic]
    fn test_get_out_of_range_panics() {
        let bf = Bitfield::new(8);
        bf.get(8);
    }

    #[test]
    fn test_double_invert_identity() {
        let mut bf = Bitfield::new(13);
        bf.set(0, true);
        bf.set(7, true);
        bf.set(12, true);
        let original = bf.clone();
        bf.invert();
        bf.invert();
        assert_eq!(bf, original);
    }

    #[test]
    fn test_invert_masks_spare_bits() {
        let mut bf = Bitfield::new(10);
        bf.invert();
        assert!(bf.all_true());
        assert_eq!(bf.count_true(), 10);
    }

    #[test]
    fn test_all_true_iff_full_mask_count() {
        let mut bf = Bitfield::new(12);
        let full = Bitfield::full(12);
        assert_eq!(bf.count_true_masked(&full).unwrap(), 0);
        bf.set_all(true);
        assert!(bf.all_true());
        assert_eq!(bf.count_true_masked(&full).unwrap(), 12);
    }

    #[test]
    fn test_first_true() {
        let mut bf = Bitfield::new(32);
        assert_eq!(bf.first_true(0, 32), None);
        bf.set(5, true);
        bf.set(20, true);
        assert_eq!(bf.first_true(0, 32), Some(5));
        assert_eq!(bf.first_true(6, 32), Some(20));
        assert_eq!(bf.first_true(6, 20), None);
        assert_eq!(bf.first_true(21, 200), None);
    }

    #[test]
    fn test_length_mismatch() {
        let mut a = Bitfield::new(8);
        let b = Bitfield::new(9);
        assert_eq!(a.union(&b), Err(BitfieldError::LengthMismatch(8, 9)));
        assert_eq!(a.intersect(&b), Err(BitfieldError::LengthMismatch(8, 9)));
        assert_eq!(a.xor(&b), Err(BitfieldError::LengthMismatch(8, 9)));
    }

    #[test]
    fn test_algebra() {
        let mut a = Bitfield::new(4);
        a.set(0, true);
        a.set(2, true);
        let mut b = Bitfield::new(4);
        b.set(1, true);
        b.set(2, true);

        let mut or = a.clone();
        or.union(&b).unwrap();
        assert_eq!(or.count_true(), 3);

        let mut and = a.clone();
        and.intersect(&b).unwrap();
        assert!(and.get(2));
        assert_eq!(and.count_true(), 1);

        let mut x = a.clone();
        x.xor(&b).unwrap();
        assert!(x.get(0) && x.get(1) && !x.get(2));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(matches!(
            Bitfield::from_bytes(16, &[0x00]),
            Err(BitfieldError::InvalidByteLength { .. })
        ));
        assert!(matches!(
            Bitfield::from_bytes(8, &[0x00, 0x00]),
            Err(BitfieldError::InvalidByteLength { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_spare_bits() {
        // 10 pieces, bit 10 (third bit of second byte) set
        assert_eq!(
            Bitfield::from_bytes(10, &[0x00, 0x20]),
            Err(BitfieldError::SpareBitsSet(10))
        );
    }

    #[test]
    fn test_roundtrip() {
        let mut bf = Bitfield::new(11);
        bf.set(0, true);
        bf.set(10, true);
        let bytes = bf.to_bytes();
        assert_eq!(bytes.len(), 2);
        let decoded = Bitfield::from_bytes(11, &bytes).unwrap();
        assert_eq!(decoded, bf);
    }

    #[test]
    fn test_msb_first_packing() {
        let bf = Bitfield::from_bytes(16, &[0x80, 0x01]).unwrap();
        assert!(bf.get(0));
        assert!(bf.get(15));
        assert!(!bf.get(1));
    }
}
