//! Piece bitfields in wire order.
//!
//! Bits are numbered from the high bit of the first byte, matching the
//! BitTorrent `bitfield` message, so masks built here can be exchanged with
//! the peer layer without re-ordering. The piece picker and the download
//! filter both work on these.

use bytes::Bytes;
use rand::Rng as _;

/// A fixed-width set of piece indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    nbits: usize,
}

impl Bitfield {
    /// An empty bitfield over `nbits` pieces.
    pub fn new(nbits: usize) -> Self {
        Self {
            bits: vec![0; nbits.div_ceil(8)],
            nbits,
        }
    }

    /// A bitfield with every piece set.
    pub fn full(nbits: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; nbits.div_ceil(8)],
            nbits,
        };
        bf.mask_spare_bits();
        bf
    }

    /// Reconstructs a bitfield from wire bytes. Short input is
    /// zero-extended; spare bits in the last byte are cleared.
    pub fn from_bytes(bytes: &[u8], nbits: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(nbits.div_ceil(8), 0);
        let mut bf = Self { bits, nbits };
        bf.mask_spare_bits();
        bf
    }

    pub fn nbits(&self) -> usize {
        self.nbits
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.nbits {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.nbits {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn unset(&mut self, index: usize) {
        if index < self.nbits {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Sets every piece.
    pub fn set_all(&mut self) {
        self.bits.fill(0xFF);
        self.mask_spare_bits();
    }

    /// Clears every piece.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Flips every piece.
    pub fn invert(&mut self) {
        for byte in &mut self.bits {
            *byte = !*byte;
        }
        self.mask_spare_bits();
    }

    /// Keeps only pieces also set in `other`.
    pub fn intersect(&mut self, other: &Bitfield) {
        for (byte, mask) in self.bits.iter_mut().zip(&other.bits) {
            *byte &= mask;
        }
    }

    /// Removes pieces set in `other`.
    pub fn except(&mut self, other: &Bitfield) {
        for (byte, mask) in self.bits.iter_mut().zip(&other.bits) {
            *byte &= !mask;
        }
    }

    /// Number of pieces set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// A uniformly random set piece, or `None` when empty.
    pub fn random(&self) -> Option<usize> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let mut skip = rand::rng().random_range(0..total);
        for index in 0..self.nbits {
            if self.is_set(index) {
                if skip == 0 {
                    return Some(index);
                }
                skip -= 1;
            }
        }
        None
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.nbits;
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
    fn set_and_test() {
        let mut bf = Bitfield::new(10);
        assert!(bf.is_empty());
        bf.set(0);
        bf.set(9);
        bf.set(10); // out of range, ignored
        assert!(bf.is_set(0));
        assert!(bf.is_set(9));
        assert!(!bf.is_set(5));
        assert_eq!(bf.count(), 2);
        bf.unset(0);
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn wire_order_is_msb_first() {
        let mut bf = Bitfield::new(16);
        bf.set(0);
        bf.set(8);
        assert_eq!(bf.as_bytes(), &[0x80, 0x80]);
    }

    #[test]
    fn invert_masks_spare_bits() {
        let mut bf = Bitfield::new(10);
        bf.invert();
        assert_eq!(bf.count(), 10);
        bf.invert();
        assert!(bf.is_empty());
    }

    #[test]
    fn full_and_set_all_agree() {
        let mut bf = Bitfield::new(13);
        bf.set_all();
        assert_eq!(bf, Bitfield::full(13));
        assert_eq!(bf.count(), 13);
    }

    #[test]
    fn intersect_and_except() {
        let mut a = Bitfield::new(8);
        a.set(1);
        a.set(2);
        a.set(3);
        let mut b = Bitfield::new(8);
        b.set(2);
        b.set(3);
        b.set(4);

        let mut i = a.clone();
        i.intersect(&b);
        assert_eq!(
            (0..8).filter(|&n| i.is_set(n)).collect::<Vec<_>>(),
            vec![2, 3]
        );

        a.except(&b);
        assert_eq!(
            (0..8).filter(|&n| a.is_set(n)).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn random_picks_a_set_bit() {
        let mut bf = Bitfield::new(64);
        bf.set(7);
        bf.set(42);
        for _ in 0..32 {
            let pick = bf.random().unwrap();
            assert!(pick == 7 || pick == 42);
        }
        assert_eq!(Bitfield::new(8).random(), None);
    }

    #[test]
    fn from_bytes_zero_extends() {
        let bf = Bitfield::from_bytes(&[0xFF], 12);
        assert_eq!(bf.count(), 8);
        assert!(!bf.is_set(11));
    }
}
