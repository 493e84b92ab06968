//! Bit-per-piece availability map.
//!
//! Used both for the piece sets peers advertise (BITFIELD/HAVE messages)
//! and for the client's own record of verified pieces. Bit ordering follows
//! the peer wire protocol: piece index 0 is the high bit of byte 0.

/// A compact bit array with one bit per piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    /// Creates an empty bitfield sized for `nb_pieces` pieces.
    pub fn new(nb_pieces: usize) -> Bitfield {
        Bitfield {
            bits: vec![0; nb_pieces.div_ceil(8)],
        }
    }

    /// Wraps the raw bytes of a BITFIELD message payload.
    pub fn from_bytes(bits: Vec<u8>) -> Bitfield {
        Bitfield { bits }
    }

    /// Returns whether the bit for `index` is set.
    ///
    /// Out-of-range indices read as unset rather than panicking, since the
    /// payload length is controlled by the remote peer.
    pub fn has(&self, index: usize) -> bool {
        let byte = index / 8;
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] >> (7 - index % 8) & 1 != 0
    }

    /// Sets the bit for `index`, ignoring out-of-range indices.
    pub fn set(&mut self, index: usize) {
        let byte = index / 8;
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << (7 - index % 8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_is_high_bit_of_first_byte() {
        let mut bitfield = Bitfield::new(16);
        bitfield.set(0);
        assert!(bitfield.has(0));
        assert_eq!(bitfield.bits[0], 0b1000_0000);
    }

    #[test]
    fn set_and_has_across_byte_boundary() {
        let mut bitfield = Bitfield::new(20);
        bitfield.set(7);
        bitfield.set(8);
        bitfield.set(19);
        assert!(bitfield.has(7));
        assert!(bitfield.has(8));
        assert!(bitfield.has(19));
        assert!(!bitfield.has(9));
    }

    #[test]
    fn out_of_range_reads_unset_and_set_is_ignored() {
        let mut bitfield = Bitfield::new(8);
        assert!(!bitfield.has(64));
        bitfield.set(64);
        assert!(!bitfield.has(64));
    }

    #[test]
    fn from_bytes_matches_wire_layout() {
        // 0b0100_0000 advertises only piece 1
        let bitfield = Bitfield::from_bytes(vec![0b0100_0000]);
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(!bitfield.has(2));
    }
}
