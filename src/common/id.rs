//! Overlay key: a node Id or a lookup target
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Fixed width overlay key, used both as a node Id and as a lookup target.
///
/// Keys are compared as big endian unsigned integers, so the [Ord] implementation
/// doubles as the ordering of XOR distances returned by [Id::xor].
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The all zero key.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Hash arbitrary data into the key space.
    pub fn sha1(data: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(data);

        Id(hasher.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    // === Metric ===

    /// XOR distance between this Id and another, as an unsigned integer key.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Orders `a` and `b` by their distance to `self`, ties broken by raw key value.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        a.xor(self).cmp(&b.xor(self)).then_with(|| a.cmp(b))
    }

    /// Returns `true` if `a` is strictly closer to `self` than `b`.
    pub fn closer(&self, a: &Id, b: &Id) -> bool {
        self.cmp_distance(a, b) == Ordering::Less
    }

    /// Number of leading bits `self` and `other` have in common.
    ///
    /// Equal keys share all [ID_BITS] bits.
    pub fn shared_prefix_length(&self, other: &Id) -> usize {
        self.xor(other).leading_zeros()
    }

    /// Number of leading zero bits of this key.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// Extract `width` bits starting at bit `offset`, where bit 0 is the least
    /// significant bit of the key.
    ///
    /// # Panics
    ///
    /// Panics if `width` is zero or larger than 32, or the range exceeds [ID_BITS].
    pub fn bit_group(&self, offset: usize, width: usize) -> u32 {
        assert!(
            width > 0 && width <= 32 && offset + width <= ID_BITS,
            "bit group out of range: offset {offset}, width {width}"
        );

        let mut group = 0_u32;

        for j in 0..width {
            let position = offset + j;
            let byte = self.0[ID_SIZE - 1 - position / 8];

            if (byte >> (position % 8)) & 1 == 1 {
                group |= 1 << j;
            }
        }

        group
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn top(byte: u8) -> Id {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = byte;
        Id(bytes)
    }

    #[test]
    fn xor_distance() {
        let a = top(0b0110_0000);
        let b = top(0b0111_0000);

        assert_eq!(a.xor(&b), top(0b0001_0000));
        assert_eq!(a.xor(&a), Id::ZERO);
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn closer() {
        let target = top(0b0101_0000);

        let a = top(0b0100_0000);
        let b = top(0b0111_0000);

        assert!(target.closer(&a, &b));
        assert!(!target.closer(&b, &a));
        assert!(!target.closer(&a, &a));
        assert_eq!(target.cmp_distance(&a, &a), Ordering::Equal);
    }

    #[test]
    fn shared_prefix_length() {
        let a = top(0b0110_0000);

        assert_eq!(a.shared_prefix_length(&top(0b1110_0000)), 0);
        assert_eq!(a.shared_prefix_length(&top(0b0100_0000)), 2);
        assert_eq!(a.shared_prefix_length(&top(0b0111_0000)), 3);
        assert_eq!(a.shared_prefix_length(&a), ID_BITS);

        let mut last = [0; ID_SIZE];
        last[ID_SIZE - 1] = 1;
        assert_eq!(Id::ZERO.shared_prefix_length(&Id(last)), ID_BITS - 1);
    }

    #[test]
    fn bit_group() {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = 0b1011_0000;
        bytes[ID_SIZE - 1] = 0b0000_0110;
        let id = Id(bytes);

        assert_eq!(id.bit_group(0, 1), 0);
        assert_eq!(id.bit_group(1, 2), 0b11);
        assert_eq!(id.bit_group(0, 4), 0b0110);
        assert_eq!(id.bit_group(ID_BITS - 4, 4), 0b1011);
        assert_eq!(id.bit_group(ID_BITS - 1, 1), 1);
    }

    #[test]
    #[should_panic]
    fn bit_group_out_of_range() {
        Id::ZERO.bit_group(ID_BITS - 1, 2);
    }

    #[test]
    fn from_str() {
        let id = Id::from_str("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();

        assert_eq!(id, Id::sha1(b""));
        assert_eq!(id.to_string(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");

        assert!(Id::from_str("da39").is_err());
        assert!(Id::from_str("zz39a3ee5e6b4b0d3255bfef95601890afd80709").is_err());
    }

    #[test]
    fn from_bytes() {
        assert_eq!(Id::from_bytes([0; ID_SIZE]).unwrap(), Id::ZERO);
        assert_eq!(Id::from_bytes([0; 3]), Err(Error::InvalidIdSize(3)));
    }
}
