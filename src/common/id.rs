//! 160-bit node and key identifiers with XOR-distance arithmetic.
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1_smol::Sha1;

use crate::{Error, Result};

/// How many bytes an [Id] occupies (the width of a SHA-1 digest).
pub const ID_BYTES: usize = 20;
/// How many bits an [Id] occupies.
pub const ID_BITS: usize = ID_BYTES * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A node identifier or lookup target in the 160-bit key space.
pub struct Id([u8; ID_BYTES]);

impl Id {
    /// The all-zeros Id.
    pub const ZERO: Id = Id([0; ID_BYTES]);

    /// Generate a random Id from the operating system's entropy source.
    pub fn random() -> Id {
        let mut bytes = [0_u8; ID_BYTES];
        getrandom::getrandom(&mut bytes).expect("getrandom");

        Id(bytes)
    }

    /// Generate a random Id from a non-cryptographic generator.
    ///
    /// Used for bucket refresh targets, never for the local node Id.
    pub fn random_weak() -> Id {
        let mut rng = rand::thread_rng();
        let bytes: [u8; ID_BYTES] = rng.gen();

        Id(bytes)
    }

    /// Hash an arbitrary key into an Id with SHA-1.
    pub fn from_key<T: AsRef<[u8]>>(key: T) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(key.as_ref());

        Id(hasher.digest().bytes())
    }

    /// Construct an Id from a byte string of exactly [ID_BYTES] bytes; any
    /// other length is a validation error.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let slice = bytes.as_ref();
        let raw = <[u8; ID_BYTES]>::try_from(slice)
            .map_err(|_| Error::InvalidIdSize(slice.len()))?;

        Ok(Id(raw))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR distance between this Id and `other`, as a 160 bit value.
    ///
    /// Distance to self is [Id::ZERO]. `xor` is symmetric, and the resulting
    /// Ids order exactly like the distances they represent.
    pub fn xor(&self, other: &Id) -> Id {
        let mut distance = [0_u8; ID_BYTES];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(distance)
    }

    /// Compare the XOR distances of `a` and `b` from this Id.
    ///
    /// Returns `Ordering::Less` if `a` is closer to this Id than `b`,
    /// `Ordering::Equal` only for `a == b`. Antisymmetric:
    /// `x.compare_distance(a, b) == x.compare_distance(b, a).reverse()`.
    pub fn compare_distance(&self, a: &Id, b: &Id) -> Ordering {
        self.xor(a).cmp(&self.xor(b))
    }

    /// The bit at `index`, where bit 0 is the most significant bit of byte 0.
    pub fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// Copy the first `len` bits of `prefix` over this Id, keeping the rest.
    ///
    /// Returns Err if `len` covers the entire Id width, leaving no room for
    /// random or distinguishing bits.
    pub fn with_prefix(mut self, prefix: &Id, len: usize) -> Result<Id> {
        if len >= ID_BITS {
            return Err(Error::PrefixTooLong(len));
        }

        let whole_bytes = len / 8;
        self.0[..whole_bytes].copy_from_slice(&prefix.0[..whole_bytes]);

        let remainder = len % 8;
        if remainder > 0 {
            let mask = 0xff_u8 << (8 - remainder);
            self.0[whole_bytes] = (prefix.0[whole_bytes] & mask) | (self.0[whole_bytes] & !mask);
        }

        Ok(self)
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
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if !s.is_ascii() || s.len() != ID_BYTES * 2 {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
