use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sha3::{Digest, Sha3_256};
use std::fmt::{self, Debug, Display, Formatter};

use crate::error::{Error, Result};
use crate::KEY_LENGTH;

/// A key that represents nodes and data.
///
/// Keys are 160 bits. Content keys are the first 160 bits of the SHA-3 digest of their name so
/// that the same hash function can be used for all keys.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Default, Copy)]
pub struct Key(pub [u8; KEY_LENGTH]);

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Key {
    /// Constructs a new `Key` from a byte array.
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        Key(data)
    }

    /// Constructs the content key of `data`.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha3_256::digest(data);
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(&digest[..KEY_LENGTH]);
        Key(ret)
    }

    /// Parses a `Key` from its hex representation.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|err| Error::InvalidKey(err.to_string()))?;
        if bytes.len() != KEY_LENGTH {
            return Err(Error::InvalidKey(format!(
                "expected {} bytes, found {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut ret = [0; KEY_LENGTH];
        ret.copy_from_slice(&bytes);
        Ok(Key(ret))
    }

    /// Constructs a new, random `Key`.
    pub fn rand() -> Self {
        Key(rand::random())
    }

    /// Constructs a new, random `Key` that falls in bucket `index` of the routing table owned by
    /// `id`.
    ///
    /// The bits above `index` are copied from `id`, bit `index` is flipped and the bits below it
    /// are random, so the highest set bit of the distance to `id` is always `index`.
    pub fn rand_in_bucket(index: usize, id: &Key) -> Self {
        debug_assert!(index < KEY_LENGTH * 8);
        let mut ret = *id;
        let byte = KEY_LENGTH - 1 - index / 8;
        let bit = index % 8;
        let low_mask = (1u8 << bit) - 1;

        ret.0[byte] ^= 1 << bit;
        ret.0[byte] = (ret.0[byte] & !low_mask) | (rand::random::<u8>() & low_mask);
        for byte in &mut ret.0[byte + 1..] {
            *byte = rand::random::<u8>();
        }
        ret
    }

    /// Returns the XOR distance between `self` and `key`.
    pub fn distance(&self, key: &Key) -> Key {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ key.0[i];
        }
        Key(ret)
    }

    /// Returns the index of the bucket in the routing table owned by `id` that `self` belongs to,
    /// which is the position of the highest set bit of their distance. Returns `None` if `self`
    /// is `id`.
    pub fn bucket_index(&self, id: &Key) -> Option<usize> {
        let leading_zeros = self.distance(id).leading_zeros();
        if leading_zeros == KEY_LENGTH * 8 {
            None
        } else {
            Some(KEY_LENGTH * 8 - 1 - leading_zeros)
        }
    }

    /// Returns the number of leading zeros in `self`.
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Key::from_hex(&hex_str).map_err(de::Error::custom)
    }
}
