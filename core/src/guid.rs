//! Globally unique identifiers for mixing rounds, contributions and the
//! per-item objects a round emits

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    ops::Add,
};

use rand::{CryptoRng, RngCore};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};

/// The number of bytes in a GUID
pub const GUID_BYTES: usize = 16;

/// A 128-bit identifier, ordered as a big endian integer
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid([u8; GUID_BYTES]);

impl Guid {
    /// Construct a GUID from its bytes
    pub fn from_bytes(bytes: [u8; GUID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Generate a random GUID
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; GUID_BYTES];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The big endian bytes of the GUID
    pub fn as_bytes(&self) -> &[u8; GUID_BYTES] {
        &self.0
    }
}

/// Big endian addition with carry, wrapping on overflow
impl Add<u64> for Guid {
    type Output = Guid;

    fn add(self, rhs: u64) -> Self::Output {
        let value = u128::from_be_bytes(self.0).wrapping_add(u128::from(rhs));
        Guid(value.to_be_bytes())
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; GUID_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(DeError::custom)?;
        Ok(Guid(bytes))
    }
}
