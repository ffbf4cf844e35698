//! Binary data encodings.
//!
//! Bincode is used both for values in the key/value log store and for the
//! peer wire protocol (wrapped in length-prefixed frames by `raft::message`).

pub mod bincode;

use crate::error::Result;

/// A serializable value, encoded with Bincode.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes the value.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
