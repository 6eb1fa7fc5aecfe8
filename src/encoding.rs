//! Encoding helpers for values that aren't part of the fixed on-disk segment
//! format: command payloads, session metadata, and the demo state machine's
//! keys. The segment record header/trailer itself is hand-rolled
//! binary (see [`crate::raft::segment`]), not bincode -- it needs an exact,
//! stable byte layout with an explicit CRC, which a general-purpose codec
//! doesn't guarantee across versions.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A value that can be serialized for storage inside a command payload or
/// state-machine entry. Implementors get `encode`/`decode` for free.
pub trait Value: Serialize + DeserializeOwned {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        bincode::deserialize(bytes)
    }
}

/// Thin wrapper around the `bincode` crate using a fixed configuration, so
/// that every caller in this crate serializes the same way regardless of
/// which `bincode` defaults happen to be active.
pub mod bincode {
    use super::*;

    pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
        ::bincode::serde::encode_to_vec(value, ::bincode::config::standard())
            .expect("bincode serialization of an in-memory value cannot fail")
    }

    pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let (value, _) = ::bincode::serde::decode_from_slice(bytes, ::bincode::config::standard())
            .map_err(|err| Error::Serialization(err.to_string()))?;
        Ok(value)
    }
}
