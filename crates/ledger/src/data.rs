//! Opaque values stored in ledger buckets

use crate::error::DataError;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A key inside a bucket maps to one of these
pub type Bucket = BTreeMap<String, Data>;

/// The full replicated state carried by a block: bucket name -> bucket
pub type Storage = BTreeMap<String, Bucket>;

/// Payload-agnostic value.
///
/// The ledger never looks inside; callers encode and decode typed values
/// explicitly with [`Data::encode`] and [`Data::decode`].
#[derive(Clone, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Data(Vec<u8>);

impl Data {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encode a typed value as JSON
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, DataError> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Decode a typed value previously written with [`Data::encode`]
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DataError> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    /// A JSON string value, the shape most coordination buckets use
    pub fn string(value: &str) -> Self {
        // Serializing a &str into JSON cannot fail
        Self(serde_json::to_vec(value).unwrap_or_default())
    }

    /// Decode a JSON string value, `None` if the data holds something else
    pub fn as_string(&self) -> Option<String> {
        self.decode::<String>().ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
