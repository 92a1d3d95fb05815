//! Mirror Module
//!
//! Process-local copies of replicated maps. Reads never leave the process;
//! writes go to the local copy first and then through to the cluster, and
//! change events from every process keep the copy convergent.

mod local_map;
mod local_multi_map;

use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use local_map::LocalMap;
pub use local_multi_map::LocalMultiMap;

/// Key type storable in a mirrored map.
pub trait MapKey: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + Sync + 'static {}

impl<T> MapKey for T where T: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + Sync + 'static
{}

/// Value type storable in a mirrored map.
pub trait MapValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> MapValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Encodes a key into its cluster form (a JSON string).
pub(crate) fn encode_key<K: Serialize>(key: &K) -> Result<String> {
    Ok(serde_json::to_string(key)?)
}

pub(crate) fn decode_key<K: DeserializeOwned>(raw: &str) -> Result<K> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding() {
        let raw = encode_key(&"user:1".to_string()).unwrap();
        assert_eq!(raw, "\"user:1\"");
        let key: String = decode_key(&raw).unwrap();
        assert_eq!(key, "user:1");

        let raw = encode_key(&(3u32, "x".to_string())).unwrap();
        let key: (u32, String) = decode_key(&raw).unwrap();
        assert_eq!(key, (3, "x".to_string()));
    }
}
