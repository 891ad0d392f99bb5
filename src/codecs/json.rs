//! JSON Codec using `serde_json`

use crate::traits::CacheCodec;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// JSON Codec using `serde_json`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("failed to encode cache entry as JSON")
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).with_context(|| {
            format!(
                "cached payload is not a valid {}",
                std::any::type_name::<T>()
            )
        })
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}
