//! YAML encode/decode for persisted state files.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, StoreError};

pub fn encode_yaml<T: Serialize>(value: &T, what: &'static str) -> Result<String> {
    serde_yaml::to_string(value).map_err(|err| StoreError::Encode {
        what,
        reason: err.to_string(),
    })
}

/// Decode `bytes`; `path` is only used for error context.
pub fn decode_yaml<T: DeserializeOwned>(bytes: &[u8], path: &Path) -> Result<T> {
    serde_yaml::from_slice(bytes).map_err(|err| StoreError::Decode {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Read and decode a YAML file from the live state directory.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|err| StoreError::state_io("read", path, err))?;
    decode_yaml(&bytes, path)
}
