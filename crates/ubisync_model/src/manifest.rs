//! Whole-store upload metadata.

use crate::error::{ModelError, ModelResult};
use crate::id::DeviceId;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Metadata describing one device's whole-store upload.
///
/// A device bootstrapping a document with no local copy scans every
/// peer's manifest and downloads the payload with the newest
/// `uploaded_at`. The manifest is written after its payload, so a
/// reader never observes a manifest without the file it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Device that uploaded the store.
    pub device_id: DeviceId,
    /// Upload time, used to pick the newest store across peers.
    pub uploaded_at: Timestamp,
    /// File name of the payload within the device's whole-store dir.
    pub file_name: String,
}

impl StoreManifest {
    /// Creates a new manifest.
    pub fn new(device_id: DeviceId, uploaded_at: Timestamp, file_name: impl Into<String>) -> Self {
        Self {
            device_id,
            uploaded_at,
            file_name: file_name.into(),
        }
    }

    /// Encodes the manifest to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Encode`] if serialization fails.
    pub fn encode(&self) -> ModelResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| ModelError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes a manifest from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> ModelResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ModelError::Decode(e.to_string()))
    }
}
