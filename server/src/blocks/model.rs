//! Intake payload types and the metadata persisted next to a received block.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::blocks::store::sanitize_segment;
use crate::error::{BlockError, BlockResult};

/// Structured metadata written for every received block.
pub const METADATA_FILE: &str = "dimensions.json";
/// Generated mesh stored once a block is processed.
pub const ARTIFACT_FILE: &str = "block.glb";
/// Creation timestamp of a processed block, decimal seconds since the Unix epoch.
pub const CREATED_AT_FILE: &str = "created_at.txt";

const RESERVED_FILES: [&str; 3] = [METADATA_FILE, ARTIFACT_FILE, CREATED_AT_FILE];

// --- Request types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPhoto {
    pub filename: String,
    /// Standard base64 of the photo bytes
    pub base64: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockDimensions {
    pub width: f64,
    pub height: f64,
    pub length: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayload {
    pub id: String,
    #[serde(rename = "customId")]
    pub custom_id: String,
    pub dimensions: BlockDimensions,
    #[serde(default)]
    pub photos: Vec<BlockPhoto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksPayload {
    pub blocks: Vec<BlockPayload>,
}

// --- Persisted metadata ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub id: String,
    #[serde(rename = "customId")]
    pub custom_id: String,
    pub dimensions: BlockDimensions,
}

/// A payload that passed validation, with photo content already decoded.
#[derive(Debug, Clone)]
pub struct ValidatedBlock {
    pub metadata: BlockMetadata,
    pub photos: Vec<(String, Vec<u8>)>,
}

impl ValidatedBlock {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Every file to write into the received directory, metadata last.
    pub fn into_files(self) -> BlockResult<Vec<(String, Vec<u8>)>> {
        let metadata = serde_json::to_vec_pretty(&self.metadata)?;
        let mut files = self.photos;
        files.push((METADATA_FILE.to_string(), metadata));
        Ok(files)
    }
}

impl BlockDimensions {
    fn validate(&self) -> BlockResult<()> {
        for (field, value) in [
            ("width", self.width),
            ("height", self.height),
            ("length", self.length),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(BlockError::Validation(format!(
                    "dimension {} must be a finite non-negative number, got {}",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

impl BlockPayload {
    /// Check shape, sanitize id and photo names, decode photo content.
    pub fn validate(self) -> BlockResult<ValidatedBlock> {
        if self.id.trim().is_empty() {
            return Err(BlockError::Validation("block id must not be empty".to_string()));
        }
        sanitize_segment("block id", &self.id)?;
        self.dimensions.validate()?;

        let mut photos = Vec::with_capacity(self.photos.len());
        for photo in self.photos {
            if photo.filename.is_empty() {
                return Err(BlockError::Validation(format!(
                    "block {}: photo filename must not be empty",
                    self.id
                )));
            }
            sanitize_segment("photo filename", &photo.filename)?;
            if RESERVED_FILES.contains(&photo.filename.as_str()) {
                return Err(BlockError::Validation(format!(
                    "block {}: photo filename {} is reserved",
                    self.id, photo.filename
                )));
            }
            let bytes = STANDARD.decode(photo.base64.trim()).map_err(|e| {
                BlockError::Validation(format!(
                    "block {}: photo {} is not valid base64: {}",
                    self.id, photo.filename, e
                ))
            })?;
            photos.push((photo.filename, bytes));
        }

        Ok(ValidatedBlock {
            metadata: BlockMetadata {
                id: self.id,
                custom_id: self.custom_id,
                dimensions: self.dimensions,
            },
            photos,
        })
    }
}
