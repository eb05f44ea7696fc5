//! On-disk snapshot of a corpus generation
//!
//! zstd-compressed JSON, one file per embedding model, written to a temp file
//! and renamed into place.

use crate::error::{DocqaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Bump when the layout changes; older files are treated as absent
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything needed to restore a generation without re-embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub format_version: u32,
    pub generation_id: String,
    pub embedding_model: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
    pub chunks: Vec<String>,
    /// Normalized vectors as IEEE-754 bit patterns so restored scores are bit-identical
    pub vector_bits: Vec<Vec<u32>>,
    pub tokens: Vec<Vec<String>>,
}

impl PersistedSnapshot {
    pub fn vectors(&self) -> Vec<Vec<f32>> {
        self.vector_bits
            .iter()
            .map(|row| row.iter().map(|bits| f32::from_bits(*bits)).collect())
            .collect()
    }

    pub fn encode_vectors(rows: &[Vec<f32>]) -> Vec<Vec<u32>> {
        rows.iter()
            .map(|row| row.iter().map(|v| v.to_bits()).collect())
            .collect()
    }
}

/// Snapshot location for a model; anything outside `[A-Za-z0-9._-]` becomes `_`
pub fn snapshot_path(dir: &Path, model_name: &str) -> PathBuf {
    let sanitized: String = model_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.snapshot.zst", sanitized))
}

/// Write the snapshot atomically, returning its final path
pub fn write_snapshot(dir: &Path, snapshot: &PersistedSnapshot) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to create snapshot directory: {}", dir.display()),
    })?;

    let json = serde_json::to_vec(snapshot).map_err(|e| DocqaError::Json {
        source: e,
        context: "Failed to serialize snapshot".to_string(),
    })?;
    let compressed = zstd::encode_all(&json[..], 3).map_err(|e| DocqaError::Io {
        source: e,
        context: "Failed to compress snapshot".to_string(),
    })?;

    let final_path = snapshot_path(dir, &snapshot.embedding_model);
    let temp_path = final_path.with_extension("zst.tmp");

    let mut file = fs::File::create(&temp_path).map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to create temp snapshot: {}", temp_path.display()),
    })?;
    file.write_all(&compressed).map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to write snapshot: {}", temp_path.display()),
    })?;
    file.sync_all().map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to sync snapshot: {}", temp_path.display()),
    })?;
    drop(file);

    fs::rename(&temp_path, &final_path).map_err(|e| DocqaError::Io {
        source: e,
        context: format!(
            "Failed to move snapshot into place: {} -> {}",
            temp_path.display(),
            final_path.display()
        ),
    })?;

    Ok(final_path)
}

/// Read the snapshot for a model
///
/// Returns `Ok(None)` when no snapshot exists; damaged files are errors.
pub fn read_snapshot(dir: &Path, model_name: &str) -> Result<Option<PersistedSnapshot>> {
    let path = snapshot_path(dir, model_name);
    if !path.exists() {
        return Ok(None);
    }

    let compressed = fs::read(&path).map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to read snapshot: {}", path.display()),
    })?;
    let json = zstd::decode_all(&compressed[..]).map_err(|e| DocqaError::Io {
        source: e,
        context: format!("Failed to decompress snapshot: {}", path.display()),
    })?;
    let snapshot = serde_json::from_slice(&json).map_err(|e| DocqaError::Json {
        source: e,
        context: format!("Failed to parse snapshot: {}", path.display()),
    })?;

    Ok(Some(snapshot))
}
