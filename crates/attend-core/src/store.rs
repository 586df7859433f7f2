//! JSON identity directory source.
//!
//! One `*.json` record per enrolled person, as written by the enrollment tool:
//!
//! ```json
//! { "Id": 7, "Name": "Somchai", "IsActive": true, "FaceEncodings": ["<base64>"] }
//! ```
//!
//! Each encoding is standard base64 over little-endian `f64` values.

use crate::repository::{IdentitySource, LoadError, LoadReport, RepositorySnapshot, SkippedRecord};
use crate::types::{Embedding, Identity};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const F64_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Error, Debug)]
pub enum EmbeddingDecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("empty embedding payload")]
    Empty,
    #[error("payload length {0} is not a multiple of 8")]
    BadLength(usize),
    #[error("embedding contains a non-finite value")]
    NonFinite,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum RecordDecodeError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record has no usable Id")]
    MissingId,
    #[error("no decodable face encodings ({failed} failed)")]
    NoEmbeddings { failed: usize },
}

/// On-disk record layout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    face_encodings: Vec<String>,
}

fn default_name() -> String {
    "Unknown".to_string()
}

fn default_active() -> bool {
    true
}

/// Decode one base64 `f64` encoding into an embedding.
pub fn decode_embedding(encoded: &str) -> Result<Embedding, EmbeddingDecodeError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    if bytes.is_empty() {
        return Err(EmbeddingDecodeError::Empty);
    }
    if bytes.len() % F64_BYTES != 0 {
        return Err(EmbeddingDecodeError::BadLength(bytes.len()));
    }

    let mut values = Vec::with_capacity(bytes.len() / F64_BYTES);
    for chunk in bytes.chunks_exact(F64_BYTES) {
        let mut raw = [0u8; F64_BYTES];
        raw.copy_from_slice(chunk);
        let v = f64::from_le_bytes(raw);
        if !v.is_finite() {
            return Err(EmbeddingDecodeError::NonFinite);
        }
        values.push(v);
    }
    Ok(Embedding::new(values))
}

/// Encode an embedding in the record envelope (base64 over little-endian `f64`).
pub fn encode_embedding(embedding: &Embedding) -> String {
    let bytes: Vec<u8> = embedding
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    STANDARD.encode(bytes)
}

/// Identity records stored as JSON files in one directory.
pub struct DirectorySource {
    dir: PathBuf,
    /// Required embedding dimension; `None` adopts the first decoded one.
    dimension: Option<usize>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, dimension: Option<usize>) -> Self {
        Self {
            dir: dir.into(),
            dimension,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>, LoadError> {
        if !self.dir.is_dir() {
            return Err(LoadError::SourceNotFound(self.dir.clone()));
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|source| LoadError::Unreadable {
            path: self.dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        // Stable order so dimension inference and logs are reproducible.
        paths.sort();
        Ok(paths)
    }

    fn read_record(
        &self,
        path: &Path,
        dimension: &mut Option<usize>,
    ) -> Result<Identity, RecordDecodeError> {
        let text = std::fs::read_to_string(path)?;
        let record: IdentityRecord = serde_json::from_str(&text)?;

        let id = match record.id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(RecordDecodeError::MissingId),
        };

        if !record.is_active {
            return Ok(Identity {
                id,
                display_name: record.name,
                embeddings: Vec::new(),
                active: false,
            });
        }

        let mut embeddings = Vec::with_capacity(record.face_encodings.len());
        let mut failed = 0;
        for (index, encoded) in record.face_encodings.iter().enumerate() {
            let decoded = decode_embedding(encoded).and_then(|e| match *dimension {
                Some(expected) if expected != e.dim() => Err(EmbeddingDecodeError::DimensionMismatch {
                    expected,
                    actual: e.dim(),
                }),
                _ => Ok(e),
            });
            match decoded {
                Ok(e) => {
                    dimension.get_or_insert(e.dim());
                    embeddings.push(e);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(path = %path.display(), index, error = %e, "skipping face encoding");
                }
            }
        }

        if embeddings.is_empty() {
            return Err(RecordDecodeError::NoEmbeddings { failed });
        }

        Ok(Identity {
            id,
            display_name: record.name,
            embeddings,
            active: true,
        })
    }
}

impl IdentitySource for DirectorySource {
    fn load(&self) -> Result<LoadReport, LoadError> {
        let paths = self.record_paths()?;
        let mut dimension = self.dimension;
        let mut identities = Vec::with_capacity(paths.len());
        let mut skipped = Vec::new();

        for path in &paths {
            let origin = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            match self.read_record(path, &mut dimension) {
                Ok(identity) if !identity.active => {
                    tracing::debug!(origin = %origin, id = %identity.id, "inactive identity ignored");
                }
                Ok(identity) => identities.push(identity),
                Err(error) => skipped.push(SkippedRecord { origin, error }),
            }
        }

        Ok(LoadReport {
            snapshot: RepositorySnapshot::from_identities(identities),
            skipped,
        })
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}
