//! Hash chain over every chunk of a conversion run.
//!
//! Entries are appended in seal order; each one records the hash of the
//! previous entry so that a reordered or truncated sidecar is detected too.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors found while checking a chunk set against its sidecar.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("IO error reading {filename}: {source}")]
    Io {
        filename: String,
        #[source]
        source: std::io::Error,
    },
    #[error("integrity check failed for {filename}: expected {expected}, got {actual}")]
    Mismatch {
        filename: String,
        expected: String,
        actual: String,
    },
    #[error("hash chain broken at {filename}")]
    BrokenChain { filename: String },
}

/// A single entry in the integrity sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityEntry {
    pub filename: String,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Integrity sidecar (`<model>-processed-integrity.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<IntegrityEntry>,
}

impl IntegrityManifest {
    pub fn push(&mut self, filename: impl Into<String>, sha256: String) {
        let prev_hash = self.entries.last().map(|e| e.sha256.clone());
        self.entries.push(IntegrityEntry {
            filename: filename.into(),
            sha256,
            prev_hash,
        });
    }

    pub fn get(&self, filename: &str) -> Option<&IntegrityEntry> {
        self.entries.iter().find(|e| e.filename == filename)
    }

    /// Verify chain continuity and every file hash, reading files through `read`.
    pub fn verify<F>(&self, mut read: F) -> Result<(), IntegrityError>
    where
        F: FnMut(&str) -> std::io::Result<Vec<u8>>,
    {
        let mut prev_hash: Option<&str> = None;
        for entry in &self.entries {
            if entry.prev_hash.as_deref() != prev_hash {
                return Err(IntegrityError::BrokenChain {
                    filename: entry.filename.clone(),
                });
            }
            let data = read(&entry.filename).map_err(|source| IntegrityError::Io {
                filename: entry.filename.clone(),
                source,
            })?;
            let actual = sha256_hex(&data);
            if actual != entry.sha256 {
                return Err(IntegrityError::Mismatch {
                    filename: entry.filename.clone(),
                    expected: entry.sha256.clone(),
                    actual,
                });
            }
            prev_hash = Some(&entry.sha256);
        }
        Ok(())
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn files() -> HashMap<String, Vec<u8>> {
        HashMap::from([
            ("a".to_string(), b"alpha".to_vec()),
            ("b".to_string(), b"beta".to_vec()),
        ])
    }

    fn sidecar(files: &HashMap<String, Vec<u8>>) -> IntegrityManifest {
        let mut manifest = IntegrityManifest::default();
        for name in ["a", "b"] {
            manifest.push(name, sha256_hex(&files[name]));
        }
        manifest
    }

    #[test]
    fn clean_chunk_set_verifies() {
        let files = files();
        let manifest = sidecar(&files);
        assert_eq!(manifest.entries[1].prev_hash, Some(manifest.entries[0].sha256.clone()));
        manifest
            .verify(|name| Ok(files[name].clone()))
            .unwrap();
    }

    #[test]
    fn integrity_fail_closed_on_corruption() {
        let mut files = files();
        let manifest = sidecar(&files);
        files.get_mut("b").unwrap()[0] ^= 0xff;
        assert!(matches!(
            manifest.verify(|name| Ok(files[name].clone())),
            Err(IntegrityError::Mismatch { filename, .. }) if filename == "b"
        ));
    }

    #[test]
    fn reordered_sidecar_breaks_chain() {
        let files = files();
        let mut manifest = sidecar(&files);
        manifest.entries.swap(0, 1);
        assert!(matches!(
            manifest.verify(|name| Ok(files[name].clone())),
            Err(IntegrityError::BrokenChain { .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let manifest = sidecar(&files());
        let err = manifest
            .verify(|_| Err(std::io::Error::from(std::io::ErrorKind::NotFound)))
            .unwrap_err();
        assert!(matches!(err, IntegrityError::Io { .. }));
    }
}
