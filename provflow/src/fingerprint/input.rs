//! Input file fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use super::canonical::sha256_hex;
use crate::errors::Result;

/// Identity of an input file at the moment it was consumed.
///
/// Captured from file metadata (size and modification time). When the
/// platform cannot report a modification time the fingerprint falls back
/// to a content digest, so the shape of a fingerprint is a deterministic
/// function of the file and equality stays an equivalence relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFingerprint {
    /// Logical path as given by the caller.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// SHA-256 of the content, only when metadata was insufficient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl InputFingerprint {
    /// Fingerprints `path` from metadata, reading content only when the
    /// modification time is unavailable.
    pub fn capture(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        let digest = if modified.is_none() {
            debug!(path = %path.display(), "No modification time, digesting content");
            Some(digest_file(path)?)
        } else {
            None
        };

        Ok(Self {
            path: path.to_string_lossy().into_owned(),
            size: metadata.len(),
            modified,
            digest,
        })
    }

    /// Fingerprints `path` including a full content digest.
    pub fn capture_with_digest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut fingerprint = Self::capture(path)?;
        if fingerprint.digest.is_none() {
            fingerprint.digest = Some(digest_file(path)?);
        }
        Ok(fingerprint)
    }

    /// Re-captures the file with the same strategy and reports whether it is
    /// still the same input.
    pub fn still_matches(&self) -> Result<bool> {
        let current = if self.digest.is_some() {
            Self::capture_with_digest(&self.path)?
        } else {
            Self::capture(&self.path)?
        };
        Ok(&current == self)
    }
}

fn digest_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut content = Vec::new();
    reader.read_to_end(&mut content)?;
    Ok(sha256_hex(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_is_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"hello").unwrap();

        let fp = InputFingerprint::capture(&path).unwrap();
        assert_eq!(fp.size, 5);
        assert!(fp.modified.is_some());
        assert!(fp.digest.is_none());
        assert!(fp.still_matches().unwrap());
    }

    #[test]
    fn test_capture_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            InputFingerprint::capture(&path).unwrap(),
            InputFingerprint::capture(&path).unwrap()
        );
    }

    #[test]
    fn test_size_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"hello").unwrap();
        let fp = InputFingerprint::capture(&path).unwrap();

        std::fs::write(&path, b"hello, world").unwrap();
        assert!(!fp.still_matches().unwrap());
    }

    #[test]
    fn test_capture_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"abc").unwrap();

        let fp = InputFingerprint::capture_with_digest(&path).unwrap();
        assert_eq!(
            fp.digest.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert!(fp.still_matches().unwrap());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(InputFingerprint::capture("/definitely/not/here").is_err());
    }

    #[test]
    fn test_roundtrip_preserves_equality() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"x").unwrap();
        let fp = InputFingerprint::capture(&path).unwrap();

        let json = serde_json::to_string(&fp).unwrap();
        let back: InputFingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
