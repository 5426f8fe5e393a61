//! On-disk chain header.
//!
//! Layout, at byte 0 of every artifact:
//!
//! ```text
//! magic    8 bytes  "PVCHAIN\0"
//! version  u16 LE   format version, >= 1
//! length   u32 LE   byte length of the JSON document
//! chain    JSON     {"steps": [...]}
//! ```
//!
//! A file without the magic carries no chain. A file with the magic whose
//! remaining header cannot be read is corrupt.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;
use tracing::debug;

use super::chain::PipelineChain;
use crate::errors::{CorruptArtifactError, ProvflowError, Result};

/// Magic bytes opening every artifact with provenance.
pub const CHAIN_MAGIC: &[u8; 8] = b"PVCHAIN\0";

/// Current header format version.
pub const CHAIN_FORMAT_VERSION: u16 = 1;

const FIXED_LEN: u64 = 8 + 2 + 4;

/// Writes the header for `chain`; returns the number of bytes written.
pub fn write_chain_header<W: Write>(writer: &mut W, chain: &PipelineChain) -> Result<u64> {
    let json = serde_json::to_vec(chain)?;
    let length = u32::try_from(json.len())
        .map_err(|_| ProvflowError::invalid_state("provenance chain exceeds 4 GiB"))?;

    writer.write_all(CHAIN_MAGIC)?;
    writer.write_all(&CHAIN_FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&json)?;
    Ok(FIXED_LEN + u64::from(length))
}

/// Reads a header from the start of `reader`.
///
/// Returns the chain and the offset at which the artifact body begins, or
/// `None` when the stream does not start with the magic. `file_len` bounds
/// the declared JSON length; `path` is only used in error messages.
pub fn read_chain_header<R: Read>(
    reader: &mut R,
    file_len: u64,
    path: &Path,
) -> Result<Option<(PipelineChain, u64)>> {
    let mut magic = [0u8; 8];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if &magic != CHAIN_MAGIC {
        return Ok(None);
    }

    let corrupt = |reason: String| ProvflowError::from(CorruptArtifactError::new(path, reason));

    let mut version = [0u8; 2];
    let mut length = [0u8; 4];
    reader
        .read_exact(&mut version)
        .and_then(|()| reader.read_exact(&mut length))
        .map_err(|e| corrupt(format!("truncated chain header: {e}")))?;

    let version = u16::from_le_bytes(version);
    if version == 0 {
        return Err(corrupt("chain header declares format version 0".to_string()));
    }
    if version > CHAIN_FORMAT_VERSION {
        debug!(version, path = %path.display(), "Reading newer chain header format");
    }

    let length = u64::from(u32::from_le_bytes(length));
    if FIXED_LEN + length > file_len {
        return Err(corrupt(format!(
            "chain header claims {length} bytes but the file holds {}",
            file_len.saturating_sub(FIXED_LEN)
        )));
    }

    let mut json = vec![0u8; usize::try_from(length).unwrap_or(usize::MAX)];
    reader
        .read_exact(&mut json)
        .map_err(|e| corrupt(format!("truncated chain document: {e}")))?;

    let chain: PipelineChain = serde_json::from_slice(&json)
        .map_err(|e| corrupt(format!("unparsable chain document: {e}")))?;
    if chain.is_empty() {
        return Err(corrupt("chain header holds no steps".to_string()));
    }
    let chain = PipelineChain::from_steps(chain.into_iter().collect())
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(Some((chain, FIXED_LEN + length)))
}

impl PipelineChain {
    /// Reads the chain recorded in the artifact at `path`.
    ///
    /// Returns `Ok(None)` when the file does not exist or carries no chain,
    /// and [`CorruptArtifactError`] when a header is present but invalid.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        Ok(read_chain_header(&mut reader, file_len, path)?.map(|(chain, _)| chain))
    }
}
