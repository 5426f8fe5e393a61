//! Binary record framing.
//!
//! Each record is a tag byte followed by little-endian fields:
//!
//! ```text
//! tag      u8   0 = no parent, 1 = parent present, 0xFF = end of stream
//! id       i64
//! parent   i32  only when tag == 1
//! length   u32
//! payload  [u8; length]
//! ```

use std::io::{self, Read, Write};

use super::record::Record;
use crate::errors::{ProvflowError, Result};

/// Tag terminating a record sequence.
pub const END_MARKER: u8 = 0xFF;

const TAG_NO_PARENT: u8 = 0;
const TAG_PARENT: u8 = 1;

/// Writes one record; returns the number of bytes written.
pub fn encode_record<W: Write + ?Sized>(writer: &mut W, record: &Record) -> Result<u64> {
    let length = u32::try_from(record.payload.len()).map_err(|_| {
        ProvflowError::invalid_record(format!("record {} payload exceeds 4 GiB", record.id))
    })?;

    let mut written = 1 + 8 + 4 + u64::from(length);
    match record.parent_id {
        Some(parent) => {
            writer.write_all(&[TAG_PARENT])?;
            writer.write_all(&record.id.to_le_bytes())?;
            writer.write_all(&parent.to_le_bytes())?;
            written += 4;
        }
        None => {
            writer.write_all(&[TAG_NO_PARENT])?;
            writer.write_all(&record.id.to_le_bytes())?;
        }
    }
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&record.payload)?;
    Ok(written)
}

/// Writes the end-of-stream marker.
pub fn encode_end<W: Write + ?Sized>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[END_MARKER])
}

/// Reads one record, or `None` at the end marker.
pub fn decode_record<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Record>> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;

    let parent_present = match tag[0] {
        END_MARKER => return Ok(None),
        TAG_NO_PARENT => false,
        TAG_PARENT => true,
        other => {
            return Err(ProvflowError::invalid_record(format!(
                "unknown record tag 0x{other:02x}"
            )))
        }
    };

    let id = i64::from_le_bytes(read_array(reader)?);
    let parent_id = if parent_present {
        Some(i32::from_le_bytes(read_array(reader)?))
    } else {
        None
    };
    let length = u32::from_le_bytes(read_array(reader)?);

    let mut payload = Vec::new();
    reader.take(u64::from(length)).read_to_end(&mut payload)?;
    if payload.len() as u64 != u64::from(length) {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("record {id} payload truncated"),
        )
        .into());
    }

    Ok(Some(Record { id, parent_id, payload }))
}

fn read_array<R: Read + ?Sized, const N: usize>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// A reader that counts the bytes passing through it.
#[derive(Debug)]
pub(crate) struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
