//! Undecoded batch dumps
//!
//! For consumers that decode binary payloads themselves. One record per data
//! batch, every integer u64 big-endian:
//!
//! ```text
//! point_count  id * point_count  payload_len  payload
//! ```
//!
//! Records are appended back to back; a file may hold several queries.

use std::io::{self, ErrorKind, Read, Write};

/// The ids one batch asked for and the server's payload for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    pub point_ids: Vec<i64>,
    pub payload: Vec<u8>,
}

impl RawBatch {
    /// Bytes this record takes on disk
    pub fn encoded_len(&self) -> u64 {
        8 * (self.point_ids.len() as u64 + 2) + self.payload.len() as u64
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<u64> {
        out.write_all(&(self.point_ids.len() as u64).to_be_bytes())?;
        for &id in &self.point_ids {
            out.write_all(&(id as u64).to_be_bytes())?;
        }
        out.write_all(&(self.payload.len() as u64).to_be_bytes())?;
        out.write_all(&self.payload)?;
        Ok(self.encoded_len())
    }

    /// Next record, or `None` when the input ends between records.
    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> io::Result<Option<Self>> {
        let mut word = [0u8; 8];
        let first = input.read(&mut word)?;
        if first == 0 {
            return Ok(None);
        }
        input.read_exact(&mut word[first..])?;
        let count = u64::from_be_bytes(word);

        // counts come from the file; grow as records actually arrive
        let mut point_ids = Vec::new();
        for _ in 0..count {
            input.read_exact(&mut word)?;
            point_ids.push(u64::from_be_bytes(word) as i64);
        }
        input.read_exact(&mut word)?;
        let len = u64::from_be_bytes(word);
        let mut payload = Vec::new();
        Read::take(&mut *input, len).read_to_end(&mut payload)?;
        if (payload.len() as u64) < len {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("payload ends after {} of {len} bytes", payload.len()),
            ));
        }
        Ok(Some(Self { point_ids, payload }))
    }

    /// Every record in `input`
    pub fn read_all<R: Read + ?Sized>(input: &mut R) -> io::Result<Vec<Self>> {
        let mut batches = Vec::new();
        while let Some(batch) = Self::read_from(input)? {
            batches.push(batch);
        }
        Ok(batches)
    }
}
