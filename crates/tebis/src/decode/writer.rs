//! Encoder for the binary result format.
//!
//! Produces byte-exact server responses for tests, benchmarks and fake
//! servers. Nothing in the read path depends on it.

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;

use super::MAGIC;
use super::binary::{
    BINARY_VERSION, EXTENDED_LENGTH, RunFunction, SEGMENT_LITERAL, SEGMENT_NAN, TIMESTAMP_COLUMN,
    UNCOMPRESSED, VALUE_COLUMN,
};

/// Builds one binary result block column by column.
#[derive(Debug, Clone)]
pub struct PayloadWriter {
    rows: u32,
    columns: i32,
    body: Vec<u8>,
    compressed: bool,
    version: i32,
    shape: Option<(i32, i32)>,
}

impl PayloadWriter {
    pub fn new(rows: u32) -> Self {
        Self {
            rows,
            columns: 0,
            body: Vec::new(),
            compressed: false,
            version: BINARY_VERSION,
            shape: None,
        }
    }

    /// zlib-compress the body and set the compression flag.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Override the format version written to the header.
    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Override the `(columns, rows)` written to the header.
    pub fn shape(mut self, columns: i32, rows: i32) -> Self {
        self.shape = Some((columns, rows));
        self
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Start a value column; segments and payload follow through the returned writer.
    pub fn value_column(&mut self) -> ColumnWriter<'_> {
        self.column(VALUE_COLUMN)
    }

    /// Start a column with an arbitrary type code.
    pub fn column(&mut self, column_type: i16) -> ColumnWriter<'_> {
        self.columns += 1;
        self.body.extend_from_slice(&0i16.to_be_bytes());
        self.body.extend_from_slice(&column_type.to_be_bytes());
        ColumnWriter { writer: self }
    }

    /// A timestamp column covering every row as one linear run.
    pub fn timestamp_column(&mut self, start: i64, step: i64) -> &mut Self {
        let rows = self.rows;
        let mut col = self.column(TIMESTAMP_COLUMN);
        col.literal(rows).encoding(8, RunFunction::Distinct as u8);
        col.i64(start).i64(step);
        self
    }

    /// A value column of `start, start + step, ...` (function 111, f64).
    pub fn linear_column(&mut self, start: f64, step: f64) -> &mut Self {
        let rows = self.rows;
        self.value_column()
            .literal(rows)
            .encoding(8, RunFunction::Linear as u8)
            .f64(start)
            .f64(step);
        self
    }

    /// A value column with one stored f64 per row (function 110).
    pub fn distinct_column(&mut self, values: &[f64]) -> &mut Self {
        let mut col = self.value_column();
        col.literal(values.len() as u32)
            .encoding(8, RunFunction::Distinct as u8);
        for &value in values {
            col.f64(value);
        }
        self
    }

    /// A value column of `(count, value)` groups (function 112, f64).
    pub fn grouped_column(&mut self, groups: &[(u8, f64)]) -> &mut Self {
        let rows = self.rows;
        let mut col = self.value_column();
        col.literal(rows).encoding(8, RunFunction::Grouped as u8);
        for &(count, value) in groups {
            col.u8(count).f64(value);
        }
        self
    }

    /// A value column that is NaN on every row.
    pub fn nan_column(&mut self) -> &mut Self {
        let rows = self.rows;
        self.value_column()
            .nan(rows)
            .encoding(8, RunFunction::AllNan as u8);
        self
    }

    /// Frame the body: ASCII prefix, header, (compressed) body, footer.
    pub fn finish(self) -> Vec<u8> {
        let (columns, rows) = self.shape.unwrap_or((self.columns, self.rows as i32));
        let (flag, body) = if self.compressed {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            // writes into a Vec cannot fail
            let _ = encoder.write_all(&self.body);
            (0, encoder.finish().unwrap_or_default())
        } else {
            (UNCOMPRESSED, self.body)
        };

        let mut block = Vec::with_capacity(36 + body.len() + 16);
        for word in MAGIC {
            block.extend_from_slice(&word.to_be_bytes());
        }
        for word in [self.version, columns, rows, 0, flag] {
            block.extend_from_slice(&word.to_be_bytes());
        }
        block.extend_from_slice(&body);
        for word in MAGIC {
            block.extend_from_slice(&word.to_be_bytes());
        }

        let mut out = format!("1,{},", block.len()).into_bytes();
        out.extend_from_slice(&block);
        out
    }
}

/// Appends segments and payload bytes to the current column.
#[derive(Debug)]
pub struct ColumnWriter<'a> {
    writer: &'a mut PayloadWriter,
}

impl ColumnWriter<'_> {
    /// Segment header with an explicit tag byte.
    pub fn segment(&mut self, len: u32, tag: u8) -> &mut Self {
        if len < EXTENDED_LENGTH as u32 {
            self.u8(len as u8);
        } else {
            self.u8(EXTENDED_LENGTH);
            self.bytes(&len.to_be_bytes());
        }
        self.u8(tag)
    }

    pub fn literal(&mut self, len: u32) -> &mut Self {
        self.segment(len, SEGMENT_LITERAL)
    }

    pub fn nan(&mut self, len: u32) -> &mut Self {
        self.segment(len, SEGMENT_NAN)
    }

    /// Element width and function code, written once after the segments.
    pub fn encoding(&mut self, width: u8, function: u8) -> &mut Self {
        self.u8(width).u8(function)
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.writer.body.extend_from_slice(bytes);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes(&[v])
    }

    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.bytes(&v.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::binary::BinaryFrame;

    #[test]
    fn prefix_length_matches_block() {
        let mut writer = PayloadWriter::new(2);
        writer.timestamp_column(0, 1_000).linear_column(1.0, 1.0);
        let raw = writer.finish();

        let comma = raw.iter().position(|&b| b == b',').unwrap();
        let rest = &raw[comma + 1..];
        let second = rest.iter().position(|&b| b == b',').unwrap();
        let declared: usize = std::str::from_utf8(&rest[..second]).unwrap().parse().unwrap();
        assert_eq!(declared, rest.len() - second - 1);
    }

    #[test]
    fn long_segments_use_extended_length() {
        let mut writer = PayloadWriter::new(0);
        writer.value_column().literal(254).literal(255);
        let raw = writer.finish();
        let frame = BinaryFrame::parse(&raw).unwrap();
        assert_eq!(frame.column_count, 1);

        let body = &raw[raw.len() - 16 - 12..raw.len() - 16];
        assert_eq!(body, &[0, 0, 0, 8, 254, 0, 255, 0, 0, 0, 255, 0]);
    }
}
