//! Binary result decoder (format version 2)
//!
//! Layout of a response payload:
//!
//! ```text
//! "<result sets>,<length>,"              ASCII prefix
//! magic[4] version cols rows r0 zflag    9 x i32 BE
//! body                                   zlib-compressed unless zflag == -1
//! magic[4]                               4 x i32 BE
//! ```
//!
//! Each column in the body:
//!
//! ```text
//! reserved:i16 type:i16                  301 = timestamp, 8 = value
//! (len:u8 [len:u32 if 255] tag:u8)*      segments until row_count is covered
//! width:u8 function:u8
//! function payload
//! ```

use std::borrow::Cow;
use std::io::Read;

use flate2::read::ZlibDecoder;

use super::cursor::ByteCursor;
use super::{
    BatchShape, ColumnSpec, ColumnTable, DecodeError, MAGIC, fill_linear_f32, fill_linear_i64,
};

pub const BINARY_VERSION: i32 = 2;

pub(crate) const TIMESTAMP_COLUMN: i16 = 301;
pub(crate) const VALUE_COLUMN: i16 = 8;

pub(crate) const SEGMENT_LITERAL: u8 = 0;
pub(crate) const SEGMENT_NAN: u8 = 255;
pub(crate) const EXTENDED_LENGTH: u8 = 255;

/// Compression flag value for a raw body
pub(crate) const UNCOMPRESSED: i32 = -1;

const HEADER_WORDS: usize = 9;
const FOOTER_LEN: usize = 16;

/// How the literal segments of a value column are packed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunFunction {
    /// Every literal row is NaN
    AllNan = 109,
    /// One stored value per row
    Distinct = 110,
    /// One value and one step for the whole column
    Linear = 111,
    /// (count, value) groups, counts carry across segments
    Grouped = 112,
}

impl RunFunction {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            109 => Some(Self::AllNan),
            110 => Some(Self::Distinct),
            111 => Some(Self::Linear),
            112 => Some(Self::Grouped),
            _ => None,
        }
    }
}

/// Stored element width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueWidth {
    I8,
    I16,
    I32,
    F64,
}

impl ValueWidth {
    fn from_code(width: u8) -> Option<Self> {
        match width {
            1 => Some(Self::I8),
            2 => Some(Self::I16),
            4 => Some(Self::I32),
            8 => Some(Self::F64),
            _ => None,
        }
    }

    fn read(self, cursor: &mut ByteCursor<'_>) -> Result<f64, DecodeError> {
        Ok(match self {
            Self::I8 => cursor.read_i8()? as f64,
            Self::I16 => cursor.read_i16()? as f64,
            Self::I32 => cursor.read_i32()? as f64,
            Self::F64 => cursor.read_f64()?,
        })
    }
}

/// A validated binary block with its body ready for column decoding.
#[derive(Debug)]
pub struct BinaryFrame<'a> {
    pub column_count: usize,
    pub row_count: usize,
    pub compressed: bool,
    body: Cow<'a, [u8]>,
}

impl<'a> BinaryFrame<'a> {
    /// Check prefix, header, footer and shape, and inflate the body if needed.
    pub fn parse(raw: &'a [u8]) -> Result<Self, DecodeError> {
        Self::read(raw, None)
    }

    /// Like [`parse`](Self::parse), rejecting a header that does not match
    /// `shape` before the body is inflated.
    pub fn parse_as(raw: &'a [u8], shape: &BatchShape) -> Result<Self, DecodeError> {
        Self::read(raw, Some(shape))
    }

    fn read(raw: &'a [u8], shape: Option<&BatchShape>) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(raw);
        let _result_sets = read_ascii_number(&mut cursor, "result-set count")?;
        let _length = read_ascii_number(&mut cursor, "result-set length")?;

        let mut header = [0i32; HEADER_WORDS];
        for word in header.iter_mut() {
            *word = cursor.read_i32()?;
        }

        let body_start = cursor.position();
        if raw.len() < body_start + FOOTER_LEN {
            return Err(DecodeError::Truncated {
                offset: body_start,
                needed: FOOTER_LEN,
                available: raw.len() - body_start,
            });
        }
        let body_end = raw.len() - FOOTER_LEN;
        let mut footer_cursor = ByteCursor::new(&raw[body_end..]);
        let mut footer = [0i32; 4];
        for word in footer.iter_mut() {
            *word = footer_cursor.read_i32()?;
        }

        let leading = [header[0], header[1], header[2], header[3]];
        if leading != MAGIC {
            return Err(DecodeError::BadMagic {
                position: "header",
                found: leading,
            });
        }
        if footer != MAGIC {
            return Err(DecodeError::BadMagic {
                position: "footer",
                found: footer,
            });
        }
        if header[4] != BINARY_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                expected: BINARY_VERSION,
                found: header[4],
            });
        }
        let (columns, rows) = (header[5], header[6]);
        if columns < 0 || rows < 0 {
            return Err(DecodeError::NegativeShape {
                columns: columns.into(),
                rows: rows.into(),
            });
        }
        if let Some(shape) = shape {
            shape.check(columns as usize, rows as usize)?;
        }

        let compressed = header[8] != UNCOMPRESSED;
        let payload = &raw[body_start..body_end];
        let body = if compressed {
            let mut inflated = Vec::with_capacity(payload.len() * 4);
            ZlibDecoder::new(payload)
                .read_to_end(&mut inflated)
                .map_err(|e| DecodeError::Decompress(e.to_string()))?;
            Cow::Owned(inflated)
        } else {
            Cow::Borrowed(payload)
        };

        Ok(Self {
            column_count: columns as usize,
            row_count: rows as usize,
            compressed,
            body,
        })
    }

    /// Decode every column of this block into `table`, starting at `column_offset`.
    ///
    /// Timestamp columns are only written for the first batch (`column_offset == 0`).
    pub fn decode_into(
        &self,
        table: &mut ColumnTable,
        column_offset: usize,
    ) -> Result<(), DecodeError> {
        if table.rows() != self.row_count {
            return Err(DecodeError::ShapeMismatch {
                expected: table.rows(),
                found: self.row_count,
            });
        }
        let available = table.width().saturating_sub(column_offset);
        if self.column_count > available {
            return Err(DecodeError::ColumnCountMismatch {
                found: self.column_count,
                available,
            });
        }

        let merging = column_offset != 0;
        let mut cursor = ByteCursor::new(&self.body);
        for local in 0..self.column_count {
            decode_column(&mut cursor, table, column_offset + local, merging)?;
        }
        Ok(())
    }
}

/// Decode a binary batch into a fresh table laid out as `columns`, or merge
/// it into `existing`. Nothing is allocated until the header matches `shape`.
pub fn decode(
    raw: &[u8],
    columns: &[ColumnSpec],
    existing: Option<ColumnTable>,
    shape: BatchShape,
) -> Result<ColumnTable, DecodeError> {
    let frame = BinaryFrame::parse_as(raw, &shape)?;
    let mut table =
        existing.unwrap_or_else(|| ColumnTable::new(columns.to_vec(), frame.row_count));
    frame.decode_into(&mut table, shape.column_offset)?;
    log::debug!(
        "decoded {} columns x {} rows at offset {} (compressed: {})",
        frame.column_count,
        frame.row_count,
        shape.column_offset,
        frame.compressed
    );
    Ok(table)
}

fn read_ascii_number(cursor: &mut ByteCursor<'_>, what: &str) -> Result<i64, DecodeError> {
    let digits = cursor.read_until(b',')?;
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            DecodeError::MalformedPrefix(format!(
                "{what}: '{}'",
                String::from_utf8_lossy(digits)
            ))
        })
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    len: usize,
}

impl Segment {
    fn range(self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }
}

/// Scan the segment list of one column. NaN segments are returned separately
/// from literal ones; together they cover exactly `rows` rows.
fn scan_segments(
    cursor: &mut ByteCursor<'_>,
    rows: usize,
    column: usize,
) -> Result<(Vec<Segment>, Vec<Segment>), DecodeError> {
    let mut literal = Vec::new();
    let mut nan = Vec::new();
    let mut covered = 0usize;
    while covered < rows {
        let short = cursor.read_u8()?;
        let len = if short == EXTENDED_LENGTH {
            cursor.read_u32()? as usize
        } else {
            short as usize
        };
        let tag = cursor.read_u8()?;
        let end = covered.saturating_add(len);
        if end > rows {
            return Err(DecodeError::SegmentOverflow {
                column,
                covered: end,
                rows,
            });
        }
        let segment = Segment {
            start: covered,
            len,
        };
        match tag {
            SEGMENT_LITERAL => literal.push(segment),
            SEGMENT_NAN => nan.push(segment),
            other => return Err(DecodeError::UnknownSegmentTag { column, tag: other }),
        }
        covered = end;
    }
    Ok((literal, nan))
}

fn decode_column(
    cursor: &mut ByteCursor<'_>,
    table: &mut ColumnTable,
    column: usize,
    merging: bool,
) -> Result<(), DecodeError> {
    let _reserved = cursor.read_i16()?;
    let column_type = cursor.read_i16()?;
    let (literal, nan) = scan_segments(cursor, table.rows(), column)?;
    let width = cursor.read_u8()?;
    let function = cursor.read_u8()?;

    match column_type {
        TIMESTAMP_COLUMN => {
            if merging {
                // Later batches repeat the time axis; only step over it.
                cursor.read_bytes(16 * literal.len())?;
                return Ok(());
            }
            let out = table.ints_mut(column, "timestamp")?;
            if let Some(segment) = nan.first() {
                return Err(DecodeError::InvalidToken {
                    column,
                    row: segment.start,
                    token: "NaN timestamp".to_string(),
                });
            }
            for segment in &literal {
                let start = cursor.read_i64()?;
                let step = cursor.read_i64()?;
                fill_linear_i64(&mut out[segment.range()], start, step);
            }
            Ok(())
        }
        VALUE_COLUMN => {
            let out = table.floats_mut(column, "value")?;
            for segment in &nan {
                out[segment.range()].fill(f32::NAN);
            }
            let function = RunFunction::from_code(function)
                .ok_or(DecodeError::UnknownFunction {
                    column,
                    code: function,
                })?;
            let width = || {
                ValueWidth::from_code(width).ok_or(DecodeError::UnsupportedWidth { column, width })
            };
            match function {
                RunFunction::AllNan => {
                    for segment in &literal {
                        out[segment.range()].fill(f32::NAN);
                    }
                }
                RunFunction::Distinct => {
                    let width = width()?;
                    for segment in &literal {
                        for slot in &mut out[segment.range()] {
                            *slot = width.read(cursor)? as f32;
                        }
                    }
                }
                RunFunction::Linear => {
                    let width = width()?;
                    let start = width.read(cursor)?;
                    let step = width.read(cursor)?;
                    for segment in &literal {
                        fill_linear_f32(&mut out[segment.range()], start, step);
                    }
                }
                RunFunction::Grouped => {
                    decode_grouped(cursor, out, &literal, width)?;
                }
            }
            Ok(())
        }
        other => Err(DecodeError::UnknownColumnType {
            column,
            column_type: other,
        }),
    }
}

/// Function 112: `(count:u8, value)` groups spread over the literal segments.
///
/// A group longer than the rest of a segment continues into the next one; a
/// zero count ends the current segment early.
fn decode_grouped(
    cursor: &mut ByteCursor<'_>,
    out: &mut [f32],
    literal: &[Segment],
    width: impl Fn() -> Result<ValueWidth, DecodeError>,
) -> Result<(), DecodeError> {
    let mut group_left = 0usize;
    let mut value = f32::NAN;
    for segment in literal {
        let mut filled = 0usize;
        while filled < segment.len {
            if group_left == 0 {
                group_left = cursor.read_u8()? as usize;
                if group_left == 0 {
                    break;
                }
                value = width()?.read(cursor)? as f32;
            }
            let n = group_left.min(segment.len - filled);
            let from = segment.start + filled;
            out[from..from + n].fill(value);
            filled += n;
            group_left -= n;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::writer::{ColumnWriter, PayloadWriter};

    fn layout(values: usize) -> Vec<ColumnSpec> {
        let mut specs = vec![ColumnSpec::timestamp()];
        specs.extend((0..values).map(|i| ColumnSpec::value(format!("p{i}"))));
        specs
    }

    /// First batch of `points` points, up to 1000 rows
    fn shape(points: usize) -> BatchShape {
        BatchShape::new(0, points, 1_000)
    }

    fn single_value_payload(rows: u32, build: impl FnOnce(&mut ColumnWriter<'_>)) -> Vec<u8> {
        let mut writer = PayloadWriter::new(rows);
        writer.timestamp_column(1_000, 1_000);
        build(&mut writer.value_column());
        writer.finish()
    }

    #[test]
    fn timestamp_and_linear_value_column() {
        let raw = single_value_payload(4, |col| {
            col.literal(4).encoding(8, 111).f64(10.0).f64(0.5);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        assert_eq!(table.ints(0).unwrap(), &[1_000, 2_000, 3_000, 4_000]);
        assert_eq!(table.floats(1).unwrap(), &[10.0, 10.5, 11.0, 11.5]);
    }

    #[test]
    fn constant_run_with_zero_step_repeats_one_value() {
        let raw = single_value_payload(6, |col| {
            col.literal(6).encoding(4, 111).i32(42).i32(0);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        assert_eq!(table.floats(1).unwrap(), &[42.0; 6]);
    }

    #[test]
    fn grouped_runs_expand_in_order() {
        let raw = single_value_payload(5, |col| {
            col.literal(5)
                .encoding(8, 112)
                .u8(3)
                .f64(5.0)
                .u8(2)
                .f64(7.0);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        assert_eq!(table.floats(1).unwrap(), &[5.0, 5.0, 5.0, 7.0, 7.0]);
    }

    #[test]
    fn grouped_run_carries_across_segments() {
        // literal 2 | nan 1 | literal 3, one group of 4 then one of 1
        let raw = single_value_payload(6, |col| {
            col.literal(2)
                .nan(1)
                .literal(3)
                .encoding(2, 112)
                .u8(4)
                .i16(-3)
                .u8(1)
                .i16(9);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        let values = table.floats(1).unwrap();
        assert_eq!(&values[..2], &[-3.0, -3.0]);
        assert!(values[2].is_nan());
        assert_eq!(&values[3..], &[-3.0, -3.0, 9.0]);
    }

    #[test]
    fn zero_group_count_leaves_rows_nan() {
        let raw = single_value_payload(4, |col| {
            col.literal(4).encoding(1, 112).u8(2).i8(3).u8(0);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        let values = table.floats(1).unwrap();
        assert_eq!(&values[..2], &[3.0, 3.0]);
        assert!(values[2].is_nan() && values[3].is_nan());
    }

    #[test]
    fn distinct_values_per_segment_with_extended_length() {
        let rows = 300u32;
        let raw = single_value_payload(rows, |col| {
            col.literal(rows).encoding(2, 110);
            for i in 0..rows {
                col.i16(i as i16 - 150);
            }
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        let values = table.floats(1).unwrap();
        assert_eq!(values.len(), 300);
        assert_eq!(values[0], -150.0);
        assert_eq!(values[299], 149.0);
    }

    #[test]
    fn nan_segment_ignores_function_and_width() {
        for (width, function) in [(8, 110), (3, 112), (0, 109)] {
            let raw = single_value_payload(3, |col| {
                col.nan(3).encoding(width, function);
            });
            let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
            assert!(table.floats(1).unwrap().iter().all(|v| v.is_nan()));
        }
    }

    #[test]
    fn linear_run_on_all_nan_column_still_reads_start_and_step() {
        let raw = single_value_payload(3, |col| {
            col.nan(3).encoding(1, 111).i8(5).i8(1);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        assert!(table.floats(1).unwrap().iter().all(|v| v.is_nan()));

        // without them the column is short
        let raw = single_value_payload(3, |col| {
            col.nan(3).encoding(1, 111);
        });
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }), "{err:?}");
    }

    #[test]
    fn nan_segment_wins_over_linear_literals() {
        // literal 2 | nan 2 | literal 1 with start 10, step 1
        let raw = single_value_payload(5, |col| {
            col.literal(2).nan(2).literal(1).encoding(1, 111).i8(10).i8(1);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        let values = table.floats(1).unwrap();
        assert_eq!(&values[..2], &[10.0, 11.0]);
        assert!(values[2].is_nan() && values[3].is_nan());
        assert_eq!(values[4], 10.0);
    }

    #[test]
    fn all_nan_function_blanks_literal_rows() {
        let raw = single_value_payload(2, |col| {
            col.literal(2).encoding(8, 109);
        });
        let table = decode(&raw, &layout(1), None, shape(1)).unwrap();
        assert!(table.floats(1).unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn compressed_body_decodes_like_raw() {
        let build = |compressed: bool| {
            let mut writer = PayloadWriter::new(3).compressed(compressed);
            writer.timestamp_column(0, 60_000);
            writer
                .value_column()
                .literal(3)
                .encoding(8, 110)
                .f64(1.5)
                .f64(2.5)
                .f64(3.5);
            writer.finish()
        };
        let raw = decode(&build(false), &layout(1), None, shape(1)).unwrap();
        let zipped = decode(&build(true), &layout(1), None, shape(1)).unwrap();
        assert_eq!(raw, zipped);
        assert!(BinaryFrame::parse(&build(true)).unwrap().compressed);
    }

    #[test]
    fn unknown_segment_tag_is_rejected() {
        let raw = single_value_payload(2, |col| {
            col.segment(2, 7).encoding(8, 110).f64(1.0).f64(2.0);
        });
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert_eq!(err, DecodeError::UnknownSegmentTag { column: 1, tag: 7 });
        assert!(err.is_segment_error());
    }

    #[test]
    fn unknown_function_is_rejected_with_its_code() {
        let raw = single_value_payload(2, |col| {
            col.literal(2).encoding(8, 113);
        });
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert_eq!(err, DecodeError::UnknownFunction { column: 1, code: 113 });
    }

    #[test]
    fn unsupported_width_is_rejected() {
        let raw = single_value_payload(1, |col| {
            col.literal(1).encoding(3, 110).u8(0).u8(0).u8(0);
        });
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedWidth { column: 1, width: 3 });
    }

    #[test]
    fn overlong_segment_is_rejected() {
        let raw = single_value_payload(2, |col| {
            col.literal(3).encoding(8, 109);
        });
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert!(matches!(err, DecodeError::SegmentOverflow { covered: 3, rows: 2, .. }));
    }

    #[test]
    fn version_and_shape_are_checked() {
        let raw = PayloadWriter::new(1).version(3).finish();
        assert_eq!(
            decode(&raw, &layout(0), None, shape(0)).unwrap_err(),
            DecodeError::UnsupportedVersion {
                expected: 2,
                found: 3
            }
        );

        let raw = PayloadWriter::new(1).shape(-1, 4).finish();
        assert!(matches!(
            decode(&raw, &layout(0), None, shape(0)).unwrap_err(),
            DecodeError::NegativeShape { columns: -1, rows: 4 }
        ));
    }

    #[test]
    fn footer_magic_is_checked() {
        let mut raw = single_value_payload(1, |col| {
            col.literal(1).encoding(8, 110).f64(1.0);
        });
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert!(matches!(err, DecodeError::BadMagic { position: "footer", .. }));
    }

    #[test]
    fn truncated_body_is_a_frame_error() {
        // declares two rows of distinct values but only carries one
        let raw = single_value_payload(2, |col| {
            col.literal(2).encoding(8, 110).f64(1.0);
        });
        let err = decode(&raw, &layout(1), None, shape(1)).unwrap_err();
        assert!(err.is_frame_error(), "{err:?}");
    }

    #[test]
    fn merge_skips_later_timestamps_and_checks_rows() {
        let first = single_value_payload(2, |col| {
            col.literal(2).encoding(8, 110).f64(1.0).f64(2.0);
        });
        let mut second = PayloadWriter::new(2);
        second.timestamp_column(99, 99);
        second
            .value_column()
            .literal(2)
            .encoding(8, 110)
            .f64(3.0)
            .f64(4.0);
        let second = second.finish();

        let specs = layout(2);
        let table = decode(&first, &specs, None, shape(1)).unwrap();
        let table = decode(&second, &specs, Some(table), BatchShape::new(1, 1, 10)).unwrap();
        assert_eq!(table.ints(0).unwrap(), &[1_000, 2_000]);
        assert_eq!(table.floats(1).unwrap(), &[1.0, 2.0]);
        assert_eq!(table.floats(2).unwrap(), &[3.0, 4.0]);

        let short = single_value_payload(3, |col| {
            col.literal(3).encoding(8, 109);
        });
        let table = decode(&first, &specs, None, shape(1)).unwrap();
        assert_eq!(
            decode(&short, &specs, Some(table), BatchShape::new(1, 1, 10)).unwrap_err(),
            DecodeError::ShapeMismatch {
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn batch_missing_a_point_column_is_rejected() {
        // two points requested, one value column answered
        let raw = single_value_payload(2, |col| {
            col.literal(2).encoding(8, 110).f64(1.0).f64(2.0);
        });
        let err = decode(&raw, &layout(2), None, shape(2)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ColumnCountMismatch {
                found: 2,
                available: 3
            }
        );
    }

    #[test]
    fn huge_row_claim_fails_before_allocating() {
        let raw = PayloadWriter::new(1).shape(101, i32::MAX).finish();
        let err = decode(&raw, &layout(100), None, BatchShape::new(0, 100, 3_600)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooManyRows {
                found: i32::MAX as usize,
                limit: 3_600
            }
        );
    }

    #[test]
    fn too_many_columns_for_layout() {
        let raw = single_value_payload(1, |col| {
            col.literal(1).encoding(8, 110).f64(1.0);
        });
        let err = decode(&raw, &layout(0), None, shape(0)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ColumnCountMismatch {
                found: 2,
                available: 1
            }
        );
    }
}
