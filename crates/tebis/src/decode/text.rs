//! Delimited-text result decoder (format version 3)
//!
//! The server answers metadata requests (`GetConfig`) and the slow data
//! procedure (`JLoadData`) with Latin-1 CSV using `'` as the quote
//! character. Flattened into one token stream the block reads:
//!
//! ```text
//! n len_1 .. len_n  magic[4] 3 cols rows  (type has_name cells..)*  magic[4]
//! ```
//!
//! Cells are either literals (one per row) or runs:
//! `d,len,start,step` for linear runs and `i,len,value` for repeats.

use std::borrow::Cow;
use std::ops::Range;

use winnow::combinator::{alt, delimited, repeat, separated};
use winnow::prelude::*;
use winnow::token::take_till;

use super::{
    BatchShape, ColumnData, ColumnKind, ColumnSpec, ColumnTable, DecodeError, MAGIC,
    fill_linear_f32, fill_linear_i64,
};

type PResult<T> = winnow::ModalResult<T>;

pub const TEXT_VERSION: i32 = 3;

const LINEAR_RUN: &str = "d";
const REPEAT_RUN: &str = "i";

/// Tokenize and decode a text payload into a table laid out as `columns`.
pub fn decode_text(raw: &[u8], columns: &[ColumnSpec]) -> Result<ColumnTable, DecodeError> {
    let tokens = tokenize(raw)?;
    decode_fields(&tokens, columns)
}

/// Decode one `JLoadData` batch; `columns` is the batch's own layout and the
/// header must match `shape` before rows are allocated.
pub fn decode_text_batch(
    raw: &[u8],
    columns: &[ColumnSpec],
    shape: &BatchShape,
) -> Result<ColumnTable, DecodeError> {
    let tokens = tokenize(raw)?;
    decode_block(&tokens, columns, Some(shape))
}

/// Split a Latin-1 CSV payload into one flat token list.
///
/// Blank records are skipped and quote characters never survive into a token.
pub fn tokenize(raw: &[u8]) -> Result<Vec<String>, DecodeError> {
    let text = latin1(raw);
    let mut input = text.as_str();
    let records = match document.parse_next(&mut input) {
        Ok(records) if input.is_empty() => records,
        _ => {
            let consumed = text.len() - input.len();
            return Err(DecodeError::Tokenize(text[..consumed].chars().count()));
        }
    };

    Ok(records
        .into_iter()
        .filter(|record| !(record.len() == 1 && record[0].is_empty()))
        .flatten()
        .map(|token| {
            if token.contains('\'') {
                token.replace('\'', "")
            } else {
                token
            }
        })
        .collect())
}

/// Decode an already tokenized block.
pub fn decode_fields(
    tokens: &[String],
    columns: &[ColumnSpec],
) -> Result<ColumnTable, DecodeError> {
    decode_block(tokens, columns, None)
}

fn decode_block(
    tokens: &[String],
    columns: &[ColumnSpec],
    shape: Option<&BatchShape>,
) -> Result<ColumnTable, DecodeError> {
    let mut cursor = Tokens { tokens, pos: 0 };

    let result_sets = cursor.header("result-set count")?;
    if result_sets < 0 {
        return Err(DecodeError::MalformedPrefix(format!(
            "result-set count {result_sets}"
        )));
    }
    // the result-set lengths are not needed
    cursor.skip(result_sets as usize)?;

    let leading = cursor.magic()?;
    if leading != MAGIC {
        return Err(DecodeError::BadMagic {
            position: "header",
            found: leading,
        });
    }
    let version = cursor.header("version")?;
    if version != TEXT_VERSION as i64 {
        return Err(DecodeError::UnsupportedVersion {
            expected: TEXT_VERSION,
            found: version as i32,
        });
    }
    let column_count = cursor.header("column count")?;
    let row_count = cursor.header("row count")?;
    if column_count < 0 || row_count < 0 {
        return Err(DecodeError::NegativeShape {
            columns: column_count,
            rows: row_count,
        });
    }
    let (column_count, rows) = (column_count as usize, row_count as usize);
    if let Some(shape) = shape {
        shape.check(column_count, rows)?;
    }
    if column_count > columns.len() {
        return Err(DecodeError::ColumnCountMismatch {
            found: column_count,
            available: columns.len(),
        });
    }

    let mut table = ColumnTable::new(columns.to_vec(), rows);
    for column in 0..column_count {
        let _column_type = cursor.header("column type")?;
        let _has_name = cursor.header("column name flag")?;
        decode_column(&mut cursor, &mut table, column)?;
    }

    let trailing = cursor.magic()?;
    if trailing != MAGIC {
        return Err(DecodeError::BadMagic {
            position: "footer",
            found: trailing,
        });
    }
    log::debug!("decoded text block: {column_count} columns x {rows} rows");
    Ok(table)
}

fn decode_column(
    cursor: &mut Tokens<'_>,
    table: &mut ColumnTable,
    column: usize,
) -> Result<(), DecodeError> {
    let rows = table.rows();
    let mut row = 0;
    while row < rows {
        match cursor.next()? {
            LINEAR_RUN => {
                let range = cursor.run(column, row, rows)?;
                let start = cursor.next()?;
                let step = cursor.next()?;
                fill_linear(table, column, range.clone(), start, step)?;
                row = range.end;
            }
            REPEAT_RUN => {
                let range = cursor.run(column, row, rows)?;
                let value = cursor.next()?;
                fill_cells(table.column_mut(column), range.clone(), value, column)?;
                row = range.end;
            }
            literal => {
                fill_cells(table.column_mut(column), row..row + 1, literal, column)?;
                row += 1;
            }
        }
    }
    Ok(())
}

fn fill_linear(
    table: &mut ColumnTable,
    column: usize,
    range: Range<usize>,
    start: &str,
    step: &str,
) -> Result<(), DecodeError> {
    let row = range.start;
    match table.column_mut(column) {
        ColumnData::Int(v) => fill_linear_i64(
            &mut v[range],
            parse_int(start, column, row)?,
            parse_int(step, column, row)?,
        ),
        ColumnData::Float(v) => fill_linear_f32(
            &mut v[range],
            parse_float(start, column, row)?,
            parse_float(step, column, row)?,
        ),
        ColumnData::Text(_) => {
            return Err(DecodeError::ColumnKindMismatch {
                column,
                name: table.spec(column).name.clone(),
                expected: ColumnKind::Text,
                found: "linear run",
            });
        }
    }
    Ok(())
}

/// Write one token into every row of `range`, coerced to the column's kind.
fn fill_cells(
    data: &mut ColumnData,
    range: Range<usize>,
    token: &str,
    column: usize,
) -> Result<(), DecodeError> {
    let row = range.start;
    match data {
        ColumnData::Int(v) => v[range].fill(parse_int(token, column, row)?),
        ColumnData::Float(v) => {
            let value = if token.is_empty() {
                f32::NAN
            } else {
                parse_float(token, column, row)? as f32
            };
            v[range].fill(value);
        }
        ColumnData::Text(v) => {
            for slot in &mut v[range] {
                *slot = token.to_string();
            }
        }
    }
    Ok(())
}

fn parse_int(token: &str, column: usize, row: usize) -> Result<i64, DecodeError> {
    token.trim().parse().map_err(|_| invalid(token, column, row))
}

fn parse_float(token: &str, column: usize, row: usize) -> Result<f64, DecodeError> {
    token.trim().parse().map_err(|_| invalid(token, column, row))
}

fn invalid(token: &str, column: usize, row: usize) -> DecodeError {
    DecodeError::InvalidToken {
        column,
        row,
        token: token.to_string(),
    }
}

fn latin1(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

// ============ Token stream ============

struct Tokens<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Result<&'a str, DecodeError> {
        let token = self.tokens.get(self.pos).ok_or(DecodeError::Truncated {
            offset: self.pos,
            needed: 1,
            available: 0,
        })?;
        self.pos += 1;
        Ok(token.as_str())
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        let available = self.tokens.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        self.pos += n;
        Ok(())
    }

    fn header(&mut self, what: &str) -> Result<i64, DecodeError> {
        let token = self.next()?;
        token
            .trim()
            .parse()
            .map_err(|_| DecodeError::MalformedPrefix(format!("{what}: '{token}'")))
    }

    fn magic(&mut self) -> Result<[i32; 4], DecodeError> {
        let mut words = [0i32; 4];
        for word in words.iter_mut() {
            let value = self.header("magic word")?;
            // out-of-range words still fail the comparison
            *word = i32::try_from(value).unwrap_or(0);
        }
        Ok(words)
    }

    /// Read a run length and check it fits in the rows left.
    fn run(
        &mut self,
        column: usize,
        row: usize,
        rows: usize,
    ) -> Result<Range<usize>, DecodeError> {
        let token = self.next()?;
        let len: usize = token.trim().parse().map_err(|_| invalid(token, column, row))?;
        let end = row.saturating_add(len);
        if end > rows {
            return Err(DecodeError::SegmentOverflow {
                column,
                covered: end,
                rows,
            });
        }
        Ok(row..end)
    }
}

// ============ CSV grammar ============

fn document(input: &mut &str) -> PResult<Vec<Vec<String>>> {
    separated(0.., record, line_break).parse_next(input)
}

fn record(input: &mut &str) -> PResult<Vec<String>> {
    separated(1.., field, ',').parse_next(input)
}

fn line_break<'a>(input: &mut &'a str) -> PResult<&'a str> {
    alt(("\r\n", "\n", "\r")).parse_next(input)
}

fn field(input: &mut &str) -> PResult<String> {
    repeat(0.., alt((quoted, unquoted, stray_quote)))
        .fold(String::new, |mut acc, part: Cow<'_, str>| {
            acc.push_str(&part);
            acc
        })
        .parse_next(input)
}

/// `'...'` with `''` standing for one quote; may span line breaks.
fn quoted<'a>(input: &mut &'a str) -> PResult<Cow<'a, str>> {
    delimited(
        '\'',
        repeat(0.., alt((take_till(1.., '\''), "''".value("'")))).fold(
            String::new,
            |mut acc, part: &str| {
                acc.push_str(part);
                acc
            },
        ),
        '\'',
    )
    .map(Cow::Owned)
    .parse_next(input)
}

fn unquoted<'a>(input: &mut &'a str) -> PResult<Cow<'a, str>> {
    take_till(1.., [',', '\'', '\r', '\n'])
        .map(Cow::Borrowed)
        .parse_next(input)
}

fn stray_quote<'a>(input: &mut &'a str) -> PResult<Cow<'a, str>> {
    '\''.value(Cow::Borrowed("")).parse_next(input)
}
