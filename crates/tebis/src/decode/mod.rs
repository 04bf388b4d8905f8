//! Decoders for Tebis result payloads
//!
//! Both payload flavours share the same framing convention: a magic
//! quadruple, a format version, the column/row counts, the columns, and the
//! magic quadruple again.
//!
//! - [`binary`] - run-encoded binary columns (version 2), the fast path
//! - [`text`] - delimited text (version 3), used for metadata and the slow path
//! - [`writer`] - encoder for the binary format, for fixtures and fake servers

pub mod binary;
pub mod cursor;
pub mod text;
pub mod writer;

use thiserror::Error;

/// Magic words framing every result block, leading and trailing.
pub const MAGIC: [i32; 4] = [-1, 463_453, 756_543, -1];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    // ============ Frame errors ============
    #[error("Truncated payload: need {needed} more at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Malformed result header: {0}")]
    MalformedPrefix(String),
    #[error("Bad {position} magic: {found:?}")]
    BadMagic {
        position: &'static str,
        found: [i32; 4],
    },
    #[error("Unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { expected: i32, found: i32 },
    #[error("Negative shape: {columns} columns, {rows} rows")]
    NegativeShape { columns: i64, rows: i64 },
    #[error("Decompression failed: {0}")]
    Decompress(String),

    // ============ Segment errors ============
    #[error("Column {column}: unknown segment tag {tag}")]
    UnknownSegmentTag { column: usize, tag: u8 },
    #[error("Column {column}: unknown value function {code}")]
    UnknownFunction { column: usize, code: u8 },
    #[error("Column {column}: unsupported element width {width}")]
    UnsupportedWidth { column: usize, width: u8 },
    #[error("Column {column}: unknown column type {column_type}")]
    UnknownColumnType { column: usize, column_type: i16 },
    #[error("Column {column}: runs cover {covered} rows but the block has {rows}")]
    SegmentOverflow {
        column: usize,
        covered: usize,
        rows: usize,
    },

    // ============ Layout errors ============
    #[error("Row count mismatch: table has {expected} rows, batch has {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Block has {found} columns, {available} expected")]
    ColumnCountMismatch { found: usize, available: usize },
    #[error("Block claims {found} rows, at most {limit} were requested")]
    TooManyRows { found: usize, limit: usize },
    #[error("Cannot stack tables with different point columns")]
    LayoutMismatch,
    #[error("Column {column} ('{name}'): cannot store {found} data in a {expected:?} column")]
    ColumnKindMismatch {
        column: usize,
        name: String,
        expected: ColumnKind,
        found: &'static str,
    },

    // ============ Text errors ============
    #[error("Column {column}, row {row}: invalid token '{token}'")]
    InvalidToken {
        column: usize,
        row: usize,
        token: String,
    },
    #[error("Tokenizer stopped at offset {0}")]
    Tokenize(usize),
}

impl DecodeError {
    /// Framing is broken: the block cannot be trusted at all.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::MalformedPrefix(_)
                | Self::BadMagic { .. }
                | Self::UnsupportedVersion { .. }
                | Self::NegativeShape { .. }
                | Self::Decompress(_)
        )
    }

    /// Framing is fine but a column uses an encoding this decoder does not know.
    pub fn is_segment_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownSegmentTag { .. }
                | Self::UnknownFunction { .. }
                | Self::UnsupportedWidth { .. }
                | Self::UnknownColumnType { .. }
                | Self::SegmentOverflow { .. }
        )
    }
}

// ============ Batch shape ============

/// What one data batch must look like before anything is allocated for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    /// First output column this batch writes
    pub column_offset: usize,
    /// Timestamp plus one column per requested point
    pub columns: usize,
    pub max_rows: usize,
}

impl BatchShape {
    pub fn new(column_offset: usize, points: usize, max_rows: usize) -> Self {
        Self {
            column_offset,
            columns: points + 1,
            max_rows,
        }
    }

    /// Check the counts a block header declares.
    pub fn check(&self, columns: usize, rows: usize) -> Result<(), DecodeError> {
        if columns != self.columns {
            return Err(DecodeError::ColumnCountMismatch {
                found: columns,
                available: self.columns,
            });
        }
        if rows > self.max_rows {
            return Err(DecodeError::TooManyRows {
                found: rows,
                limit: self.max_rows,
            });
        }
        Ok(())
    }
}

// ============ Column layout ============

/// Element kind of an output column, fixed when the layout is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Milliseconds since the epoch
    Timestamp,
    /// Measurement value, NaN where the server has no sample
    Value,
    /// Plain integer (ids, rates, flags in metadata tables)
    Integer,
    /// Free text (names, units, descriptions in metadata tables)
    Text,
}

/// Name and kind of one output column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn timestamp() -> Self {
        Self::new("timestamp", ColumnKind::Timestamp)
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Value)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }
}

/// Typed storage for one decoded column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int(Vec<i64>),
    Float(Vec<f32>),
    Text(Vec<String>),
}

impl ColumnData {
    fn allocate(kind: ColumnKind, rows: usize) -> Self {
        match kind {
            ColumnKind::Timestamp | ColumnKind::Integer => Self::Int(vec![0; rows]),
            ColumnKind::Value => Self::Float(vec![f32::NAN; rows]),
            ColumnKind::Text => Self::Text(vec![String::new(); rows]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Positional table produced by the decoders.
///
/// Columns follow the caller-supplied layout; every column holds exactly
/// `rows` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnTable {
    specs: Vec<ColumnSpec>,
    columns: Vec<ColumnData>,
    rows: usize,
}

impl ColumnTable {
    /// Allocate a table: integer columns zeroed, value columns NaN, text empty.
    pub fn new(specs: Vec<ColumnSpec>, rows: usize) -> Self {
        let columns = specs
            .iter()
            .map(|spec| ColumnData::allocate(spec.kind, rows))
            .collect();
        Self {
            specs,
            columns,
            rows,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn specs(&self) -> &[ColumnSpec] {
        &self.specs
    }

    pub fn column(&self, index: usize) -> Option<&ColumnData> {
        self.columns.get(index)
    }

    /// Look up a column by name
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnData> {
        let index = self.specs.iter().position(|s| s.name == name)?;
        self.columns.get(index)
    }

    pub fn ints(&self, index: usize) -> Option<&[i64]> {
        match self.columns.get(index)? {
            ColumnData::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn floats(&self, index: usize) -> Option<&[f32]> {
        match self.columns.get(index)? {
            ColumnData::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn texts(&self, index: usize) -> Option<&[String]> {
        match self.columns.get(index)? {
            ColumnData::Text(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn column_mut(&mut self, index: usize) -> &mut ColumnData {
        &mut self.columns[index]
    }

    pub(crate) fn spec(&self, index: usize) -> &ColumnSpec {
        &self.specs[index]
    }

    /// Mutable integer storage, or a kind mismatch naming what was about to be written.
    pub(crate) fn ints_mut(
        &mut self,
        index: usize,
        found: &'static str,
    ) -> Result<&mut [i64], DecodeError> {
        let spec = &self.specs[index];
        match &mut self.columns[index] {
            ColumnData::Int(v) => Ok(v),
            _ => Err(DecodeError::ColumnKindMismatch {
                column: index,
                name: spec.name.clone(),
                expected: spec.kind,
                found,
            }),
        }
    }

    pub(crate) fn floats_mut(
        &mut self,
        index: usize,
        found: &'static str,
    ) -> Result<&mut [f32], DecodeError> {
        let spec = &self.specs[index];
        match &mut self.columns[index] {
            ColumnData::Float(v) => Ok(v),
            _ => Err(DecodeError::ColumnKindMismatch {
                column: index,
                name: spec.name.clone(),
                expected: spec.kind,
                found,
            }),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<ColumnSpec>, Vec<ColumnData>, usize) {
        (self.specs, self.columns, self.rows)
    }
}

/// Fill `out` with `start, start + step, ...`
pub(crate) fn fill_linear_i64(out: &mut [i64], start: i64, step: i64) {
    let mut value = start;
    for slot in out.iter_mut() {
        *slot = value;
        value = value.wrapping_add(step);
    }
}

pub(crate) fn fill_linear_f32(out: &mut [f32], start: f64, step: f64) {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = (start + step * i as f64) as f32;
    }
}
