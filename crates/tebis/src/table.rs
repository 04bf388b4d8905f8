//! Query results: the aligned output table and the per-batch assembler

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::decode::binary;
use crate::decode::{BatchShape, ColumnData, ColumnKind, ColumnSpec, ColumnTable, DecodeError};

/// Shared timestamp column plus one value column per point, keyed by point name
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultTable {
    timestamp: Vec<i64>,
    values: IndexMap<String, Vec<f32>>,
}

impl ResultTable {
    /// Take a decoded `timestamp, value..` table apart into named columns.
    pub fn from_columns(table: ColumnTable) -> Result<Self, DecodeError> {
        let (specs, columns, _) = table.into_parts();
        let mut timestamp = Vec::new();
        let mut values = IndexMap::with_capacity(specs.len().saturating_sub(1));
        for (index, (spec, data)) in specs.into_iter().zip(columns).enumerate() {
            match (index, spec.kind, data) {
                (0, ColumnKind::Timestamp, ColumnData::Int(ts)) => timestamp = ts,
                (i, ColumnKind::Value, ColumnData::Float(v)) if i > 0 => {
                    values.insert(spec.name, v);
                }
                (_, _, data) => {
                    return Err(DecodeError::ColumnKindMismatch {
                        column: index,
                        name: spec.name,
                        expected: if index == 0 {
                            ColumnKind::Timestamp
                        } else {
                            ColumnKind::Value
                        },
                        found: data_kind(&data),
                    });
                }
            }
        }
        Ok(Self { timestamp, values })
    }

    pub fn rows(&self) -> usize {
        self.timestamp.len()
    }

    pub fn timestamp(&self) -> &[i64] {
        &self.timestamp
    }

    pub fn values(&self, name: &str) -> Option<&[f32]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Point columns in request order
    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Timestamp and value of the last non-NaN sample of `name`
    pub fn last_valid(&self, name: &str) -> Option<(i64, f32)> {
        let values = self.values.get(name)?;
        values
            .iter()
            .rposition(|v| !v.is_nan())
            .map(|row| (self.timestamp[row], values[row]))
    }

    /// The last `n` rows
    pub fn tail(&self, n: usize) -> Self {
        let skip = self.rows().saturating_sub(n);
        Self {
            timestamp: self.timestamp[skip..].to_vec(),
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v[skip..].to_vec()))
                .collect(),
        }
    }

    /// Append the rows of `other`, which must have the same point columns.
    pub fn append(&mut self, other: ResultTable) -> Result<(), DecodeError> {
        if !self.values.keys().eq(other.values.keys()) {
            return Err(DecodeError::LayoutMismatch);
        }
        self.timestamp.extend(other.timestamp);
        for (values, more) in self.values.values_mut().zip(other.values.into_values()) {
            values.extend(more);
        }
        Ok(())
    }

    /// Order rows by timestamp; rows with equal timestamps keep their order.
    pub fn sort_by_timestamp(&mut self) {
        if self.timestamp.is_sorted() {
            return;
        }
        let mut order: Vec<usize> = (0..self.rows()).collect();
        order.sort_by_key(|&row| self.timestamp[row]);
        self.timestamp = order.iter().map(|&row| self.timestamp[row]).collect();
        for values in self.values.values_mut() {
            *values = order.iter().map(|&row| values[row]).collect();
        }
    }

    /// `{"timestamp": [...], "<point>": [...]}` with NaN as `null`
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// polars frame: `timestamp` as `Datetime(ms)`, one `Float32` column per point
    #[cfg(feature = "dataframe")]
    pub fn to_dataframe(&self) -> polars::prelude::PolarsResult<polars::prelude::DataFrame> {
        use polars::prelude::*;

        let timestamp = Series::new("timestamp".into(), &self.timestamp)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
        let mut columns = Vec::with_capacity(self.values.len() + 1);
        columns.push(timestamp.into_column());
        for (name, values) in &self.values {
            columns.push(Column::new(name.as_str().into(), values));
        }
        DataFrame::new(columns)
    }
}

fn data_kind(data: &ColumnData) -> &'static str {
    match data {
        ColumnData::Int(_) => "integer",
        ColumnData::Float(_) => "value",
        ColumnData::Text(_) => "text",
    }
}

impl Serialize for ResultTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len() + 1))?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        for (name, values) in &self.values {
            map.serialize_entry(name, &NanAsNull(values))?;
        }
        map.end()
    }
}

struct NanAsNull<'a>(&'a [f32]);

impl Serialize for NanAsNull<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|v| (!v.is_nan()).then_some(*v)))
    }
}

// ============ Assembler ============

/// Merges batch results into one table.
///
/// The first batch allocates the table and supplies the timestamps; every
/// later batch must have the same row count.
#[derive(Debug)]
pub struct ResultAssembler {
    columns: Vec<ColumnSpec>,
    table: Option<ColumnTable>,
}

impl ResultAssembler {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            table: None,
        }
    }

    /// Decode a binary batch straight into the shared table.
    pub fn push_binary(&mut self, raw: &[u8], shape: BatchShape) -> Result<(), DecodeError> {
        let table = binary::decode(raw, &self.columns, self.table.take(), shape)?;
        self.table = Some(table);
        Ok(())
    }

    /// Copy the value columns of a separately decoded batch (text path).
    pub fn push_table(
        &mut self,
        batch: ColumnTable,
        column_offset: usize,
    ) -> Result<(), DecodeError> {
        let Some(table) = self.table.as_mut() else {
            if column_offset != 0 {
                return Err(DecodeError::ColumnCountMismatch {
                    found: batch.width(),
                    available: 0,
                });
            }
            self.table = Some(self.widen(batch)?);
            return Ok(());
        };
        if batch.rows() != table.rows() {
            return Err(DecodeError::ShapeMismatch {
                expected: table.rows(),
                found: batch.rows(),
            });
        }
        let available = table.width().saturating_sub(column_offset);
        if batch.width() > available {
            return Err(DecodeError::ColumnCountMismatch {
                found: batch.width(),
                available,
            });
        }
        let (_, columns, _) = batch.into_parts();
        // column 0 of every batch repeats the time axis
        for (local, data) in columns.into_iter().enumerate().skip(1) {
            let values = match data {
                ColumnData::Float(values) => values,
                other => {
                    return Err(DecodeError::ColumnKindMismatch {
                        column: column_offset + local,
                        name: table.spec(column_offset + local).name.clone(),
                        expected: ColumnKind::Value,
                        found: data_kind(&other),
                    });
                }
            };
            table
                .floats_mut(column_offset + local, "value")?
                .copy_from_slice(&values);
        }
        Ok(())
    }

    /// Place the first text batch into a table with the full layout.
    fn widen(&self, batch: ColumnTable) -> Result<ColumnTable, DecodeError> {
        let mut table = ColumnTable::new(self.columns.clone(), batch.rows());
        if batch.width() > table.width() {
            return Err(DecodeError::ColumnCountMismatch {
                found: batch.width(),
                available: table.width(),
            });
        }
        let (_, columns, _) = batch.into_parts();
        for (index, data) in columns.into_iter().enumerate() {
            let target = table.column_mut(index);
            if std::mem::discriminant(target) != std::mem::discriminant(&data) {
                return Err(DecodeError::ColumnKindMismatch {
                    column: index,
                    name: table.spec(index).name.clone(),
                    expected: table.spec(index).kind,
                    found: data_kind(&data),
                });
            }
            *target = data;
        }
        Ok(table)
    }

    /// Finished table; a query without batches yields an empty one.
    pub fn finish(self) -> Result<ResultTable, DecodeError> {
        let table = self
            .table
            .unwrap_or_else(|| ColumnTable::new(self.columns, 0));
        ResultTable::from_columns(table)
    }
}
