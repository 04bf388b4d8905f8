//! Query planning: time inputs to a quantized window, points to batches
//!
//! The server addresses data by its right edge and a sample count going
//! backwards, so a `[start, end]` request becomes
//!
//! ```text
//! right_edge   = floor(end / res) * res
//! sample_count = max(1, (right_edge - floor(start / res) * res) / res)
//! ```
//!
//! with the right edge pulled back to "now" when it lies in the future.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use crate::catalog::{CatalogError, MeasurementPoint, MetadataCatalog, PointRef};
use crate::decode::ColumnSpec;
use crate::request::{DataQuery, Procedure, Request};

/// Upper bound on points per server request
pub const MAX_POINTS_PER_REQUEST: usize = 100;

/// Integer times below this are seconds, above it milliseconds.
const SECONDS_THRESHOLD: i64 = 100_000_000_000;

const TEXT_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Resolution {resolution_ms} ms is not offered by the server (available: {available:?})")]
    UnsupportedResolution {
        resolution_ms: i64,
        available: Vec<i64>,
    },
    #[error("Invalid resolution: {0} s")]
    InvalidResolution(f64),
    #[error("Invalid time: {0}")]
    InvalidTime(String),
    #[error("No points requested")]
    NoPoints,
    #[error("No time windows requested")]
    NoWindows,
    #[error("Window needs {0} samples, more than one request can carry")]
    TooManySamples(i64),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

// ============ Time inputs ============

/// A point in time as callers hand it in
#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    Calendar(DateTime<Utc>),
    /// `YYYY-MM-DD HH:MM:SS[.fff]` in local time
    Text(String),
    Seconds(f64),
    /// Seconds when below 1e11, milliseconds otherwise
    Integer(i64),
}

impl TimeInput {
    pub fn to_millis(&self) -> Result<i64, PlanError> {
        match self {
            Self::Calendar(dt) => Ok(dt.timestamp_millis()),
            Self::Text(text) => parse_local(text),
            Self::Seconds(secs) => {
                let ms = (secs * 1000.0).round();
                if ms.is_finite() && ms.abs() < i64::MAX as f64 {
                    Ok(ms as i64)
                } else {
                    Err(PlanError::InvalidTime(secs.to_string()))
                }
            }
            Self::Integer(n) if *n < SECONDS_THRESHOLD => n
                .checked_mul(1000)
                .ok_or_else(|| PlanError::InvalidTime(n.to_string())),
            Self::Integer(n) => Ok(*n),
        }
    }
}

fn parse_local(text: &str) -> Result<i64, PlanError> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    let naive = TEXT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .ok_or_else(|| PlanError::InvalidTime(text.to_string()))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| PlanError::InvalidTime(format!("{text} does not exist in local time")))
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Calendar(dt)
    }
}

impl From<&str> for TimeInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for TimeInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<f64> for TimeInput {
    fn from(secs: f64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<i64> for TimeInput {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

/// Command-line form: integer, then float seconds, then calendar text.
impl FromStr for TimeInput {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if let Ok(n) = s.parse::<i64>() {
            Self::Integer(n)
        } else if let Ok(secs) = s.parse::<f64>() {
            Self::Seconds(secs)
        } else {
            Self::Text(s.to_string())
        })
    }
}

// ============ Clock ============

/// Source of "now" for the future clamp
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

// ============ Window ============

/// Round `t` down to a multiple of `resolution_ms`.
pub fn quantize(t: i64, resolution_ms: i64) -> i64 {
    t - t.rem_euclid(resolution_ms)
}

fn checked_quantize(t: i64, resolution_ms: i64) -> Result<i64, PlanError> {
    t.checked_sub(t.rem_euclid(resolution_ms))
        .ok_or_else(|| PlanError::InvalidTime(t.to_string()))
}

/// Right edge plus backwards sample count at one resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub right_edge_ms: i64,
    pub sample_count: u32,
    pub resolution_ms: i64,
}

impl TimeWindow {
    /// Window over `[start_ms, end_ms]`, both quantized down.
    pub fn between(start_ms: i64, end_ms: i64, resolution_ms: i64) -> Result<Self, PlanError> {
        if resolution_ms <= 0 {
            return Err(PlanError::InvalidResolution(resolution_ms as f64 / 1000.0));
        }
        let left = checked_quantize(start_ms, resolution_ms)?;
        let right = checked_quantize(end_ms, resolution_ms)?;
        let span = right
            .checked_sub(left)
            .ok_or_else(|| PlanError::InvalidTime(format!("{start_ms} .. {end_ms}")))?;
        Ok(Self {
            right_edge_ms: right,
            sample_count: sample_count(span / resolution_ms)?,
            resolution_ms,
        })
    }

    /// `count` samples ending at `end_ms` (quantized down).
    pub fn ending_at(end_ms: i64, count: u32, resolution_ms: i64) -> Self {
        Self {
            right_edge_ms: quantize(end_ms, resolution_ms),
            sample_count: count.max(1),
            resolution_ms,
        }
    }

    pub fn left_edge_ms(&self) -> i64 {
        self.right_edge_ms
            .saturating_sub(i64::from(self.sample_count).saturating_mul(self.resolution_ms))
    }

    /// Pull a future right edge back to `now_ms`, keeping the left edge.
    pub fn clamp_to(self, now_ms: i64) -> Self {
        if self.right_edge_ms <= now_ms {
            return self;
        }
        let left = self.left_edge_ms();
        let right = quantize(now_ms, self.resolution_ms);
        let count =
            (right.saturating_sub(left) / self.resolution_ms).clamp(1, i64::from(u32::MAX));
        log::debug!(
            "Right edge {} is in the future, clamped to {right} ({} -> {count} samples)",
            self.right_edge_ms,
            self.sample_count
        );
        Self {
            right_edge_ms: right,
            sample_count: count as u32,
            resolution_ms: self.resolution_ms,
        }
    }
}

fn sample_count(n: i64) -> Result<u32, PlanError> {
    u32::try_from(n.max(1)).map_err(|_| PlanError::TooManySamples(n))
}

// ============ Plan ============

/// One server request covering a slice of the point list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub point_ids: Vec<i64>,
    /// Points in earlier batches; where this batch's columns start
    pub column_offset: usize,
    pub window: TimeWindow,
}

impl BatchRequest {
    pub fn to_query(&self) -> DataQuery {
        DataQuery {
            point_ids: self.point_ids.clone(),
            sample_count: self.window.sample_count,
            resolution_ms: self.window.resolution_ms,
            right_edge_ms: self.window.right_edge_ms,
        }
    }

    pub fn to_request(&self, config_file: &str, text: bool) -> Request {
        let query = self.to_query();
        let procedure = if text {
            Procedure::LoadTextData(query)
        } else {
            Procedure::LoadData(query)
        };
        Request::new(config_file, procedure)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub window: TimeWindow,
    pub points: Vec<MeasurementPoint>,
    pub batches: Vec<BatchRequest>,
}

impl QueryPlan {
    /// Output layout: `timestamp` then one value column per point
    pub fn column_specs(&self) -> Vec<ColumnSpec> {
        std::iter::once(ColumnSpec::timestamp())
            .chain(self.points.iter().map(|p| ColumnSpec::value(p.name.clone())))
            .collect()
    }
}

pub struct QueryPlanner<'a> {
    catalog: &'a dyn MetadataCatalog,
    clock: &'a dyn Clock,
    batch_size: usize,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(catalog: &'a dyn MetadataCatalog, clock: &'a dyn Clock) -> Self {
        Self {
            catalog,
            clock,
            batch_size: MAX_POINTS_PER_REQUEST,
        }
    }

    /// Batch size, capped at the server limit
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_POINTS_PER_REQUEST);
        self
    }

    /// Resolve a resolution in seconds against the reduction catalog.
    pub fn resolution_ms(&self, resolution_seconds: f64) -> Result<i64, PlanError> {
        let ms = (resolution_seconds * 1000.0).round();
        if !ms.is_finite() || ms < 1.0 || ms > i64::MAX as f64 {
            return Err(PlanError::InvalidResolution(resolution_seconds));
        }
        let ms = ms as i64;
        self.check_resolution(ms)?;
        Ok(ms)
    }

    fn check_resolution(&self, resolution_ms: i64) -> Result<(), PlanError> {
        let reductions = self.catalog.reduction_catalog();
        if !reductions.contains(resolution_ms) {
            return Err(PlanError::UnsupportedResolution {
                resolution_ms,
                available: reductions.iter().collect(),
            });
        }
        Ok(())
    }

    /// Resolve points in request order; unknown or repeated points fail.
    pub fn resolve_points(&self, points: &[PointRef]) -> Result<Vec<MeasurementPoint>, PlanError> {
        if points.is_empty() {
            return Err(PlanError::NoPoints);
        }
        let mut seen = HashSet::new();
        points
            .iter()
            .map(|point| -> Result<MeasurementPoint, PlanError> {
                let resolved = self
                    .catalog
                    .lookup_point(point)
                    .ok_or_else(|| CatalogError::UnknownPoint(point.clone()))?;
                if !seen.insert(resolved.id) {
                    return Err(CatalogError::DuplicatePoint(resolved.name).into());
                }
                Ok(resolved)
            })
            .collect()
    }

    pub fn plan(
        &self,
        points: &[PointRef],
        start: &TimeInput,
        end: &TimeInput,
        resolution_seconds: f64,
    ) -> Result<QueryPlan, PlanError> {
        let resolution_ms = self.resolution_ms(resolution_seconds)?;
        let window = TimeWindow::between(start.to_millis()?, end.to_millis()?, resolution_ms)?;
        self.plan_window(points, window)
    }

    /// Plan an already built window; the future clamp still applies.
    pub fn plan_window(
        &self,
        points: &[PointRef],
        window: TimeWindow,
    ) -> Result<QueryPlan, PlanError> {
        self.check_resolution(window.resolution_ms)?;
        let points = self.resolve_points(points)?;
        let window = window.clamp_to(self.clock.now_ms());
        let batches = points
            .chunks(self.batch_size)
            .enumerate()
            .map(|(i, chunk)| BatchRequest {
                point_ids: chunk.iter().map(|p| p.id).collect(),
                column_offset: i * self.batch_size,
                window,
            })
            .collect::<Vec<_>>();
        log::debug!(
            "Planned {} points in {} batches: {} samples of {} ms ending at {}",
            points.len(),
            batches.len(),
            window.sample_count,
            window.resolution_ms,
            window.right_edge_ms
        );
        Ok(QueryPlan {
            window,
            points,
            batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PointCatalog, ReductionCatalog};

    const T0: i64 = 1_700_000_000_000;

    fn catalog(points: i64) -> PointCatalog {
        PointCatalog::new(ReductionCatalog::new([1000, 60_000, 3_600_000])).with_points(
            (0..points).map(|i| MeasurementPoint::real(1000 + i, format!("p{i}"))),
        )
    }

    fn refs(n: i64) -> Vec<PointRef> {
        (0..n).map(|i| PointRef::Id(1000 + i)).collect()
    }

    #[test]
    fn integer_times_switch_units_at_1e11() {
        assert_eq!(TimeInput::Integer(99_999_999_999).to_millis().unwrap(), 99_999_999_999_000);
        assert_eq!(TimeInput::Integer(100_000_000_000).to_millis().unwrap(), 100_000_000_000);
        assert_eq!(TimeInput::Seconds(1.5).to_millis().unwrap(), 1500);
        assert!(TimeInput::Seconds(f64::NAN).to_millis().is_err());
    }

    #[test]
    fn calendar_inputs() {
        let dt = DateTime::parse_from_rfc3339("2023-11-14T22:13:20Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(TimeInput::from(dt).to_millis().unwrap(), T0);
        assert_eq!(TimeInput::from("2023-11-14T22:13:20Z").to_millis().unwrap(), T0);

        let local = TimeInput::from("2023-11-14 22:13:20.500").to_millis().unwrap();
        let expected = Local
            .from_local_datetime(
                &NaiveDateTime::parse_from_str("2023-11-14 22:13:20.5", "%Y-%m-%d %H:%M:%S%.f")
                    .unwrap(),
            )
            .earliest()
            .unwrap()
            .timestamp_millis();
        assert_eq!(local, expected);
        assert!(TimeInput::from("yesterday").to_millis().is_err());
    }

    #[test]
    fn time_input_from_str() {
        assert_eq!("1700000000".parse::<TimeInput>().unwrap(), TimeInput::Integer(1_700_000_000));
        assert_eq!("1.5".parse::<TimeInput>().unwrap(), TimeInput::Seconds(1.5));
        assert!(matches!("2023-01-01 00:00:00".parse::<TimeInput>().unwrap(), TimeInput::Text(_)));
    }

    #[test]
    fn window_quantizes_both_edges() {
        let w = TimeWindow::between(T0 + 1_500, T0 + 61_999, 1000).unwrap();
        assert_eq!(w.right_edge_ms, T0 + 61_000);
        assert_eq!(w.sample_count, 60);
        assert_eq!(w.left_edge_ms(), T0 + 1_000);

        let empty = TimeWindow::between(T0, T0 + 10, 1000).unwrap();
        assert_eq!(empty.sample_count, 1);
    }

    #[test]
    fn extreme_window_is_invalid_not_overflow() {
        assert!(matches!(
            TimeWindow::between(-9_000_000_000_000_000, i64::MAX, 1000),
            Err(PlanError::InvalidTime(_))
        ));
        assert!(matches!(
            TimeWindow::between(i64::MIN, 0, 1000),
            Err(PlanError::InvalidTime(_))
        ));
        // seconds input that lands far in the past
        let catalog = catalog(1);
        let planner = QueryPlanner::new(&catalog, &FixedClock(T0));
        let err = planner
            .plan(&refs(1), &TimeInput::Seconds(-9.2e15), &TimeInput::Integer(i64::MAX), 1.0)
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidTime(_)), "{err:?}");
    }

    #[test]
    fn future_edge_clamps_by_whole_units() {
        let res = 60_000;
        let w = TimeWindow::between(T0 - 50 * res, T0 + 10 * res, res).unwrap();
        assert_eq!(w.sample_count, 60);
        let clamped = w.clamp_to(T0 + 30_000);
        assert_eq!(clamped.right_edge_ms, quantize(T0 + 30_000, res));
        assert_eq!(clamped.sample_count, 50);
        assert_eq!(clamped.left_edge_ms(), w.left_edge_ms());

        // nothing to clamp
        assert_eq!(w.clamp_to(T0 + 20 * res), w);
    }

    #[test]
    fn clamp_never_goes_below_one_sample() {
        let w = TimeWindow::ending_at(T0 + 10_000, 3, 1000);
        let clamped = w.clamp_to(T0 - 1_000_000);
        assert_eq!(clamped.sample_count, 1);
    }

    #[test]
    fn unsupported_resolution_is_rejected() {
        let catalog = catalog(1);
        let planner = QueryPlanner::new(&catalog, &FixedClock(T0));
        for secs in [2.0, 0.5, 30.0, 7200.0] {
            let err = planner
                .plan(&refs(1), &T0.into(), &(T0 + 1).into(), secs)
                .unwrap_err();
            assert!(matches!(err, PlanError::UnsupportedResolution { .. }), "{secs}: {err:?}");
        }
        assert!(matches!(
            planner.resolution_ms(0.0),
            Err(PlanError::InvalidResolution(_))
        ));
        assert_eq!(planner.resolution_ms(3600.0).unwrap(), 3_600_000);
    }

    #[test]
    fn batches_split_at_one_hundred() {
        let catalog = catalog(250);
        let planner = QueryPlanner::new(&catalog, &FixedClock(T0 + 3_600_000));
        let plan = planner
            .plan(&refs(250), &TimeInput::Integer(T0 - 60_000), &TimeInput::Integer(T0), 1.0)
            .unwrap();
        let sizes: Vec<_> = plan.batches.iter().map(|b| b.point_ids.len()).collect();
        assert_eq!(sizes, [100, 100, 50]);
        let offsets: Vec<_> = plan.batches.iter().map(|b| b.column_offset).collect();
        assert_eq!(offsets, [0, 100, 200]);
        assert_eq!(plan.column_specs().len(), 251);
        assert_eq!(plan.batches[2].point_ids[0], 1200);
        assert!(plan.batches.iter().all(|b| b.window == plan.window));
    }

    #[test]
    fn smaller_batch_size_is_honoured() {
        let catalog = catalog(5);
        let planner = QueryPlanner::new(&catalog, &FixedClock(T0)).with_batch_size(2);
        let plan = planner
            .plan(&refs(5), &(T0 - 10_000).into(), &T0.into(), 1.0)
            .unwrap();
        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.batches[2].column_offset, 4);
    }

    #[test]
    fn point_resolution_errors() {
        let catalog = catalog(2);
        let planner = QueryPlanner::new(&catalog, &FixedClock(T0));
        assert!(matches!(planner.resolve_points(&[]), Err(PlanError::NoPoints)));
        assert!(matches!(
            planner.resolve_points(&[PointRef::Id(1)]),
            Err(PlanError::Catalog(CatalogError::UnknownPoint(_)))
        ));
        assert!(matches!(
            planner.resolve_points(&[PointRef::Id(1000), "p0".into()]),
            Err(PlanError::Catalog(CatalogError::DuplicatePoint(_)))
        ));
    }

    #[test]
    fn batch_request_text() {
        let batch = BatchRequest {
            point_ids: vec![1, 2],
            column_offset: 0,
            window: TimeWindow::ending_at(T0, 10, 1000),
        };
        let text = batch.to_request("cfg", false).to_string();
        assert!(text.contains("<arrMsts>1, 2</arrMsts>"));
        assert!(text.contains("<nNmbX>10</nNmbX>"));
        assert!(text.contains(&format!("<nTimeR>{T0}</nTimeR>")));
    }
}
