//! High-level client: catalog, planning, batched reads and live values

use std::cell::Cell;
use std::io::Write;

use crate::TebisError;
use crate::catalog::{CatalogError, PointCatalog, PointRef};
use crate::config::ClientConfig;
use crate::decode::text::decode_text_batch;
use crate::decode::{BatchShape, ColumnSpec};
use crate::dump::RawBatch;
use crate::planner::{
    Clock, PlanError, QueryPlan, QueryPlanner, SystemClock, TimeInput, TimeWindow,
};
use crate::table::{ResultAssembler, ResultTable};
use crate::transport::{TcpTransport, Transport, send};

/// Live values are read at one-second resolution.
const LIVE_RESOLUTION_MS: i64 = 1000;
/// Samples inspected when estimating the server clock offset
const OFFSET_LOOKBACK_SAMPLES: u32 = 120;

#[derive(Debug, Clone, Copy)]
struct LiveOffset {
    offset_ms: i64,
    computed_at_ms: i64,
}

/// Tebis client over any [`Transport`].
///
/// Not `Sync`: the live-value clock offset is cached in a `Cell`.
pub struct TebisClient<T: Transport = TcpTransport> {
    transport: T,
    config: ClientConfig,
    catalog: PointCatalog,
    clock: Box<dyn Clock>,
    live_offset: Cell<Option<LiveOffset>>,
}

impl TebisClient<TcpTransport> {
    /// Connect settings from `config`, load the catalog, prime live values if enabled.
    pub fn connect(config: ClientConfig) -> Result<Self, TebisError> {
        let transport = TcpTransport::from_config(&config);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> TebisClient<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> Result<Self, TebisError> {
        let catalog = PointCatalog::load(&transport, &config.config_file)?;
        let client = Self::with_catalog(transport, config, catalog);
        if client.config.live_values.enable {
            let now = client.current_time_ms()?;
            log::info!(
                "Live values enabled, server time {now} (offset {} ms)",
                client.clock.now_ms() - now
            );
        }
        Ok(client)
    }

    /// Use an already loaded catalog; nothing is sent.
    pub fn with_catalog(transport: T, config: ClientConfig, catalog: PointCatalog) -> Self {
        Self {
            transport,
            config,
            catalog,
            clock: Box::new(SystemClock),
            live_offset: Cell::new(None),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PointCatalog {
        &self.catalog
    }

    /// For attaching a hierarchy tree after loading
    pub fn catalog_mut(&mut self) -> &mut PointCatalog {
        &mut self.catalog
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Reload points, reductions and groups. An attached tree is dropped.
    pub fn refresh_catalog(&mut self) -> Result<(), TebisError> {
        self.catalog = PointCatalog::load(&self.transport, &self.config.config_file)?;
        Ok(())
    }

    pub fn planner(&self) -> QueryPlanner<'_> {
        QueryPlanner::new(&self.catalog, self.clock.as_ref()).with_batch_size(self.config.batch_size)
    }

    /// Read `[start, end]` at `resolution_seconds` through the binary procedure.
    pub fn read(
        &self,
        points: &[PointRef],
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
        resolution_seconds: f64,
    ) -> Result<ResultTable, TebisError> {
        let plan = self
            .planner()
            .plan(points, &start.into(), &end.into(), resolution_seconds)?;
        self.execute(&plan, false)
    }

    /// Same as [`read`](Self::read) through the slow text procedure.
    pub fn read_text(
        &self,
        points: &[PointRef],
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
        resolution_seconds: f64,
    ) -> Result<ResultTable, TebisError> {
        let plan = self
            .planner()
            .plan(points, &start.into(), &end.into(), resolution_seconds)?;
        self.execute(&plan, true)
    }

    /// Read an explicit window through the binary procedure.
    pub fn read_window(
        &self,
        points: &[PointRef],
        window: TimeWindow,
    ) -> Result<ResultTable, TebisError> {
        let plan = self.planner().plan_window(points, window)?;
        self.execute(&plan, false)
    }

    /// Read several `[start, end]` windows and stack them into one table
    /// sorted by time. Overlapping windows yield repeated rows.
    pub fn read_windows(
        &self,
        points: &[PointRef],
        windows: &[(TimeInput, TimeInput)],
        resolution_seconds: f64,
    ) -> Result<ResultTable, TebisError> {
        let mut stacked: Option<ResultTable> = None;
        for (start, end) in windows {
            let part = self.read(points, start.clone(), end.clone(), resolution_seconds)?;
            match stacked.as_mut() {
                Some(table) => table.append(part)?,
                None => stacked = Some(part),
            }
        }
        let mut table = stacked.ok_or(PlanError::NoWindows)?;
        table.sort_by_timestamp();
        Ok(table)
    }

    /// Run the binary procedure for `[start, end]` without decoding: every
    /// batch is written to `out` as a [`RawBatch`] record. Returns the bytes written.
    pub fn read_raw<W: Write + ?Sized>(
        &self,
        points: &[PointRef],
        start: impl Into<TimeInput>,
        end: impl Into<TimeInput>,
        resolution_seconds: f64,
        out: &mut W,
    ) -> Result<u64, TebisError> {
        let plan = self
            .planner()
            .plan(points, &start.into(), &end.into(), resolution_seconds)?;
        let mut written = 0;
        for batch in &plan.batches {
            let request = batch.to_request(&self.config.config_file, false);
            let payload = send(&self.transport, &request)?;
            let record = RawBatch {
                point_ids: batch.point_ids.clone(),
                payload,
            };
            written += record.write_to(out)?;
        }
        out.flush()?;
        log::info!("Dumped {} batches, {written} bytes", plan.batches.len());
        Ok(written)
    }

    fn execute(&self, plan: &QueryPlan, text: bool) -> Result<ResultTable, TebisError> {
        let max_rows = plan.window.sample_count as usize;
        let mut assembler = ResultAssembler::new(plan.column_specs());
        for batch in &plan.batches {
            let request = batch.to_request(&self.config.config_file, text);
            log::debug!(
                "Requesting {} points at offset {}",
                batch.point_ids.len(),
                batch.column_offset
            );
            let raw = send(&self.transport, &request)?;
            let shape = BatchShape::new(batch.column_offset, batch.point_ids.len(), max_rows);
            if text {
                let points = &plan.points[batch.column_offset..][..batch.point_ids.len()];
                let columns: Vec<ColumnSpec> = std::iter::once(ColumnSpec::timestamp())
                    .chain(points.iter().map(|p| ColumnSpec::value(p.name.clone())))
                    .collect();
                let table = decode_text_batch(&raw, &columns, &shape)?;
                assembler.push_table(table, batch.column_offset)?;
            } else {
                assembler.push_binary(&raw, shape)?;
            }
        }
        Ok(assembler.finish()?)
    }

    // ============ Live values ============

    /// Server "now": wall clock minus the estimated offset, re-estimated
    /// every `recalcTimeOffsetEvery` seconds.
    pub fn current_time_ms(&self) -> Result<i64, TebisError> {
        let now = self.clock.now_ms();
        let max_age_ms = self.config.live_values.recalc_time_offset_every as i64 * 1000;
        let offset = match self.live_offset.get() {
            Some(cached) if now - cached.computed_at_ms < max_age_ms => cached,
            _ => {
                let fresh = self.estimate_offset(now)?;
                self.live_offset.set(Some(fresh));
                fresh
            }
        };
        Ok(now - offset.offset_ms)
    }

    fn estimate_offset(&self, now: i64) -> Result<LiveOffset, TebisError> {
        let id = self.config.live_values.offset_mst_id;
        let point = self
            .catalog
            .point(&PointRef::Id(id))
            .ok_or(CatalogError::UnknownPoint(PointRef::Id(id)))?;
        let window = TimeWindow::ending_at(now, OFFSET_LOOKBACK_SAMPLES, LIVE_RESOLUTION_MS);
        let recent = self.read_window(&[PointRef::Id(id)], window)?;
        let (last_ms, _) = recent
            .last_valid(&point.name)
            .ok_or(CatalogError::NoRecentSamples(id))?;
        // the newest complete sample is one step behind the last one reported
        let offset_ms = now - (last_ms - LIVE_RESOLUTION_MS);
        log::debug!("Clock offset from point {id}: {offset_ms} ms");
        Ok(LiveOffset {
            offset_ms,
            computed_at_ms: now,
        })
    }

    /// The last `count` one-second samples of `points`, ending at server "now".
    pub fn read_current_values(
        &self,
        points: &[PointRef],
        count: u32,
    ) -> Result<ResultTable, TebisError> {
        let now = self.current_time_ms()?;
        let window = TimeWindow::ending_at(now, count, LIVE_RESOLUTION_MS);
        let table = self.read_window(points, window)?;
        Ok(table.tail(count.max(1) as usize))
    }
}
