//! tebis - client for the Tebis process-data historian
//!
//! Reads time series from a Tebis server over its TCP request protocol and
//! returns them as aligned tables (or polars frames with the `dataframe`
//! feature).
//!
//! ## Quick Start
//!
//! ```ignore
//! use tebis::{ClientConfig, PointRef, TebisClient};
//!
//! let config = ClientConfig::default().with_host("10.0.0.5");
//! let client = TebisClient::connect(config)?;
//!
//! // One hour of one-second samples for two points
//! let points: Vec<PointRef> = vec!["Kessel.Temp".into(), 100_117.into()];
//! let table = client.read(&points, "2024-03-01 08:00:00", "2024-03-01 09:00:00", 1.0)?;
//! let df = table.to_dataframe()?;
//! ```
//!
//! ## Live Values
//!
//! With `liveValues.enable` set, the client estimates how far the server's
//! newest data lags the local clock and reads "current" values relative to
//! that:
//!
//! ```ignore
//! let last_minute = client.read_current_values(&points, 60)?;
//! ```
//!
//! ## Raw Dumps
//!
//! [`TebisClient::read_raw`] skips decoding and appends each batch's payload
//! to a writer as a [`RawBatch`] record, for decoders living elsewhere.
//!
//! ## Layers
//!
//! - [`transport`]: framed request/response over TCP
//! - [`request`]: request text for each server procedure
//! - [`decode`]: binary and delimited-text result decoders
//! - [`catalog`]: points, reductions, groups
//! - [`planner`]: time windows and batching
//! - [`table`]: result assembly
//! - [`dump`]: undecoded batch records

pub mod catalog;
pub mod client;
pub mod config;
pub mod decode;
pub mod dump;
pub mod planner;
pub mod request;
pub mod table;
pub mod transport;

#[cfg(test)]
mod test_support;

use thiserror::Error;

// ============ Primary Public API ============

pub use catalog::{Group, MeasurementPoint, PointCatalog, PointKind, PointRef, TreeNode};
pub use client::TebisClient;
pub use config::{ClientConfig, LiveValuesConfig};
pub use dump::RawBatch;
pub use planner::{TimeInput, TimeWindow};
pub use table::ResultTable;
pub use transport::{TcpTransport, Transport};

pub use catalog::CatalogError;
pub use config::ConfigError;
pub use decode::DecodeError;
pub use planner::PlanError;
pub use transport::TransportError;

#[derive(Error, Debug)]
pub enum TebisError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Query error: {0}")]
    Plan(#[from] PlanError),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "dataframe")]
    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl TebisError {
    /// The server answered but the payload could not be framed.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::Decode(e) if e.is_frame_error())
    }
}
