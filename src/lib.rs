//! dhis-export - aggregate monthly target documents into DHIS2 data value sets.
//!
//! The library exposes the export pipeline so it can be driven from the
//! bundled CLI or embedded in another service:
//!
//! ```no_run
//! use dhis_export::export::{parse_period, Exporter, ExportOptions};
//! use dhis_export::store::FileStore;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = FileStore::open(std::path::Path::new("dump.json"))?;
//! let exporter = Exporter::new(store);
//! let result = exporter
//!     .aggregate(parse_period("2000-02")?, "abc123", &ExportOptions::default())
//!     .await?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod report;
pub mod store;
