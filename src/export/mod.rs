//! DHIS2 export: periods, hierarchy resolution, aggregation and the catalog.

pub mod aggregator;
pub mod hierarchy;
pub mod period;
pub mod places;

pub use aggregator::{aggregate, AggregationPolicy, ExportOptions, Exporter};
pub use hierarchy::AttributionPolicy;
pub use period::{parse_period, recent_periods, Period};
pub use places::{catalog, places_by_data_set};
