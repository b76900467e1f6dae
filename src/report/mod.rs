//! Export report rendering.

pub mod generator;
pub mod summary;

pub use generator::{
    generate_json_catalog, generate_json_report, generate_markdown_catalog,
    generate_markdown_report,
};
