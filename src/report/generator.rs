//! Export rendering.
//!
//! JSON output is the DHIS2 data value set itself. Markdown output is a
//! readable summary for people checking an export before submitting it.

use super::summary::{format_value, group_by_org_unit, totals_by_data_element, totals_by_org_unit, zero_rows};
use crate::export::period::{parse_period, Period};
use crate::models::{DataValue, ExportCatalog, ExportResult};
use anyhow::Result;

/// Generate the JSON data value set.
pub fn generate_json_report(result: &ExportResult, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    Ok(json)
}

/// Generate the JSON catalog.
pub fn generate_json_catalog(catalog: &ExportCatalog, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(catalog)?
    } else {
        serde_json::to_string(catalog)?
    };
    Ok(json)
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(result: &ExportResult) -> String {
    let mut output = String::new();

    output.push_str(&format!("# DHIS2 Export: {}\n\n", result.data_set));
    output.push_str(&generate_metadata_section(result));
    output.push_str(&generate_summary_section(&result.data_values));
    output.push_str(&generate_values_section(&result.data_values));
    output.push_str(&generate_footer());

    output
}

/// `200002` -> `February, 2000`; unknown codes are shown as-is.
fn describe_period(code: &str) -> String {
    parse_period(code)
        .map(|at| Period::from_datetime(at).description())
        .unwrap_or_else(|_| code.to_string())
}

fn generate_metadata_section(result: &ExportResult) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Data Set:** `{}`\n", result.data_set));
    section.push_str(&format!(
        "- **Period:** {} ({})\n",
        result.period,
        describe_period(&result.period)
    ));
    section.push_str(&format!("- **Complete Date:** {}\n", result.complete_date));
    section.push_str(&format!("- **Data Values:** {}\n", result.data_values.len()));

    let empty = zero_rows(&result.data_values);
    if empty > 0 {
        section.push_str(&format!("- **Zero Values:** {}\n", empty));
    }
    section.push('\n');

    section
}

fn generate_summary_section(values: &[DataValue]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    if values.is_empty() {
        section.push_str("No org units are mapped to this data set.\n\n");
        return section;
    }

    section.push_str("### Totals by Data Element\n\n");
    section.push_str("| Data Element | Total |\n");
    section.push_str("|:---|---:|\n");
    for (element, total) in totals_by_data_element(values) {
        section.push_str(&format!("| `{}` | {} |\n", element, format_value(total)));
    }
    section.push('\n');

    section.push_str("### Totals by Org Unit\n\n");
    section.push_str("| Org Unit | Total |\n");
    section.push_str("|:---|---:|\n");
    for (org_unit, total) in totals_by_org_unit(values) {
        section.push_str(&format!("| `{}` | {} |\n", org_unit, format_value(total)));
    }
    section.push('\n');

    section
}

fn generate_values_section(values: &[DataValue]) -> String {
    if values.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Data Values\n\n");

    let grouped = group_by_org_unit(values);
    for (org_unit, _) in totals_by_org_unit(values) {
        let Some(rows) = grouped.get(&org_unit) else {
            continue;
        };
        section.push_str(&format!("### {}\n\n", org_unit));
        section.push_str("| Data Element | Value |\n");
        section.push_str("|:---|---:|\n");
        for row in rows {
            section.push_str(&format!(
                "| `{}` | {} |\n",
                row.data_element,
                format_value(row.value)
            ));
        }
        section.push('\n');
    }

    section
}

/// Generate the Markdown view of the export catalog.
pub fn generate_markdown_catalog(catalog: &ExportCatalog) -> String {
    let mut output = String::new();

    output.push_str("# DHIS2 Export Catalog\n\n");

    output.push_str("## Data Sets\n\n");
    match catalog.data_sets {
        Some(ref data_sets) if !data_sets.is_empty() => {
            for ds in data_sets {
                let marker = if catalog.selected_data_set.as_deref() == Some(ds.guid.as_str()) {
                    " (default)"
                } else {
                    ""
                };
                output.push_str(&format!(
                    "- `{}` {}{}\n",
                    ds.guid,
                    ds.display_label(),
                    marker
                ));
            }
        }
        _ => output.push_str("DHIS2 export is not configured (no `dhisDataSets`).\n"),
    }
    output.push('\n');

    output.push_str("## Periods\n\n");
    for period in &catalog.periods {
        output.push_str(&format!("- {} (`{}`)\n", period.description, period.timestamp));
    }
    output.push('\n');

    output.push_str("## Places\n\n");
    for (data_set, places) in &catalog.places.by_data_set {
        output.push_str(&format!("### {}\n\n", data_set));
        for place in places {
            output.push_str(&format!("- {} (`{}`)\n", place.name, place.id));
        }
        output.push('\n');
    }
    if !catalog.places.unrestricted.is_empty() {
        output.push_str("### Any data set\n\n");
        for place in &catalog.places.unrestricted {
            output.push_str(&format!("- {} (`{}`)\n", place.name, place.id));
        }
        output.push('\n');
    }

    output
}

fn generate_footer() -> String {
    "---\n\n*Generated by dhis-export*\n".to_string()
}
