//! Totals and groupings over exported data values.

use crate::models::DataValue;
use std::collections::HashMap;

/// Sum of values per data element, in first-seen order.
pub fn totals_by_data_element(values: &[DataValue]) -> Vec<(String, f64)> {
    totals_by(values, |v| &v.data_element)
}

/// Sum of values per org unit, in first-seen order.
pub fn totals_by_org_unit(values: &[DataValue]) -> Vec<(String, f64)> {
    totals_by(values, |v| &v.org_unit)
}

fn totals_by<F>(values: &[DataValue], key: F) -> Vec<(String, f64)>
where
    F: Fn(&DataValue) -> &String,
{
    let mut totals: Vec<(String, f64)> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for value in values {
        let name = key(value);
        match positions.get(name.as_str()) {
            Some(&pos) => totals[pos].1 += value.value,
            None => {
                positions.insert(name.as_str(), totals.len());
                totals.push((name.clone(), value.value));
            }
        }
    }

    totals
}

/// Group data values by org unit.
pub fn group_by_org_unit(values: &[DataValue]) -> HashMap<String, Vec<DataValue>> {
    let mut grouped: HashMap<String, Vec<DataValue>> = HashMap::new();

    for value in values {
        grouped
            .entry(value.org_unit.clone())
            .or_default()
            .push(value.clone());
    }

    grouped
}

/// Number of rows that carry no data.
pub fn zero_rows(values: &[DataValue]) -> usize {
    values.iter().filter(|v| v.value == 0.0).count()
}

/// Format a value the way it is serialized: integers without a fraction.
pub fn format_value(value: f64) -> String {
    format!("{}", value)
}
