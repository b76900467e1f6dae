//! Document and output models for the DHIS export.
//!
//! Input documents (settings, contacts, target snapshots) are deserialized
//! straight from their stored JSON shape. Polymorphic `dhis` fields, which
//! may hold either a single mapping or a list, are normalized to a `Vec`
//! at deserialization so the rest of the crate only sees lists.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Document `type` values that denote a contact in the hierarchy.
pub const CONTACT_TYPES: &[&str] = &[
    "contact",
    "district_hospital",
    "health_center",
    "clinic",
    "person",
];

/// Accept either `T` or `[T]` (or null) and always produce a list.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}

/// Integral values are written as JSON integers.
fn serialize_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < MAX_SAFE {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The application settings relevant to DHIS exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Data sets that may be exported. `None` means DHIS is not configured.
    #[serde(
        rename = "dhisDataSets",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dhis_data_sets: Option<Vec<DataSetDefinition>>,

    /// Task settings; target definitions live under `tasks.targets.items`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskSettings>,

    /// Top-level `targets.items`, used when `tasks.targets` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<TargetSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<TargetSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSettings {
    #[serde(default)]
    pub items: Vec<TargetDefinition>,
}

/// An external DHIS2 data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetDefinition {
    pub guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl DataSetDefinition {
    /// The label, or the guid when no label is configured.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.guid)
    }
}

/// A configured target (local metric) and its DHIS bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDefinition {
    pub id: String,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dhis: Vec<DhisBinding>,
}

/// Binds a target to a data element, optionally within one data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhisBinding {
    #[serde(rename = "dataSet", default, skip_serializing_if = "Option::is_none")]
    pub data_set: Option<String>,
    #[serde(
        rename = "dataElement",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_element: Option<String>,
}

impl DhisBinding {
    /// Bindings without a data set are shared by every data set.
    pub fn applies_to(&self, data_set: &str) -> bool {
        self.data_set.as_deref().map_or(true, |ds| ds == data_set)
    }
}

/// A data element resolved for one data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataElement {
    /// Local target id, also used as the human-readable label.
    pub target_id: String,
    /// External DHIS2 data element id.
    pub data_element: String,
}

impl Settings {
    /// Target definitions, from `tasks.targets.items` or `targets.items`.
    pub fn target_definitions(&self) -> &[TargetDefinition] {
        self.tasks
            .as_ref()
            .and_then(|tasks| tasks.targets.as_ref())
            .or(self.targets.as_ref())
            .map(|targets| targets.items.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a configured data set by guid.
    pub fn data_set(&self, guid: &str) -> Option<&DataSetDefinition> {
        self.dhis_data_sets
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .find(|ds| ds.guid == guid)
    }

    /// Data elements bound to `data_set`, in definition order.
    pub fn data_elements_for(&self, data_set: &str) -> Vec<DataElement> {
        self.target_definitions()
            .iter()
            .flat_map(|target| {
                target
                    .dhis
                    .iter()
                    .filter(move |binding| binding.applies_to(data_set))
                    .filter_map(move |binding| {
                        binding.data_element.as_ref().map(|element| DataElement {
                            target_id: target.id.clone(),
                            data_element: element.clone(),
                        })
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

/// A contact's org unit, optionally restricted to one data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhisMapping {
    #[serde(rename = "orgUnit", default, skip_serializing_if = "Option::is_none")]
    pub org_unit: Option<String>,
    #[serde(rename = "dataSet", default, skip_serializing_if = "Option::is_none")]
    pub data_set: Option<String>,
}

/// Nested lineage reference, `{_id, parent: {_id, parent: ...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ParentRef>>,
}

/// A place or person in the organizational hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub doc_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dhis: Vec<DhisMapping>,
}

impl Contact {
    /// Whether the document type denotes a contact.
    pub fn is_contact(&self) -> bool {
        CONTACT_TYPES.contains(&self.doc_type.as_str())
    }

    /// The name, or the id for unnamed contacts.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// The contact's own org unit for `data_set`.
    ///
    /// An explicit data-set match wins; otherwise a mapping without a data
    /// set applies only if it is the contact's single mapping.
    pub fn org_unit_for(&self, data_set: &str) -> Option<&str> {
        if let Some(mapping) = self
            .dhis
            .iter()
            .find(|m| m.data_set.as_deref() == Some(data_set))
        {
            return mapping.org_unit.as_deref();
        }

        match self.dhis.as_slice() {
            [only] if only.data_set.is_none() => only.org_unit.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Target documents
// ---------------------------------------------------------------------------

/// Which numeric field of a target value is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueField {
    #[default]
    Total,
    Pass,
    Percent,
}

impl fmt::Display for ValueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueField::Total => write!(f, "total"),
            ValueField::Pass => write!(f, "pass"),
            ValueField::Percent => write!(f, "percent"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetValue {
    #[serde(default)]
    pub pass: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

impl TargetValue {
    pub fn field(&self, field: ValueField) -> f64 {
        match field {
            ValueField::Total => self.total,
            ValueField::Pass => self.pass,
            ValueField::Percent => self.percent.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetric {
    pub id: String,
    #[serde(default)]
    pub value: TargetValue,
}

/// Per-contact, per-interval snapshot of target values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDoc {
    /// `target~<interval>~<user>~<owner>`
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type", default)]
    pub doc_type: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetMetric>,
}

impl TargetDoc {
    /// The interval label encoded in the document id.
    pub fn interval(&self) -> Option<&str> {
        let mut parts = self.id.split('~');
        match (parts.next(), parts.next()) {
            (Some("target"), Some(interval)) if !interval.is_empty() => Some(interval),
            _ => None,
        }
    }

    pub fn metric(&self, target_id: &str) -> Option<&TargetMetric> {
        self.targets.iter().find(|t| t.id == target_id)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One exported row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValue {
    pub data_element: String,
    pub org_unit: String,
    #[serde(serialize_with = "serialize_number")]
    pub value: f64,
}

/// The DHIS2 data value set produced by an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub data_set: String,
    /// `YYYYMM`
    pub period: String,
    /// `YYYY-MM-DD`
    pub complete_date: String,
    pub data_values: Vec<DataValue>,
}

/// A selectable reporting period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodChoice {
    /// Start of the month in epoch milliseconds.
    pub timestamp: String,
    /// `Month, YYYY`
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceSummary {
    pub id: String,
    pub name: String,
}

/// Configured places grouped by the data set of their mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacesByDataSet {
    pub by_data_set: BTreeMap<String, Vec<PlaceSummary>>,
    /// Places whose mapping names no data set.
    pub unrestricted: Vec<PlaceSummary>,
}

/// Choices offered by the export form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCatalog {
    pub data_sets: Option<Vec<DataSetDefinition>>,
    pub periods: Vec<PeriodChoice>,
    pub places: PlacesByDataSet,
    pub selected_data_set: Option<String>,
}
