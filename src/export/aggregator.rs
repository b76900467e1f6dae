//! Target aggregation into DHIS2 data values.
//!
//! For a data set and a reporting month, every contact with its own org-unit
//! mapping becomes a row per bound data element. Target documents of the
//! contacts below (and including) those rows are summed into them.

use super::hierarchy::{AttributionPolicy, Hierarchy, DEFAULT_MAX_DEPTH};
use super::period::Period;
use crate::error::ExportError;
use crate::models::{Contact, DataElement, DataValue, ExportResult, TargetDoc, ValueField};
use crate::store::{ContactFilter, DocumentStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

pub const DEFAULT_CONCURRENCY: usize = 8;

/// Per-call export options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Restrict the export to this place and its descendants.
    pub place_id: Option<String>,
    /// Replace identifiers with labels in the output.
    pub human_readable: bool,
}

/// Aggregation settings that come from configuration rather than the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationPolicy {
    pub attribution: AttributionPolicy,
    pub value_field: ValueField,
    pub max_depth: usize,
    /// Maximum number of target documents fetched at once.
    pub concurrency: usize,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            attribution: AttributionPolicy::default(),
            value_field: ValueField::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// One accumulated (data element, org unit) row.
#[derive(Debug)]
struct Row {
    data_element: String,
    org_unit: String,
    element_label: String,
    org_unit_label: String,
    value: f64,
}

/// Sums keyed by (data element, org unit), kept in registration order.
#[derive(Debug, Default)]
struct Accumulator {
    rows: Vec<Row>,
    positions: HashMap<(String, String), usize>,
}

impl Accumulator {
    fn register(&mut self, element: &DataElement, org_unit: &str, org_unit_label: &str) -> usize {
        let key = (element.data_element.clone(), org_unit.to_string());
        if let Some(&pos) = self.positions.get(&key) {
            return pos;
        }
        self.rows.push(Row {
            data_element: element.data_element.clone(),
            org_unit: org_unit.to_string(),
            element_label: element.target_id.clone(),
            org_unit_label: org_unit_label.to_string(),
            value: 0.0,
        });
        self.positions.insert(key, self.rows.len() - 1);
        self.rows.len() - 1
    }

    fn add(&mut self, element: &DataElement, contact: &Contact, org_unit: &str, amount: f64) {
        let pos = self.register(element, org_unit, contact.display_name());
        self.rows[pos].value += amount;
    }

    fn into_values(self, human_readable: bool) -> Vec<DataValue> {
        self.rows
            .into_iter()
            .map(|row| {
                let (data_element, org_unit) = if human_readable {
                    (row.element_label, row.org_unit_label)
                } else {
                    (row.data_element, row.org_unit)
                };
                DataValue {
                    data_element,
                    org_unit,
                    value: row.value,
                }
            })
            .collect()
    }
}

/// Runs exports against a document store.
pub struct Exporter<S> {
    store: S,
    policy: AggregationPolicy,
}

impl<S: DocumentStore> Exporter<S> {
    pub fn new(store: S) -> Self {
        Self::with_policy(store, AggregationPolicy::default())
    }

    pub fn with_policy(store: S, policy: AggregationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Aggregate the month containing `period` for `data_set`.
    pub async fn aggregate(
        &self,
        period: DateTime<Utc>,
        data_set: &str,
        options: &ExportOptions,
    ) -> Result<ExportResult, ExportError> {
        run(&self.store, &self.policy, period, data_set, options).await
    }
}

/// Aggregate with the default policy.
pub async fn aggregate<S>(
    store: &S,
    period: DateTime<Utc>,
    data_set: &str,
    options: &ExportOptions,
) -> Result<ExportResult, ExportError>
where
    S: DocumentStore + ?Sized,
{
    run(store, &AggregationPolicy::default(), period, data_set, options).await
}

async fn run<S>(
    store: &S,
    policy: &AggregationPolicy,
    at: DateTime<Utc>,
    data_set: &str,
    options: &ExportOptions,
) -> Result<ExportResult, ExportError>
where
    S: DocumentStore + ?Sized,
{
    let settings = store.get_settings().await?;
    let definition = settings
        .data_set(data_set)
        .ok_or_else(|| ExportError::DataSetNotDefined(data_set.to_string()))?;
    let elements = settings.data_elements_for(data_set);
    if elements.is_empty() {
        return Err(ExportError::NoDataElements(data_set.to_string()));
    }

    let period = Period::from_datetime(at);
    let interval = period.interval();
    info!(
        "Exporting dataSet {} for {} ({} data elements)",
        data_set,
        period.description(),
        elements.len()
    );

    // The whole index is needed to resolve a subtree through shallow parent refs.
    let mut contacts: Vec<Contact> = store
        .query_contacts(&ContactFilter::All)
        .await?
        .into_iter()
        .filter(Contact::is_contact)
        .collect();
    contacts.sort_by(|a, b| a.id.cmp(&b.id));
    contacts.dedup_by(|a, b| a.id == b.id);

    let hierarchy = Hierarchy::new(&contacts, policy.max_depth);
    let in_scope: Vec<bool> = (0..contacts.len())
        .map(|pos| match options.place_id {
            Some(ref place_id) => hierarchy.is_within(pos, place_id),
            None => true,
        })
        .collect();
    let mut accumulator = Accumulator::default();

    // Every mapped contact shows up, even without data.
    for (contact, _) in contacts.iter().zip(&in_scope).filter(|(_, scoped)| **scoped) {
        if let Some(org_unit) = contact.org_unit_for(data_set) {
            for element in &elements {
                accumulator.register(element, org_unit, contact.display_name());
            }
        }
    }

    let owners: Vec<(usize, Vec<usize>)> = (0..contacts.len())
        .filter(|&pos| in_scope[pos])
        .map(|pos| {
            let rows = hierarchy
                .attributions(pos, data_set, policy.attribution)
                .into_iter()
                .filter(|&row| in_scope[row])
                .collect::<Vec<_>>();
            (pos, rows)
        })
        .filter(|(_, rows)| !rows.is_empty())
        .collect();
    debug!(
        "{} contacts, {} in scope, {} target owners",
        contacts.len(),
        in_scope.iter().filter(|&&scoped| scoped).count(),
        owners.len()
    );

    // Completion order is arbitrary; keying by position restores contact order.
    let fetched: Vec<Option<(usize, TargetDoc)>> =
        stream::iter(owners.iter().map(|(pos, _)| *pos))
            .map(|pos| {
                let owner = contacts[pos].id.as_str();
                let interval = interval.as_str();
                async move {
                    store
                        .get_target_doc(owner, interval)
                        .await
                        .map(|doc| doc.map(|doc| (pos, doc)))
                }
            })
            .buffer_unordered(policy.concurrency.max(1))
            .try_collect()
            .await?;
    let docs: BTreeMap<usize, TargetDoc> = fetched.into_iter().flatten().collect();
    debug!("Loaded {} target documents for {}", docs.len(), interval);

    for (pos, rows) in &owners {
        let Some(doc) = docs.get(pos) else {
            continue;
        };
        // A document counts once per org unit, however many mapped ancestors share it.
        let mut targets: Vec<(&Contact, &str)> = Vec::with_capacity(rows.len());
        for &row in rows {
            let contact = hierarchy.contact(row);
            if let Some(org_unit) = contact.org_unit_for(data_set) {
                if !targets.iter().any(|(_, seen)| *seen == org_unit) {
                    targets.push((contact, org_unit));
                }
            }
        }

        for element in &elements {
            let amount = doc
                .metric(&element.target_id)
                .map(|metric| metric.value.field(policy.value_field))
                .unwrap_or(0.0);
            for &(contact, org_unit) in &targets {
                accumulator.add(element, contact, org_unit, amount);
            }
        }
    }

    let data_set_name = if options.human_readable {
        definition.display_label().to_string()
    } else {
        definition.guid.clone()
    };
    let data_values = accumulator.into_values(options.human_readable);
    info!("Exported {} data values", data_values.len());

    Ok(ExportResult {
        data_set: data_set_name,
        period: period.code(),
        complete_date: period.complete_date_string(),
        data_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::export::period::parse_period;
    use crate::models::Settings;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    const DATA_SET: &str = "abc123";

    fn now() -> DateTime<Utc> {
        parse_period("2000-02-21").unwrap()
    }

    fn merge(mut base: Value, overrides: Value) -> Value {
        if let (Some(base), Value::Object(overrides)) = (base.as_object_mut(), overrides) {
            for (key, value) in overrides {
                base.insert(key, value);
            }
        }
        base
    }

    fn mock_contact(username: &str, overrides: Value) -> Value {
        merge(
            json!({
                "_id": format!("{}-guid", username),
                "type": "contact",
                "contact_type": "person",
                "name": username,
                "dhis": { "orgUnit": format!("ou-{}", username) }
            }),
            overrides,
        )
    }

    fn mock_target_doc(username: &str, interval: &str, overrides: Value) -> Value {
        merge(
            json!({
                "_id": format!("target~{}~org.couchdb.user:{}~{}-guid", interval, username, username),
                "type": "target",
                "owner": format!("{}-guid", username),
                "user": format!("org.couchdb.user:{}", username),
                "targets": [
                    { "id": "births-this-month", "value": { "pass": 0, "total": 12 } },
                    { "id": "facility-deliveries", "value": { "pass": 2, "total": 4, "percent": 50 } }
                ]
            }),
            overrides,
        )
    }

    fn mock_settings(data_sets: Value, targets: Value) -> Value {
        json!({
            "_id": "settings",
            "settings": {
                "dhisDataSets": data_sets,
                "tasks": { "targets": { "items": targets } }
            }
        })
    }

    fn default_settings() -> Value {
        mock_settings(
            json!([{ "guid": DATA_SET, "label": "Community births" }]),
            json!([
                { "id": "deaths-this-month" },
                { "id": "births-this-month", "dhis": { "dataSet": DATA_SET, "dataElement": "elBTM" } },
                { "id": "facility-deliveries", "dhis": { "dataElement": "elFD" } },
                { "id": "active-pregnancies" }
            ]),
        )
    }

    fn settings_with_multiple_datasets() -> Value {
        mock_settings(
            json!([
                { "guid": "ds-1", "label": "dataset 1" },
                { "guid": "ds-2", "label": "dataset 2" }
            ]),
            json!([
                { "id": "data element 1", "dhis": { "dataSet": "ds-1", "dataElement": "de-1" } },
                { "id": "data element 2", "dhis": { "dataSet": "ds-2", "dataElement": "de-2" } },
                { "id": "data element both", "dhis": { "dataElement": "de-both" } }
            ]),
        )
    }

    fn store(docs: Vec<Value>) -> MemoryStore {
        MemoryStore::from_docs(docs).unwrap()
    }

    async fn export(store: &MemoryStore, data_set: &str, options: ExportOptions) -> Value {
        let result = aggregate(store, now(), data_set, &options).await.unwrap();
        serde_json::to_value(result).unwrap()
    }

    fn nominal_store() -> MemoryStore {
        store(vec![
            default_settings(),
            mock_contact("chu1", json!({})),
            mock_contact("chu2", json!({})),
            mock_contact("chw", json!({ "dhis": null, "parent": { "_id": "chu1-guid" } })),
            mock_target_doc("ignore1", "2000-01", json!({})),
            mock_target_doc("chw", "2000-02", json!({})),
            mock_target_doc("chu1", "2000-02", json!({})),
            mock_target_doc("chu2", "2000-02", json!({})),
            mock_target_doc("ignore2", "2000-03", json!({})),
        ])
    }

    #[tokio::test]
    async fn test_sums_all_data_elements_for_interval() {
        let actual = export(&nominal_store(), DATA_SET, ExportOptions::default()).await;
        assert_eq!(
            actual,
            json!({
                "completeDate": "2000-02-21",
                "dataSet": DATA_SET,
                "dataValues": [
                    { "dataElement": "elBTM", "orgUnit": "ou-chu1", "value": 24 },
                    { "dataElement": "elFD", "orgUnit": "ou-chu1", "value": 8 },
                    { "dataElement": "elBTM", "orgUnit": "ou-chu2", "value": 12 },
                    { "dataElement": "elFD", "orgUnit": "ou-chu2", "value": 4 }
                ],
                "period": "200002"
            })
        );
    }

    #[tokio::test]
    async fn test_org_unit_without_target_docs_gets_zeros() {
        let store = store(vec![default_settings(), mock_contact("chu", json!({}))]);
        let actual = export(&store, DATA_SET, ExportOptions::default()).await;
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "elBTM", "orgUnit": "ou-chu", "value": 0 },
                { "dataElement": "elFD", "orgUnit": "ou-chu", "value": 0 }
            ])
        );
        assert_eq!(actual["period"], "200002");
    }

    #[tokio::test]
    async fn test_no_contacts_yields_empty_values() {
        let store = store(vec![default_settings()]);
        let actual = export(&store, DATA_SET, ExportOptions::default()).await;
        assert_eq!(actual["dataValues"], json!([]));
    }

    #[tokio::test]
    async fn test_human_readable_single_data_set() {
        let store = store(vec![
            default_settings(),
            mock_contact("chu", json!({})),
            mock_target_doc("chu", "2000-02", json!({})),
        ]);
        let options = ExportOptions {
            human_readable: true,
            ..ExportOptions::default()
        };
        let actual = export(&store, DATA_SET, options).await;
        assert_eq!(actual["dataSet"], "Community births");
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "births-this-month", "orgUnit": "chu", "value": 12 },
                { "dataElement": "facility-deliveries", "orgUnit": "chu", "value": 4 }
            ])
        );
    }

    #[tokio::test]
    async fn test_human_readable_contact_with_multiple_org_units() {
        let store = store(vec![
            settings_with_multiple_datasets(),
            mock_contact(
                "chu",
                json!({ "dhis": [
                    { "orgUnit": "ou-1", "dataSet": "ds-1" },
                    { "orgUnit": "ou-2", "dataSet": "ds-2" }
                ] }),
            ),
        ]);
        let options = ExportOptions {
            human_readable: true,
            ..ExportOptions::default()
        };
        let actual = export(&store, "ds-1", options).await;
        assert_eq!(
            actual,
            json!({
                "dataSet": "dataset 1",
                "completeDate": "2000-02-21",
                "period": "200002",
                "dataValues": [
                    { "dataElement": "data element 1", "orgUnit": "chu", "value": 0 },
                    { "dataElement": "data element both", "orgUnit": "chu", "value": 0 }
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_place_id_filter() {
        let options = ExportOptions {
            place_id: Some("chu1-guid".to_string()),
            ..ExportOptions::default()
        };
        let actual = export(&nominal_store(), DATA_SET, options).await;
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "elBTM", "orgUnit": "ou-chu1", "value": 24 },
                { "dataElement": "elFD", "orgUnit": "ou-chu1", "value": 8 }
            ])
        );
    }

    #[tokio::test]
    async fn test_place_id_without_contacts_is_empty() {
        let store = store(vec![
            default_settings(),
            mock_contact("chu", json!({ "dhis": { "orgUnit": "ou", "dataSet": "other" } })),
        ]);
        let options = ExportOptions {
            place_id: Some("chu".to_string()),
            ..ExportOptions::default()
        };
        let actual = export(&store, DATA_SET, options).await;
        assert_eq!(actual["dataValues"], json!([]));
    }

    #[tokio::test]
    async fn test_contact_without_matching_data_set_is_not_included() {
        let store = store(vec![
            default_settings(),
            mock_contact("chu", json!({ "dhis": { "orgUnit": "ou", "dataSet": "other" } })),
            mock_target_doc("chu", "2000-02", json!({})),
        ]);
        let actual = export(&store, DATA_SET, ExportOptions::default()).await;
        assert_eq!(actual["dataValues"], json!([]));
    }

    #[tokio::test]
    async fn test_contact_with_multiple_org_units() {
        let store = store(vec![
            settings_with_multiple_datasets(),
            mock_contact(
                "chu",
                json!({ "dhis": [
                    { "orgUnit": "ou-1", "dataSet": "ds-1" },
                    { "orgUnit": "ou-2", "dataSet": "ds-2" }
                ] }),
            ),
            mock_target_doc(
                "chu",
                "2000-02",
                json!({ "targets": [
                    { "id": "data element 1", "value": { "pass": 0, "total": 1 } },
                    { "id": "data element 2", "value": { "pass": 0, "total": 2 } },
                    { "id": "data element both", "value": { "pass": 0, "total": 100 } }
                ] }),
            ),
        ]);

        let ds1 = export(&store, "ds-1", ExportOptions::default()).await;
        assert_eq!(
            ds1,
            json!({
                "dataSet": "ds-1",
                "completeDate": "2000-02-21",
                "period": "200002",
                "dataValues": [
                    { "dataElement": "de-1", "orgUnit": "ou-1", "value": 1 },
                    { "dataElement": "de-both", "orgUnit": "ou-1", "value": 100 }
                ]
            })
        );

        let ds2 = export(&store, "ds-2", ExportOptions::default()).await;
        assert_eq!(
            ds2["dataValues"],
            json!([
                { "dataElement": "de-2", "orgUnit": "ou-2", "value": 2 },
                { "dataElement": "de-both", "orgUnit": "ou-2", "value": 100 }
            ])
        );
    }

    fn two_org_unit_store() -> MemoryStore {
        store(vec![
            default_settings(),
            mock_contact(
                "chw",
                json!({ "dhis": null, "parent": { "_id": "chu-guid", "parent": { "_id": "hc-guid" } } }),
            ),
            mock_contact("chu", json!({ "parent": { "_id": "hc-guid" } })),
            mock_contact("hc", json!({ "dhis": { "orgUnit": "alt" } })),
            mock_target_doc("chw", "2000-02", json!({})),
            mock_target_doc("hc", "2000-02", json!({})),
        ])
    }

    #[tokio::test]
    async fn test_target_doc_owner_with_two_org_units_in_hierarchy() {
        let actual = export(&two_org_unit_store(), DATA_SET, ExportOptions::default()).await;
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "elBTM", "orgUnit": "ou-chu", "value": 12 },
                { "dataElement": "elFD", "orgUnit": "ou-chu", "value": 4 },
                { "dataElement": "elBTM", "orgUnit": "alt", "value": 24 },
                { "dataElement": "elFD", "orgUnit": "alt", "value": 8 }
            ])
        );
    }

    #[tokio::test]
    async fn test_nearest_attribution_policy() {
        let policy = AggregationPolicy {
            attribution: AttributionPolicy::Nearest,
            ..AggregationPolicy::default()
        };
        let exporter = Exporter::with_policy(two_org_unit_store(), policy);
        let result = exporter
            .aggregate(now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        let values: Vec<(String, f64)> = result
            .data_values
            .into_iter()
            .map(|v| (v.org_unit, v.value))
            .collect();
        assert_eq!(
            values,
            vec![
                ("ou-chu".to_string(), 12.0),
                ("ou-chu".to_string(), 4.0),
                ("alt".to_string(), 12.0),
                ("alt".to_string(), 4.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_value_field_policy() {
        let policy = AggregationPolicy {
            value_field: ValueField::Pass,
            ..AggregationPolicy::default()
        };
        let exporter = Exporter::with_policy(nominal_store(), policy);
        let result = exporter
            .aggregate(now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.data_values[0].value, 0.0);
        assert_eq!(result.data_values[1].value, 4.0);
    }

    #[tokio::test]
    async fn test_target_definitions_for_other_data_sets_are_not_included() {
        let store = store(vec![
            mock_settings(
                json!([{ "guid": "myDataSet", "label": "my data set" }]),
                json!([
                    { "id": "relevant", "dhis": { "dataSet": "myDataSet", "dataElement": "relevant" } },
                    { "id": "irrelevant", "dhis": { "dataSet": "other", "dataElement": "irrelevant" } }
                ]),
            ),
            mock_contact("chu", json!({})),
        ]);
        let actual = export(&store, "myDataSet", ExportOptions::default()).await;
        assert_eq!(
            actual["dataValues"],
            json!([{ "dataElement": "relevant", "orgUnit": "ou-chu", "value": 0 }])
        );
    }

    #[tokio::test]
    async fn test_throws_on_undefined_data_set() {
        let store = store(vec![default_settings()]);
        let err = aggregate(&store, now(), "dne", &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is not defined"));
    }

    #[tokio::test]
    async fn test_throws_on_data_set_without_data_elements() {
        let store = store(vec![mock_settings(
            json!([{ "guid": "myDataSet", "label": "my data set" }]),
            json!([{ "id": "target", "dhis": { "dataSet": "other", "dataElement": "de" } }]),
        )]);
        let err = aggregate(&store, now(), "myDataSet", &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no dataElements"));
    }

    #[tokio::test]
    async fn test_throws_on_absent_target_definitions() {
        let store = store(vec![json!({
            "_id": "settings",
            "settings": { "dhisDataSets": [{ "guid": "ds-1" }] }
        })]);
        let err = aggregate(&store, now(), "ds-1", &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::NoDataElements(_)));
    }

    #[tokio::test]
    async fn test_idempotent_output() {
        let store = nominal_store();
        let first = aggregate(&store, now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        let second = aggregate(&store, now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_parent_cycle_still_exports() {
        let store = store(vec![
            default_settings(),
            mock_contact("a", json!({ "parent": { "_id": "b-guid" } })),
            mock_contact("b", json!({ "parent": { "_id": "a-guid" } })),
            mock_target_doc("a", "2000-02", json!({})),
        ]);
        let actual = export(&store, DATA_SET, ExportOptions::default()).await;
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "elBTM", "orgUnit": "ou-a", "value": 12 },
                { "dataElement": "elFD", "orgUnit": "ou-a", "value": 4 },
                { "dataElement": "elBTM", "orgUnit": "ou-b", "value": 12 },
                { "dataElement": "elFD", "orgUnit": "ou-b", "value": 4 }
            ])
        );
    }

    #[tokio::test]
    async fn test_place_id_includes_grandchildren_with_shallow_parents() {
        let store = store(vec![
            default_settings(),
            mock_contact("hc", json!({})),
            mock_contact("chu", json!({ "parent": { "_id": "hc-guid" } })),
            mock_contact("chw", json!({ "dhis": null, "parent": { "_id": "chu-guid" } })),
            mock_contact("elsewhere", json!({})),
            mock_target_doc("chw", "2000-02", json!({})),
            mock_target_doc("elsewhere", "2000-02", json!({})),
        ]);

        let unfiltered = export(&store, DATA_SET, ExportOptions::default()).await;
        let options = ExportOptions {
            place_id: Some("hc-guid".to_string()),
            ..ExportOptions::default()
        };
        let filtered = export(&store, DATA_SET, options).await;

        let expected = json!([
            { "dataElement": "elBTM", "orgUnit": "ou-chu", "value": 12 },
            { "dataElement": "elFD", "orgUnit": "ou-chu", "value": 4 },
            { "dataElement": "elBTM", "orgUnit": "ou-hc", "value": 12 },
            { "dataElement": "elFD", "orgUnit": "ou-hc", "value": 4 }
        ]);
        assert_eq!(filtered["dataValues"], expected);
        assert_eq!(unfiltered["dataValues"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_place_id_does_not_attribute_above_the_place() {
        let store = store(vec![
            default_settings(),
            mock_contact("hc", json!({})),
            mock_contact("chu", json!({ "parent": { "_id": "hc-guid" } })),
            mock_target_doc("chu", "2000-02", json!({})),
        ]);
        let options = ExportOptions {
            place_id: Some("chu-guid".to_string()),
            ..ExportOptions::default()
        };
        let actual = export(&store, DATA_SET, options).await;
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "elBTM", "orgUnit": "ou-chu", "value": 12 },
                { "dataElement": "elFD", "orgUnit": "ou-chu", "value": 4 }
            ])
        );
    }

    #[tokio::test]
    async fn test_shared_org_unit_counts_document_once() {
        let store = store(vec![
            default_settings(),
            mock_contact("hc", json!({ "dhis": { "orgUnit": "ou-x" } })),
            mock_contact(
                "chu",
                json!({ "dhis": { "orgUnit": "ou-x" }, "parent": { "_id": "hc-guid" } }),
            ),
            mock_target_doc("chu", "2000-02", json!({})),
        ]);
        let actual = export(&store, DATA_SET, ExportOptions::default()).await;
        assert_eq!(
            actual["dataValues"],
            json!([
                { "dataElement": "elBTM", "orgUnit": "ou-x", "value": 12 },
                { "dataElement": "elFD", "orgUnit": "ou-x", "value": 4 }
            ])
        );
    }

    /// Delays target lookups so later owners complete first.
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn get_settings(&self) -> Result<Settings, StoreError> {
            self.inner.get_settings().await
        }

        async fn query_contacts(
            &self,
            filter: &ContactFilter,
        ) -> Result<Vec<Contact>, StoreError> {
            self.inner.query_contacts(filter).await
        }

        async fn get_target_doc(
            &self,
            owner: &str,
            interval: &str,
        ) -> Result<Option<TargetDoc>, StoreError> {
            let delay = if owner.starts_with("chu1") { 30 } else { 1 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.inner.get_target_doc(owner, interval).await
        }
    }

    #[tokio::test]
    async fn test_order_is_independent_of_fetch_completion() {
        let slow = SlowStore {
            inner: nominal_store(),
        };
        let from_slow = aggregate(&slow, now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        let from_fast = aggregate(&nominal_store(), now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(from_slow, from_fast);
    }

    /// Fails every read except settings.
    struct UnavailableStore {
        settings: Settings,
    }

    #[async_trait]
    impl DocumentStore for UnavailableStore {
        async fn get_settings(&self) -> Result<Settings, StoreError> {
            Ok(self.settings.clone())
        }

        async fn query_contacts(&self, _: &ContactFilter) -> Result<Vec<Contact>, StoreError> {
            Err(StoreError::Unavailable("http://localhost:5984/medic".to_string()))
        }

        async fn get_target_doc(&self, _: &str, _: &str) -> Result<Option<TargetDoc>, StoreError> {
            Err(StoreError::Unavailable("http://localhost:5984/medic".to_string()))
        }
    }

    fn unavailable_store() -> UnavailableStore {
        let settings = default_settings()["settings"].clone();
        UnavailableStore {
            settings: serde_json::from_value(settings).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let err = aggregate(&unavailable_store(), now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_validation_precedes_traversal() {
        let err = aggregate(&unavailable_store(), now(), "dne", &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::DataSetNotDefined(_)));
    }

    #[tokio::test]
    async fn test_exporter_over_boxed_store() {
        let boxed: Box<dyn DocumentStore> = Box::new(nominal_store());
        let exporter = Exporter::new(boxed);
        let result = exporter
            .aggregate(now(), DATA_SET, &ExportOptions::default())
            .await
            .unwrap();
        assert_eq!(result.data_values.len(), 4);
        assert_eq!(exporter.policy().concurrency, DEFAULT_CONCURRENCY);
    }
}
