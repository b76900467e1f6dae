//! Export catalog: the data sets, periods and places an export can target.

use super::period::recent_periods;
use crate::error::ExportError;
use crate::models::{Contact, ExportCatalog, PlaceSummary, PlacesByDataSet};
use crate::store::{ContactFilter, DocumentStore};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

pub const DEFAULT_PERIOD_COUNT: usize = 6;

fn push_unique(places: &mut Vec<PlaceSummary>, place: &PlaceSummary) {
    if !places.iter().any(|p| p.id == place.id) {
        places.push(place.clone());
    }
}

/// Group configured contacts by the data set named in each of their mappings.
pub fn places_by_data_set(contacts: &[Contact]) -> PlacesByDataSet {
    let mut places = PlacesByDataSet::default();

    for contact in contacts {
        let summary = PlaceSummary {
            id: contact.id.clone(),
            name: contact.display_name().to_string(),
        };
        for mapping in &contact.dhis {
            match mapping.data_set {
                Some(ref data_set) => {
                    push_unique(places.by_data_set.entry(data_set.clone()).or_default(), &summary)
                }
                None => push_unique(&mut places.unrestricted, &summary),
            }
        }
    }

    places
}

/// Build the export catalog from the store.
pub async fn catalog<S>(
    store: &S,
    now: DateTime<Utc>,
    period_count: usize,
) -> Result<ExportCatalog, ExportError>
where
    S: DocumentStore + ?Sized,
{
    let settings = store.get_settings().await?;
    let data_sets = settings.dhis_data_sets;

    let places = if data_sets.is_some() {
        let mut contacts = store.query_contacts(&ContactFilter::Configured).await?;
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("{} configured contacts", contacts.len());
        places_by_data_set(&contacts)
    } else {
        info!("No dhisDataSets configured");
        PlacesByDataSet::default()
    };

    let selected_data_set = data_sets
        .as_ref()
        .and_then(|sets| sets.first())
        .map(|ds| ds.guid.clone());

    Ok(ExportCatalog {
        data_sets,
        periods: recent_periods(now, period_count),
        places,
        selected_data_set,
    })
}
