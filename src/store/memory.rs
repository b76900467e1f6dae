//! In-memory document store.

use super::{ContactFilter, DocumentStore};
use crate::error::StoreError;
use crate::models::{Contact, Settings, TargetDoc, CONTACT_TYPES};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Id of the settings document.
pub const SETTINGS_ID: &str = "settings";

/// A store holding typed documents in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    settings: Option<Settings>,
    contacts: Vec<Contact>,
    /// Contact id to position in `contacts`.
    contact_index: HashMap<String, usize>,
    /// Keyed by (owner, interval).
    targets: HashMap<(String, String), TargetDoc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from raw JSON documents.
    pub fn from_docs<I>(docs: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut store = Self::new();
        for doc in docs {
            store.insert_doc(doc)?;
        }
        Ok(store)
    }

    /// Classify a raw document and insert it.
    ///
    /// Unrelated documents are skipped. Contacts and target documents that
    /// fail to decode are skipped with a warning; only an undecodable
    /// settings document is an error.
    pub fn insert_doc(&mut self, doc: Value) -> Result<(), StoreError> {
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let doc_type = doc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if id == SETTINGS_ID {
            let inner = match doc.get("settings") {
                Some(settings) => settings.clone(),
                None => doc,
            };
            self.set_settings(serde_json::from_value(inner)?);
        } else if doc_type == "target" {
            match serde_json::from_value(doc) {
                Ok(target) => {
                    self.insert_target_doc(target);
                }
                Err(e) => warn!("Skipping malformed target document {}: {}", id, e),
            }
        } else if CONTACT_TYPES.contains(&doc_type.as_str()) {
            if let Some(contact) = decode_contact(doc) {
                self.insert_contact(contact);
            }
        } else {
            debug!("Skipping document {} of type '{}'", id, doc_type);
        }

        Ok(())
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = Some(settings);
    }

    /// Insert a contact, replacing any contact with the same id.
    pub fn insert_contact(&mut self, contact: Contact) {
        match self.contact_index.get(&contact.id) {
            Some(&pos) => self.contacts[pos] = contact,
            None => {
                self.contact_index
                    .insert(contact.id.clone(), self.contacts.len());
                self.contacts.push(contact);
            }
        }
    }

    /// Insert a target document. Returns false if its id carries no interval.
    pub fn insert_target_doc(&mut self, doc: TargetDoc) -> bool {
        let Some(interval) = doc.interval().map(str::to_string) else {
            warn!("Target document {} has no interval in its id, skipping", doc.id);
            return false;
        };

        let key = (doc.owner.clone(), interval);
        if let Some(previous) = self.targets.insert(key, doc) {
            debug!("Replaced target document {}", previous.id);
        }
        true
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn target_doc_count(&self) -> usize {
        self.targets.len()
    }

    pub fn has_settings(&self) -> bool {
        self.settings.is_some()
    }
}

/// Decode a contact, logging and dropping it when the document is malformed.
pub(crate) fn decode_contact(doc: Value) -> Option<Contact> {
    let id = doc
        .get("_id")
        .and_then(Value::as_str)
        .unwrap_or("<no id>")
        .to_string();
    match serde_json::from_value(doc) {
        Ok(contact) => Some(contact),
        Err(e) => {
            warn!("Skipping malformed contact {}: {}", id, e);
            None
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_settings(&self) -> Result<Settings, StoreError> {
        self.settings
            .clone()
            .ok_or_else(|| StoreError::NotFound(SETTINGS_ID.to_string()))
    }

    async fn query_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>, StoreError> {
        Ok(self
            .contacts
            .iter()
            .filter(|c| c.is_contact() && filter.matches(c))
            .cloned()
            .collect())
    }

    async fn get_target_doc(
        &self,
        owner: &str,
        interval: &str,
    ) -> Result<Option<TargetDoc>, StoreError> {
        Ok(self
            .targets
            .get(&(owner.to_string(), interval.to_string()))
            .cloned())
    }
}
