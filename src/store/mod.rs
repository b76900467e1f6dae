//! Document store access.
//!
//! The export only reads three things: the settings document, contacts,
//! and per-owner target documents. [`DocumentStore`] is that seam; the
//! in-memory, JSON dump and CouchDB backends implement it.

pub mod couch;
pub mod file;
pub mod memory;

pub use couch::{CouchConfig, CouchStore};
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::models::{Contact, Settings, TargetDoc};
use async_trait::async_trait;

/// Which contacts a query returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactFilter {
    /// Every contact.
    All,
    /// Contacts with at least one `dhis` mapping.
    Configured,
}

impl ContactFilter {
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            ContactFilter::All => true,
            ContactFilter::Configured => !contact.dhis.is_empty(),
        }
    }
}

/// Read-only access to the documents an export needs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the application settings.
    async fn get_settings(&self) -> Result<Settings, StoreError>;

    /// Contacts matching `filter`. Non-contact documents are never returned.
    async fn query_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>, StoreError>;

    /// The target document of `owner` for `interval` (`YYYY-MM`), if any.
    async fn get_target_doc(
        &self,
        owner: &str,
        interval: &str,
    ) -> Result<Option<TargetDoc>, StoreError>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Box<T> {
    async fn get_settings(&self) -> Result<Settings, StoreError> {
        (**self).get_settings().await
    }

    async fn query_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>, StoreError> {
        (**self).query_contacts(filter).await
    }

    async fn get_target_doc(
        &self,
        owner: &str,
        interval: &str,
    ) -> Result<Option<TargetDoc>, StoreError> {
        (**self).get_target_doc(owner, interval).await
    }
}
