//! CouchDB-backed document store.
//!
//! Reads go through the database's HTTP API: the settings document by id,
//! contacts via paginated Mango `_find` queries, and target documents via an
//! `_id` range scoped to the requested interval.

use super::{ContactFilter, DocumentStore};
use crate::error::StoreError;
use crate::models::{Contact, Settings, TargetDoc, CONTACT_TYPES};
use crate::store::memory::{decode_contact, SETTINGS_ID};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings for a CouchDB database.
#[derive(Clone)]
pub struct CouchConfig {
    /// Database URL, e.g. `http://localhost:5984/medic`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_seconds: u64,
    /// Documents per `_find` page.
    pub page_size: usize,
}

impl fmt::Debug for CouchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouchConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_seconds", &self.timeout_seconds)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5984/medic".to_string(),
            username: None,
            password: None,
            timeout_seconds: 30,
            page_size: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    docs: Vec<Value>,
    #[serde(default)]
    bookmark: Option<String>,
}

/// A [`DocumentStore`] over a CouchDB database.
pub struct CouchStore {
    config: CouchConfig,
    base_url: String,
    http_client: reqwest::Client,
}

impl CouchStore {
    pub fn new(config: CouchConfig) -> Result<Self, StoreError> {
        if config.page_size == 0 {
            return Err(StoreError::Config("page_size must be at least 1".to_string()));
        }
        let base_url = config.url.trim_end_matches('/').to_string();

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_seconds));
        if is_loopback(&base_url) {
            builder = builder.no_proxy();
        }
        let http_client = builder.build()?;

        info!("Using CouchDB database at {}", base_url);

        Ok(Self {
            config,
            base_url,
            http_client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http_client
            .request(method, format!("{}/{}", self.base_url, path));
        match self.config.username {
            Some(ref username) => builder.basic_auth(username, self.config.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        builder.send().await.map_err(|e| {
            if e.is_connect() {
                StoreError::Unavailable(self.base_url.clone())
            } else {
                StoreError::Http(e)
            }
        })
    }

    /// Pass through success responses; `document` names what a 404 is missing.
    async fn check(response: Response, document: Option<&str>) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body, document))
    }

    async fn find(&self, body: &Value) -> Result<FindResponse, StoreError> {
        let response = self
            .send(self.request(Method::POST, "_find").json(body))
            .await?;
        let response = Self::check(response, None).await?;
        Ok(response.json().await?)
    }
}

fn is_loopback(url: &str) -> bool {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| matches!(h, "localhost" | "127.0.0.1" | "[::1]")))
        .unwrap_or(false)
}

fn status_error(status: StatusCode, body: String, document: Option<&str>) -> StoreError {
    match document {
        Some(id) if status == StatusCode::NOT_FOUND => StoreError::NotFound(id.to_string()),
        _ => StoreError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

/// Bookmark for the next `_find` page, or `None` once the listing is done.
fn next_bookmark(
    previous: Option<&str>,
    fetched: usize,
    page_size: usize,
    bookmark: Option<String>,
) -> Option<String> {
    if fetched < page_size {
        return None;
    }
    bookmark.filter(|mark| previous != Some(mark.as_str()))
}

/// Mango selector for contacts matching `filter`.
fn contact_selector(filter: &ContactFilter) -> Value {
    let mut selector = json!({ "type": { "$in": CONTACT_TYPES } });
    match filter {
        ContactFilter::All => {}
        ContactFilter::Configured => {
            selector["dhis"] = json!({ "$exists": true });
        }
    }
    selector
}

/// Mango selector for the target document of `owner` in `interval`.
fn target_selector(owner: &str, interval: &str) -> Value {
    let prefix = format!("target~{}~", interval);
    json!({
        "type": "target",
        "owner": owner,
        "_id": { "$gt": prefix, "$lt": format!("{}\u{fff0}", prefix) }
    })
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn get_settings(&self) -> Result<Settings, StoreError> {
        let response = self.send(self.request(Method::GET, SETTINGS_ID)).await?;
        let mut doc: Value = Self::check(response, Some(SETTINGS_ID)).await?.json().await?;
        let settings = match doc.get_mut("settings") {
            Some(inner) => inner.take(),
            None => doc,
        };
        Ok(serde_json::from_value(settings)?)
    }

    async fn query_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>, StoreError> {
        let selector = contact_selector(filter);
        let mut bookmark: Option<String> = None;
        let mut contacts = Vec::new();

        loop {
            let mut body = json!({ "selector": selector.clone(), "limit": self.config.page_size });
            if let Some(ref mark) = bookmark {
                body["bookmark"] = json!(mark);
            }

            let page = self.find(&body).await?;
            let fetched = page.docs.len();
            for contact in page.docs.into_iter().filter_map(decode_contact) {
                if contact.is_contact() && filter.matches(&contact) {
                    contacts.push(contact);
                }
            }
            debug!("Fetched page of {} contacts", fetched);

            bookmark = match next_bookmark(
                bookmark.as_deref(),
                fetched,
                self.config.page_size,
                page.bookmark,
            ) {
                Some(next) => Some(next),
                None => break,
            };
        }

        Ok(contacts)
    }

    async fn get_target_doc(
        &self,
        owner: &str,
        interval: &str,
    ) -> Result<Option<TargetDoc>, StoreError> {
        let body = json!({ "selector": target_selector(owner, interval), "limit": 1 });
        let page = self.find(&body).await?;
        let Some(doc) = page.docs.into_iter().next() else {
            return Ok(None);
        };
        match serde_json::from_value(doc) {
            Ok(target) => Ok(Some(target)),
            Err(e) => {
                warn!("Skipping malformed target document of {}: {}", owner, e);
                Ok(None)
            }
        }
    }
}
