//! JSON dump loading.
//!
//! A dump is either one JSON file or a directory of `*.json` files. Each
//! file may hold a single document, an array of documents, a `{"docs": [...]}`
//! bulk body, or a CouchDB `_all_docs?include_docs=true` response.

use super::MemoryStore;
use crate::error::StoreError;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Loads JSON dumps into a [`MemoryStore`].
pub struct FileStore;

impl FileStore {
    /// Open a dump file or directory.
    pub fn open(path: &Path) -> Result<MemoryStore, StoreError> {
        let files = if path.is_dir() {
            Self::json_files(path)
        } else {
            vec![path.to_path_buf()]
        };

        let mut store = MemoryStore::new();
        for file in &files {
            let content = fs::read_to_string(file).map_err(|source| StoreError::Io {
                path: file.clone(),
                source,
            })?;
            let value: Value = serde_json::from_str(&content)?;
            let docs = extract_docs(value);
            debug!("{}: {} documents", file.display(), docs.len());
            for doc in docs {
                store.insert_doc(doc)?;
            }
        }

        info!(
            "Loaded {} contacts and {} target documents from {}",
            store.contact_count(),
            store.target_doc_count(),
            path.display()
        );
        Ok(store)
    }

    /// All `*.json` files below `dir`, in a stable order.
    fn json_files(dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("json"))
            .map(DirEntry::into_path)
            .collect()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Pull the documents out of one parsed dump file.
fn extract_docs(value: Value) -> Vec<Value> {
    match value {
        Value::Array(docs) => docs,
        Value::Object(mut map) => {
            if let Some(Value::Array(rows)) = map.remove("rows") {
                rows.into_iter()
                    .filter_map(|mut row| row.get_mut("doc").map(Value::take))
                    .filter(|doc| !doc.is_null())
                    .collect()
            } else if let Some(Value::Array(docs)) = map.remove("docs") {
                docs
            } else {
                vec![Value::Object(map)]
            }
        }
        _ => Vec::new(),
    }
}
