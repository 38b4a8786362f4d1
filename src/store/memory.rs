use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::db::{
    ConnectError, ConnectOptions, DocumentBackend, DocumentStore, ExecuteError, ListError,
    QueryExecutor, RawValue, ResultSet,
};

use super::sql::{parse_select, run_select};

/// Fields of one document.
pub type Document = BTreeMap<String, RawValue>;

/// Documents of one collection keyed by id.
pub type Collection = BTreeMap<String, Document>;

/// A document database held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: BTreeMap<String, Collection>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    collections: BTreeMap<String, BTreeMap<String, serde_json::Map<String, serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: &str, id: &str, document: Document) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    /// Parse a fixture of the form `{"collections": {"users": {"alice": {...}}}}`.
    ///
    /// Strings holding RFC 3339 timestamps are loaded as timestamps.
    pub fn from_json(json: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(json).context("Invalid fixture JSON")?;
        let mut store = Self::new();
        for (collection, documents) in fixture.collections {
            store.collections.entry(collection.clone()).or_default();
            for (id, fields) in documents {
                let document = fields
                    .into_iter()
                    .map(|(name, value)| (name, fixture_value(value)))
                    .collect();
                store.insert(&collection, &id, document);
            }
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture: {}", path.display()))?;
        Self::from_json(&content)
    }
}

fn fixture_value(value: serde_json::Value) -> RawValue {
    match value {
        serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(ts) => RawValue::Timestamp(ts.with_timezone(&Utc)),
            Err(_) => RawValue::Text(s),
        },
        serde_json::Value::Array(items) => {
            RawValue::Array(items.into_iter().map(fixture_value).collect())
        }
        serde_json::Value::Object(map) => RawValue::Map(
            map.into_iter()
                .map(|(k, v)| (k, fixture_value(v)))
                .collect(),
        ),
        other => RawValue::from(other),
    }
}

/// Backend serving every project from one shared [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
}

impl MemoryBackend {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    fn check_options(&self, options: &ConnectOptions) -> Result<(), ConnectError> {
        if options.project_id.trim().is_empty() {
            return Err(ConnectError::MissingProjectId);
        }
        if let Some(blob) = &options.service_account {
            let parsed: serde_json::Value = serde_json::from_str(blob)
                .map_err(|e| ConnectError::Credentials(e.to_string()))?;
            if parsed.get("type").and_then(|t| t.as_str()).is_none() {
                return Err(ConnectError::Credentials(
                    "missing \"type\" field".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl DocumentBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn executor(&self, options: &ConnectOptions) -> Result<Box<dyn QueryExecutor>, ConnectError> {
        self.check_options(options)?;
        Ok(Box::new(MemoryExecutor {
            store: Arc::clone(&self.store),
            documents_root: format!(
                "projects/{}/databases/{}/documents",
                options.project_id,
                options.database_id()
            ),
        }))
    }

    fn store(&self, options: &ConnectOptions) -> Result<Box<dyn DocumentStore>, ConnectError> {
        self.check_options(options)?;
        Ok(Box::new(MemoryCollections {
            store: Arc::clone(&self.store),
        }))
    }
}

/// Runs the SQL subset against a [`MemoryStore`].
pub struct MemoryExecutor {
    store: Arc<MemoryStore>,
    documents_root: String,
}

impl QueryExecutor for MemoryExecutor {
    fn execute(&self, query: &str) -> Result<ResultSet, ExecuteError> {
        let plan = parse_select(query)?;
        let empty = Collection::new();
        let collection = self.store.collection(&plan.collection).unwrap_or(&empty);
        let prefix = format!("{}/{}", self.documents_root, plan.collection);
        Ok(run_select(&plan, collection, &prefix))
    }
}

struct MemoryCollections {
    store: Arc<MemoryStore>,
}

impl DocumentStore for MemoryCollections {
    fn first_collection(&self) -> Result<Option<String>, ListError> {
        Ok(self.store.collection_names().next().map(str::to_string))
    }
}
