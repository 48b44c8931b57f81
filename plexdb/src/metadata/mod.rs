use crate::error::Result;
use crate::schema::{IndexDefinition, Schema};
use crate::storage::StorageEngine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Logical path of the metadata file inside the database root
pub const METADATA_FILE: &str = ".plexmeta";

/// Database-level metadata persisted in `.plexmeta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Registered collections, in registration order
    #[serde(default)]
    pub collections: Vec<String>,
    /// collection -> indexed fields
    #[serde(default)]
    pub indexes: BTreeMap<String, Vec<IndexDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Metadata {
            name: name.into(),
            collections: Vec::new(),
            indexes: BTreeMap::new(),
            saved_at: None,
        }
    }
}

/// In-memory copy of the metadata plus a dirty flag for the autosave timer
pub struct MetadataStore {
    storage: Arc<StorageEngine>,
    state: Mutex<Metadata>,
    dirty: AtomicBool,
}

impl MetadataStore {
    /// Load `.plexmeta`; `None` when the root holds no database.
    pub async fn load(storage: Arc<StorageEngine>) -> Result<Option<Self>> {
        let Some(metadata) = storage.read_as::<Metadata>(METADATA_FILE).await? else {
            return Ok(None);
        };
        Ok(Some(MetadataStore {
            storage,
            state: Mutex::new(metadata),
            dirty: AtomicBool::new(false),
        }))
    }

    pub fn snapshot(&self) -> Metadata {
        self.state.lock().clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Record a collection and its indexes. Returns whether anything changed.
    pub fn register(&self, collection: &str, schema: &Schema) -> bool {
        let definitions = schema.index_definitions();
        let mut state = self.state.lock();
        let mut changed = false;

        if !state.collections.iter().any(|c| c == collection) {
            state.collections.push(collection.to_string());
            changed = true;
        }
        if state.indexes.get(collection) != Some(&definitions) {
            state.indexes.insert(collection.to_string(), definitions);
            changed = true;
        }

        if changed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        changed
    }

    /// Persist the metadata unconditionally
    pub async fn save(&self) -> Result<()> {
        self.dirty.store(false, Ordering::SeqCst);
        let snapshot = {
            let mut state = self.state.lock();
            state.saved_at = Some(Utc::now());
            state.clone()
        };
        if let Err(e) = self.storage.write_as(METADATA_FILE, &snapshot).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        log::debug!("Saved metadata for database '{}'", snapshot.name);
        Ok(())
    }

    /// Persist only when something changed since the last save
    pub async fn save_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }
}
