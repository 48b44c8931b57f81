// Collection - schema-validated CRUD and equality queries over one data sub-tree

use crate::document::{Document, Fields};
use crate::error::{PlexDbError, Result};
use crate::events::{Event, EventBus};
use crate::index::{describe, IndexManager};
use crate::schema::{FieldDescriptor, Schema};
use crate::storage::{data_path, StorageEngine, DATA_DIR};
use crate::validation::{prepare_document, validate_document_id};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Handle to a registered collection. Cheap to clone; every clone shares
/// the storage engine, index manager and event bus of its database.
#[derive(Clone)]
pub struct Collection {
    name: String,
    schema: Arc<Schema>,
    storage: Arc<StorageEngine>,
    indexes: Arc<IndexManager>,
    events: Arc<EventBus>,
    pacing: Duration,
}

impl Collection {
    pub(crate) fn new(
        name: impl Into<String>,
        schema: Arc<Schema>,
        storage: Arc<StorageEngine>,
        indexes: Arc<IndexManager>,
        events: Arc<EventBus>,
        pacing: Duration,
    ) -> Self {
        Collection {
            name: name.into(),
            schema,
            storage,
            indexes,
            events,
            pacing,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn data_dir(&self) -> String {
        format!("{DATA_DIR}/{}", self.name)
    }

    /// Make sure `data/<name>/` and one index directory per indexed field exist
    pub(crate) async fn ensure_layout(&self) -> Result<()> {
        self.storage.make_directory(&self.data_dir()).await?;
        for field in self.schema.indexed_fields() {
            self.storage
                .make_directory(&IndexManager::field_dir(&self.name, &field.name))
                .await?;
        }
        Ok(())
    }

    /// Assemble and validate a new document. Nothing is persisted until
    /// the document is passed to [`Collection::write`].
    pub async fn create(&self, input: &Fields) -> Result<Document> {
        let document = prepare_document(&self.name, &self.schema, input).await?;

        for field in self.schema.fields().iter().filter(|f| f.unique) {
            let Some(value) = indexable_value(&document, field) else {
                continue;
            };
            let query = Fields::from([(field.name.clone(), value.clone())]);
            if self.find_one(&query).await?.is_some() {
                return Err(PlexDbError::UniqueConstraintViolation {
                    collection: self.name.clone(),
                    field: field.name.clone(),
                    value: describe(&value),
                });
            }
        }

        log::debug!("Created document {}/{}", self.name, document.id);
        self.events.emit(&Event::Create {
            collection: self.name.clone(),
            document: document.clone(),
        });
        Ok(document)
    }

    /// Persist a document and bring its index entries up to date.
    ///
    /// Unique entries are claimed before the data file is written and count
    /// as taken from that moment on. If any claim fails, the claims made by
    /// this call are released again and nothing else is touched. Entries
    /// left behind by a previous version of the same document are dropped
    /// last.
    pub async fn write(&self, document: &Document) -> Result<()> {
        validate_document_id(&document.id)?;
        for field in self.schema.indexed_fields() {
            if let Some(value) = indexable_value(document, field) {
                IndexManager::entry_path(&self.name, &field.name, &value)?;
            }
        }

        let previous = self.get(&document.id).await?;

        let mut claimed = Vec::new();
        for field in self.schema.indexed_fields().filter(|f| f.unique) {
            let Some(value) = indexable_value(document, field) else {
                continue;
            };
            match self.indexes.claim(&self.name, field, &value, &document.id).await {
                Ok(true) => claimed.push((field, value)),
                Ok(false) => {}
                Err(e) => {
                    self.release(&claimed, &document.id).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .storage
            .write_as(&data_path(&self.name, &document.id), document)
            .await
        {
            self.release(&claimed, &document.id).await;
            return Err(e);
        }
        for (field, value) in &claimed {
            self.indexes.settle(&self.name, field, value, &document.id)?;
        }

        for field in self.schema.indexed_fields().filter(|f| !f.unique) {
            if let Some(value) = indexable_value(document, field) {
                self.indexes
                    .add(&self.name, field, &value, &document.id)
                    .await?;
            }
        }

        if let Some(previous) = previous {
            for field in self.schema.indexed_fields() {
                let Some(old) = indexable_value(&previous, field) else {
                    continue;
                };
                if indexable_value(document, field).as_ref() != Some(&old) {
                    self.indexes
                        .remove(&self.name, field, &old, &document.id)
                        .await?;
                }
            }
        }

        log::debug!("Wrote document {}/{}", self.name, document.id);
        self.events.emit(&Event::Write {
            collection: self.name.clone(),
            document: document.clone(),
        });
        Ok(())
    }

    async fn release(&self, claimed: &[(&FieldDescriptor, serde_yaml::Value)], id: &str) {
        for (field, value) in claimed {
            if let Err(e) = self.indexes.remove(&self.name, field, value, id).await {
                log::warn!(
                    "Failed to release index claim {}.{} for {id}: {e}",
                    self.name,
                    field.name
                );
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        validate_document_id(id)?;
        self.storage.read_as(&data_path(&self.name, id)).await
    }

    pub async fn find_one(&self, query: &Fields) -> Result<Option<Document>> {
        let result = self.search(query, Some(1)).await?.into_iter().next();
        self.events.emit(&Event::Query {
            collection: self.name.clone(),
            query: query.clone(),
            results: result.iter().cloned().collect(),
        });
        Ok(result)
    }

    pub async fn find_all(&self, query: &Fields) -> Result<Vec<Document>> {
        let results = self.search(query, None).await?;
        self.events.emit(&Event::Query {
            collection: self.name.clone(),
            query: query.clone(),
            results: results.clone(),
        });
        Ok(results)
    }

    async fn search(&self, query: &Fields, limit: Option<usize>) -> Result<Vec<Document>> {
        let mut results = Vec::new();
        for id in self.candidates(query).await? {
            let Some(document) = self.get(&id).await? else {
                continue;
            };
            if document.matches(query) {
                results.push(document);
                if limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Union of the index lookups of every indexed, non-null query field, in
    /// query order. Falls back to every id when no queried field is indexed.
    async fn candidates(&self, query: &Fields) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut used_index = false;

        for (name, value) in query {
            let Some(field) = self.schema.get(name).filter(|f| f.indexed) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            used_index = true;
            // No document can be indexed under a value that has no encoding
            let found = match self.indexes.lookup(&self.name, field, value).await {
                Ok(found) => found,
                Err(PlexDbError::NonCanonicalValue { .. }) => continue,
                Err(e) => return Err(e),
            };
            for id in found {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }

        if used_index {
            Ok(ids)
        } else {
            self.ids().await
        }
    }

    /// Remove a document and its index entries. The stored version decides
    /// which entries are dropped; deleting an absent document is a no-op
    /// apart from the event.
    pub async fn delete(&self, document: &Document) -> Result<()> {
        let stored = self.get(&document.id).await?;
        let current = stored.as_ref().unwrap_or(document);

        self.storage
            .remove(&data_path(&self.name, &document.id))
            .await?;
        for field in self.schema.indexed_fields() {
            if let Some(value) = indexable_value(current, field) {
                self.indexes
                    .remove(&self.name, field, &value, &document.id)
                    .await?;
            }
        }

        log::debug!("Deleted document {}/{}", self.name, document.id);
        self.events.emit(&Event::Delete {
            collection: self.name.clone(),
            document: current.clone(),
        });
        Ok(())
    }

    /// Run `task` over every document, one spawned task per document.
    ///
    /// Task `i` loads its document right away and waits `pacing * i` in
    /// parallel before invoking `task`, which spreads the callbacks out over
    /// time. Results come back in listing order; documents deleted between
    /// the listing and the load are skipped. `None` uses the configured
    /// pacing.
    pub async fn query_all<F, Fut, T>(&self, task: F, pacing: Option<Duration>) -> Result<Vec<T>>
    where
        F: Fn(Document) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let pacing = pacing.unwrap_or(self.pacing);
        let task = Arc::new(task);
        let ids = self.ids().await?;

        let mut handles = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            let collection = self.clone();
            let task = task.clone();
            let delay = pacing.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX));
            handles.push(tokio::spawn(async move {
                let (document, ()) =
                    tokio::join!(collection.get(&id), tokio::time::sleep(delay));
                match document {
                    Ok(Some(document)) => Ok(Some(task(document).await)),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                }
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            let outcome: Result<Option<T>> = handle
                .await
                .map_err(|e| PlexDbError::Task(e.to_string()))?;
            if let Some(value) = outcome? {
                results.push(value);
            }
        }
        Ok(results)
    }

    /// Decoded values recorded in the index of `field`
    pub async fn index_values(&self, field: &str) -> Result<Vec<serde_yaml::Value>> {
        if !self.schema.is_indexed(field) {
            return Err(PlexDbError::Schema(format!(
                "field '{field}' of '{}' is not indexed",
                self.name
            )));
        }
        self.indexes.values(&self.name, field).await
    }

    /// Document ids, sorted
    pub async fn ids(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list(&self.data_dir())
            .await?
            .unwrap_or_default())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.ids().await?.len())
    }

    /// Drop every index entry of the collection and rebuild them from the
    /// stored documents. Returns the number of documents indexed.
    pub async fn reindex(&self) -> Result<usize> {
        self.indexes.clear(&self.name).await?;
        self.ensure_layout().await?;

        let mut indexed = 0;
        for id in self.ids().await? {
            let Some(document) = self.get(&id).await? else {
                continue;
            };
            for field in self.schema.indexed_fields() {
                let Some(value) = indexable_value(&document, field) else {
                    continue;
                };
                if let Err(e) = self.indexes.add(&self.name, field, &value, &id).await {
                    log::warn!("Skipping index entry {}.{} for {id}: {e}", self.name, field.name);
                }
            }
            indexed += 1;
        }

        log::info!("Reindexed {indexed} documents in '{}'", self.name);
        Ok(indexed)
    }
}

/// Value a document contributes to a field index. Absent and null values
/// are not indexed.
fn indexable_value(document: &Document, field: &FieldDescriptor) -> Option<serde_yaml::Value> {
    document.value_of(&field.name).filter(|value| !value.is_null())
}
