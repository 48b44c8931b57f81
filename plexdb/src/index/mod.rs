// Secondary indexes - one storage entry per (collection, field, value)

pub mod encoding;
mod locks;

pub use encoding::{canonical_form, decode, encode};
pub use locks::KeyedLocks;

use crate::error::{PlexDbError, Result};
use crate::schema::FieldDescriptor;
use crate::storage::{data_path, StorageEngine, INDEX_DIR};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Maintains unique and non-unique secondary indexes on top of the storage
/// engine. A unique entry holds a single document id, a non-unique entry an
/// ordered list of ids.
///
/// Every `add`/`remove` holds the keyed lock of the entry it touches, so
/// concurrent writers of the same field value are serialized.
///
/// Unique entries taken with `claim` stay pending until `settle`: the
/// owner's data file is not written yet, but the entry is still live.
pub struct IndexManager {
    storage: Arc<StorageEngine>,
    locks: KeyedLocks,
    /// (entry path, id) of unique claims whose data write is in flight
    pending: Mutex<HashSet<(String, String)>>,
}

impl IndexManager {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        IndexManager {
            storage,
            locks: KeyedLocks::new(),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// `index/<collection>/<field>`
    pub fn field_dir(collection: &str, field: &str) -> String {
        format!("{INDEX_DIR}/{collection}/{field}")
    }

    /// `index/<collection>/<field>/<encode(value)>`
    pub fn entry_path(collection: &str, field: &str, value: &serde_yaml::Value) -> Result<String> {
        Ok(format!(
            "{}/{}",
            Self::field_dir(collection, field),
            encode(field, value)?
        ))
    }

    /// Ids referenced by the entry for `value` (empty when there is none).
    pub async fn lookup(
        &self,
        collection: &str,
        field: &FieldDescriptor,
        value: &serde_yaml::Value,
    ) -> Result<Vec<String>> {
        let path = Self::entry_path(collection, &field.name, value)?;
        self.read_ids(&path).await
    }

    /// Record that document `id` carries `value`. Returns `false` when the
    /// entry already referenced `id`.
    ///
    /// A unique entry owned by another document that still exists, or whose
    /// claim is still pending, fails with `UniqueConstraintViolation`; an
    /// owner whose document is gone is taken over.
    pub async fn add(
        &self,
        collection: &str,
        field: &FieldDescriptor,
        value: &serde_yaml::Value,
        id: &str,
    ) -> Result<bool> {
        self.insert(collection, field, value, id, false).await
    }

    /// `add` for a document whose data file is about to be written. A new
    /// unique entry stays pending until `settle` or `remove`.
    pub async fn claim(
        &self,
        collection: &str,
        field: &FieldDescriptor,
        value: &serde_yaml::Value,
        id: &str,
    ) -> Result<bool> {
        self.insert(collection, field, value, id, true).await
    }

    /// Mark a claim as backed by its data file
    pub fn settle(
        &self,
        collection: &str,
        field: &FieldDescriptor,
        value: &serde_yaml::Value,
        id: &str,
    ) -> Result<()> {
        let path = Self::entry_path(collection, &field.name, value)?;
        self.pending.lock().remove(&(path, id.to_string()));
        Ok(())
    }

    async fn insert(
        &self,
        collection: &str,
        field: &FieldDescriptor,
        value: &serde_yaml::Value,
        id: &str,
        pending: bool,
    ) -> Result<bool> {
        let path = Self::entry_path(collection, &field.name, value)?;
        let _guard = self.locks.lock(&path).await;
        let mut ids = self.read_ids(&path).await?;

        if ids.iter().any(|existing| existing == id) {
            return Ok(false);
        }

        if field.unique {
            for owner in &ids {
                let in_flight = self.pending.lock().contains(&(path.clone(), owner.clone()));
                if in_flight || self.storage.exists(&data_path(collection, owner)).await? {
                    return Err(PlexDbError::UniqueConstraintViolation {
                        collection: collection.to_string(),
                        field: field.name.clone(),
                        value: describe(value),
                    });
                }
                log::warn!(
                    "Index {path} pointed at missing document {collection}/{owner}, reclaiming"
                );
            }
            self.storage
                .write(&path, &serde_yaml::Value::String(id.to_string()))
                .await?;
            let mut claims = self.pending.lock();
            for owner in &ids {
                claims.remove(&(path.clone(), owner.clone()));
            }
            if pending {
                claims.insert((path, id.to_string()));
            }
        } else {
            ids.push(id.to_string());
            self.storage.write_as(&path, &ids).await?;
        }
        Ok(true)
    }

    /// Drop document `id` from the entry for `value`. Other ids sharing a
    /// non-unique entry stay; the entry is deleted once it is empty.
    pub async fn remove(
        &self,
        collection: &str,
        field: &FieldDescriptor,
        value: &serde_yaml::Value,
        id: &str,
    ) -> Result<()> {
        let path = Self::entry_path(collection, &field.name, value)?;
        let _guard = self.locks.lock(&path).await;
        self.pending.lock().remove(&(path.clone(), id.to_string()));
        let mut ids = self.read_ids(&path).await?;

        let before = ids.len();
        ids.retain(|existing| existing != id);
        if ids.len() == before {
            return Ok(());
        }

        if ids.is_empty() {
            self.storage.remove(&path).await
        } else {
            self.storage.write_as(&path, &ids).await
        }
    }

    /// Decoded values of every entry of one field index
    pub async fn values(&self, collection: &str, field: &str) -> Result<Vec<serde_yaml::Value>> {
        let root = Self::field_dir(collection, field);
        let mut pending = vec![String::new()];
        let mut values = Vec::new();

        while let Some(prefix) = pending.pop() {
            let dir = if prefix.is_empty() {
                root.clone()
            } else {
                format!("{root}/{prefix}")
            };
            let Some(names) = self.storage.list(&dir).await? else {
                continue;
            };
            for name in names {
                let encoded = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                if name.ends_with('~') {
                    pending.push(encoded);
                } else {
                    values.push(decode(&encoded)?);
                }
            }
        }
        Ok(values)
    }

    /// Drop every index entry of a collection
    pub async fn clear(&self, collection: &str) -> Result<()> {
        let dir = format!("{INDEX_DIR}/{collection}/");
        self.pending.lock().retain(|(path, _)| !path.starts_with(&dir));
        self.storage
            .remove(&format!("{INDEX_DIR}/{collection}"))
            .await
    }

    async fn read_ids(&self, path: &str) -> Result<Vec<String>> {
        let ids = match self.storage.read(path).await? {
            None | Some(serde_yaml::Value::Null) => Vec::new(),
            Some(serde_yaml::Value::String(id)) => vec![id],
            Some(other) => serde_yaml::from_value(other)?,
        };
        Ok(ids)
    }
}

/// Short human form of a value for error messages
pub(crate) fn describe(value: &serde_yaml::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}
