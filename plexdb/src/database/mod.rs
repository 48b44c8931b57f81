use crate::collection::Collection;
use crate::config::{CacheConfig, DatabaseConfig};
use crate::error::{PlexDbError, Result};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::index::IndexManager;
use crate::metadata::{Metadata, MetadataStore, METADATA_FILE};
use crate::schema::{validate_name, Schema};
use crate::storage::{StorageEngine, DATA_DIR, INDEX_DIR};
use crate::tasks::BackgroundTasks;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// An open database instance. Owns the storage engine, the index manager,
/// the event bus, the metadata store and the two background timers (cache
/// eviction and metadata autosave), which run from `open` until `close`.
pub struct Database {
    config: DatabaseConfig,
    storage: Arc<StorageEngine>,
    indexes: Arc<IndexManager>,
    events: Arc<EventBus>,
    metadata: Arc<MetadataStore>,
    tasks: BackgroundTasks,
    collections: RwLock<HashMap<String, Collection>>,
    closed: AtomicBool,
}

impl Database {
    /// Bootstrap a new database at `path`: the root directory, an empty
    /// `.plexmeta`, and the `index/` and `data/` sub-trees.
    pub async fn create_new(path: impl AsRef<Path>, name: &str) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PlexDbError::InvalidPath("database path is empty".into()));
        }

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let parent_is_dir = tokio::fs::metadata(&parent)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !parent_is_dir {
            return Err(PlexDbError::NotADirectory(parent));
        }

        match tokio::fs::metadata(path).await {
            Ok(m) if !m.is_dir() => return Err(PlexDbError::NotADirectory(path.to_path_buf())),
            Ok(_) => {
                if tokio::fs::try_exists(path.join(METADATA_FILE)).await? {
                    return Err(PlexDbError::AlreadyExists(path.to_path_buf()));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir(path).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let storage = StorageEngine::open(path, &CacheConfig::default()).await?;
        storage.write_as(METADATA_FILE, &Metadata::new(name)).await?;
        storage.make_directory(INDEX_DIR).await?;
        storage.make_directory(DATA_DIR).await?;

        log::info!("Created database '{name}' at {}", storage.root().display());
        Ok(())
    }

    /// Open a database, reading `plexdb.yaml` from its root when present.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = DatabaseConfig::discover(path.as_ref())?;
        Self::open_with_config(path, config).await
    }

    pub async fn open_with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        let storage = match StorageEngine::open(path, &config.cache).await {
            Ok(storage) => Arc::new(storage),
            Err(PlexDbError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(PlexDbError::NotADatabase(path.to_path_buf()))
            }
            Err(e) => return Err(e),
        };
        let metadata = MetadataStore::load(storage.clone())
            .await?
            .ok_or_else(|| PlexDbError::NotADatabase(storage.root().to_path_buf()))?;
        let metadata = Arc::new(metadata);

        let tasks = BackgroundTasks::new();
        let cache = storage.cache().clone();
        tasks.spawn_periodic("cache-eviction", config.cache.check_interval(), move || {
            let cache = cache.clone();
            async move {
                cache.evict_if_needed();
                Ok(())
            }
        });
        let autosave = metadata.clone();
        tasks.spawn_periodic("metadata-autosave", config.autosave_interval(), move || {
            let autosave = autosave.clone();
            async move { autosave.save_if_dirty().await.map(|_| ()) }
        });

        log::info!(
            "Opened database '{}' at {}",
            metadata.name(),
            storage.root().display()
        );
        Ok(Database {
            indexes: Arc::new(IndexManager::new(storage.clone())),
            events: Arc::new(EventBus::new()),
            config,
            storage,
            metadata,
            tasks,
            collections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> String {
        self.metadata.name()
    }

    /// Canonical root directory
    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Register a collection on first use and return its handle. Later
    /// calls with the same name return the registered handle; the schema
    /// of the first registration stays in effect.
    pub async fn collection(&self, name: &str, schema: Schema) -> Result<Collection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlexDbError::Closed);
        }
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(existing.clone());
        }

        validate_name(name)?;
        schema.validate()?;

        let collection = Collection::new(
            name,
            Arc::new(schema),
            self.storage.clone(),
            self.indexes.clone(),
            self.events.clone(),
            self.config.query_pacing(),
        );
        collection.ensure_layout().await?;
        if self.metadata.register(name, collection.schema()) {
            log::info!("Registered collection '{name}'");
        }

        let mut collections = self.collections.write();
        Ok(collections
            .entry(name.to_string())
            .or_insert(collection)
            .clone())
    }

    /// Handle of a collection registered in this session
    pub fn get_collection(&self, name: &str) -> Option<Collection> {
        self.collections.read().get(name).cloned()
    }

    /// Every collection the database knows about, in registration order
    pub fn collections(&self) -> Vec<String> {
        self.metadata.snapshot().collections
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.snapshot()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(subscriber)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<Event>) {
        self.events.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Summary of the database: collections with document counts and
    /// index definitions, plus cache residency.
    pub async fn status(&self) -> Result<serde_json::Value> {
        let metadata = self.metadata.snapshot();
        let mut collections = serde_json::Map::new();

        for name in &metadata.collections {
            let count = self
                .storage
                .list(&format!("{DATA_DIR}/{name}"))
                .await?
                .map(|ids| ids.len())
                .unwrap_or(0);
            let indexes = metadata.indexes.get(name).cloned().unwrap_or_default();
            collections.insert(
                name.clone(),
                serde_json::json!({ "count": count, "indexes": indexes }),
            );
        }

        let cache = self.storage.cache();
        Ok(serde_json::json!({
            "name": metadata.name,
            "root": self.root().display().to_string(),
            "collections": collections,
            "cache": {
                "resident": cache.len(),
                "high_water_mark": cache.high_water_mark(),
            },
            "saved_at": metadata.saved_at,
        }))
    }

    /// Stop the background timers, save the metadata and emit `Close`.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.tasks.shutdown().await?;
        self.metadata.save().await?;

        let name = self.metadata.name();
        log::info!("Closed database '{name}'");
        self.events.emit(&Event::Close { database: name });
        Ok(())
    }
}
