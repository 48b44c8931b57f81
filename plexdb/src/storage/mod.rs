// Storage engine - path-confined YAML values under the database root

mod cache;

pub use cache::Cache;

use crate::config::CacheConfig;
use crate::error::{PlexDbError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Sub-tree holding one file per document: `data/<collection>/<id>`
pub const DATA_DIR: &str = "data";
/// Sub-tree holding index entries: `index/<collection>/<field>/<encoded>`
pub const INDEX_DIR: &str = "index";

pub fn data_path(collection: &str, id: &str) -> String {
    format!("{DATA_DIR}/{collection}/{id}")
}

/// Durable key/value layer keyed by logical paths (`data/user/<id>`,
/// `index/user/name/<hex>`, ...). Every logical path is confined to the
/// database root. Reads and writes go through a shared bounded cache keyed
/// by the normalized logical path.
pub struct StorageEngine {
    root: PathBuf,
    cache: Arc<Cache>,
}

impl StorageEngine {
    /// Open the engine over an existing root directory.
    pub async fn open(root: &Path, cache: &CacheConfig) -> Result<Self> {
        let root = tokio::fs::canonicalize(root).await?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(PlexDbError::NotADirectory(root));
        }
        Ok(StorageEngine {
            root,
            cache: Arc::new(Cache::new(cache)),
        })
    }

    /// Canonical database root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Resolve a logical path to an absolute path under the root.
    pub async fn resolve(&self, logical_path: &str) -> Result<PathBuf> {
        let key = normalize(logical_path)?;
        self.resolve_key(&key).await
    }

    /// Read the value stored at a logical path, `None` if nothing is there.
    /// The path is confined before the cache is consulted.
    pub async fn read(&self, logical_path: &str) -> Result<Option<serde_yaml::Value>> {
        let key = normalize(logical_path)?;
        let path = self.resolve_key(&key).await?;
        if let Some(value) = self.cache.get(&key) {
            return Ok(Some(value));
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: serde_yaml::Value = serde_yaml::from_str(&content)?;
        self.cache.insert(&key, value.clone());
        Ok(Some(value))
    }

    /// Persist a value at a logical path, creating parent directories.
    pub async fn write(&self, logical_path: &str, value: &serde_yaml::Value) -> Result<()> {
        let key = normalize(logical_path)?;
        if key.is_empty() {
            return Err(PlexDbError::InvalidPath(
                "cannot write to the database root".into(),
            ));
        }

        let path = self.resolve_key(&key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_yaml::to_string(value)?;
        tokio::fs::write(&path, content).await?;
        self.cache.insert(&key, value.clone());
        Ok(())
    }

    pub async fn read_as<T: DeserializeOwned>(&self, logical_path: &str) -> Result<Option<T>> {
        match self.read(logical_path).await? {
            Some(value) => Ok(Some(serde_yaml::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn write_as<T: Serialize>(&self, logical_path: &str, value: &T) -> Result<()> {
        let value = serde_yaml::to_value(value)?;
        self.write(logical_path, &value).await
    }

    pub async fn exists(&self, logical_path: &str) -> Result<bool> {
        let key = normalize(logical_path)?;
        let path = self.resolve_key(&key).await?;
        if self.cache.get(&key).is_some() {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Sorted child names of a directory, `None` if it does not exist.
    pub async fn list(&self, logical_path: &str) -> Result<Option<Vec<String>>> {
        let path = self.resolve(logical_path).await?;
        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                    return Ok(None);
                }
                return Err(e.into());
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(Some(names))
    }

    /// Remove a file or a whole directory. Removing nothing is not an error.
    pub async fn remove(&self, logical_path: &str) -> Result<()> {
        let key = normalize(logical_path)?;
        if key.is_empty() {
            return Err(PlexDbError::InvalidPath(
                "cannot remove the database root".into(),
            ));
        }

        let path = self.resolve_key(&key).await?;
        self.cache.remove_prefix(&key);

        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn make_directory(&self, logical_path: &str) -> Result<()> {
        let path = self.resolve(logical_path).await?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Join a normalized key under the root and confirm that the deepest
    /// existing ancestor canonicalizes to somewhere inside the root (this
    /// catches symlinks pointing outside).
    async fn resolve_key(&self, key: &str) -> Result<PathBuf> {
        let joined = if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        };

        let mut existing = joined.as_path();
        let mut missing = Vec::new();
        loop {
            match tokio::fs::symlink_metadata(existing).await {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let (Some(name), Some(parent)) = (existing.file_name(), existing.parent())
                    else {
                        return Err(PlexDbError::PathEscape { path: key.to_string() });
                    };
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut resolved = tokio::fs::canonicalize(existing).await?;
        if !resolved.starts_with(&self.root) {
            return Err(PlexDbError::PathEscape { path: key.to_string() });
        }
        for name in missing.iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }
}

/// Lexically normalize a logical path into a `/`-joined key relative to the
/// root. `..` may not climb above the root and absolute paths are rejected.
pub fn normalize(logical_path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(logical_path).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    PlexDbError::InvalidPath(format!("non UTF-8 path: {logical_path}"))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PlexDbError::PathEscape {
                        path: logical_path.to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PlexDbError::PathEscape {
                    path: logical_path.to_string(),
                });
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_yaml::Value;
    use tempfile::TempDir;

    async fn setup_engine() -> (TempDir, StorageEngine) {
        let tmp = TempDir::new().unwrap();
        let engine = StorageEngine::open(tmp.path(), &CacheConfig::default())
            .await
            .unwrap();
        (tmp, engine)
    }

    fn is_escape<T: std::fmt::Debug>(result: Result<T>) -> bool {
        matches!(result, Err(PlexDbError::PathEscape { .. }))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("data/user/abc").unwrap(), "data/user/abc");
        assert_eq!(normalize("./data//user/../user/abc").unwrap(), "data/user/abc");
        assert_eq!(normalize("").unwrap(), "");
        assert!(matches!(normalize("../x"), Err(PlexDbError::PathEscape { .. })));
        assert!(matches!(normalize("data/../../x"), Err(PlexDbError::PathEscape { .. })));
        assert!(matches!(normalize("/etc/passwd"), Err(PlexDbError::PathEscape { .. })));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (tmp, engine) = setup_engine().await;
        let value: Value = serde_yaml::from_str("id: abc\nname: Alice").unwrap();

        engine.write("data/user/abc", &value).await.unwrap();
        assert!(tmp.path().join("data/user/abc").is_file());
        assert_eq!(engine.read("data/user/abc").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let (_tmp, engine) = setup_engine().await;
        assert_eq!(engine.read("data/user/nope").await.unwrap(), None);
        assert!(!engine.exists("data/user/nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_populates_cache() {
        let (tmp, engine) = setup_engine().await;
        std::fs::create_dir_all(tmp.path().join("data")).unwrap();
        std::fs::write(tmp.path().join("data/x"), "hello").unwrap();

        assert!(engine.cache().is_empty());
        assert_eq!(
            engine.read("data/x").await.unwrap(),
            Some(Value::from("hello"))
        );
        assert_eq!(engine.cache().len(), 1);

        // Served from the cache now, not from disk
        std::fs::write(tmp.path().join("data/x"), "changed").unwrap();
        assert_eq!(
            engine.read("./data/x").await.unwrap(),
            Some(Value::from("hello"))
        );
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let (_tmp, engine) = setup_engine().await;
        let ids = vec!["a".to_string(), "b".to_string()];
        engine.write_as("index/user/role/x", &ids).await.unwrap();
        let back: Option<Vec<String>> = engine.read_as("index/user/role/x").await.unwrap();
        assert_eq!(back, Some(ids));
    }

    #[tokio::test]
    async fn test_list_exists_make_directory() {
        let (_tmp, engine) = setup_engine().await;
        assert_eq!(engine.list("data/user").await.unwrap(), None);

        engine.make_directory("data/user").await.unwrap();
        engine.make_directory("data/user").await.unwrap();
        assert_eq!(engine.list("data/user").await.unwrap(), Some(vec![]));
        assert!(engine.exists("data/user").await.unwrap());

        engine.write("data/user/b", &Value::from(2)).await.unwrap();
        engine.write("data/user/a", &Value::from(1)).await.unwrap();
        assert_eq!(
            engine.list("data/user").await.unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(engine.list("data/user/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_tmp, engine) = setup_engine().await;
        engine.write("data/user/a", &Value::from(1)).await.unwrap();

        engine.remove("data/user/a").await.unwrap();
        engine.remove("data/user/a").await.unwrap();
        assert_eq!(engine.read("data/user/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_directory_drops_cached_children() {
        let (tmp, engine) = setup_engine().await;
        engine.write("index/user/name/aa", &Value::from("1")).await.unwrap();
        engine.write("index/user/name/bb", &Value::from("2")).await.unwrap();
        assert_eq!(engine.cache().len(), 2);

        engine.remove("index/user").await.unwrap();
        assert!(engine.cache().is_empty());
        assert!(!tmp.path().join("index/user").exists());
        assert_eq!(engine.read("index/user/name/aa").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_root_cannot_be_removed_or_written() {
        let (_tmp, engine) = setup_engine().await;
        assert!(matches!(
            engine.remove("").await,
            Err(PlexDbError::InvalidPath(_))
        ));
        assert!(matches!(
            engine.write(".", &Value::Null).await,
            Err(PlexDbError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_path_escape_for_every_operation() {
        let (_tmp, engine) = setup_engine().await;
        for path in ["../outside", "data/../../outside", "/etc/passwd"] {
            assert!(is_escape(engine.resolve(path).await), "resolve {path}");
            assert!(is_escape(engine.read(path).await), "read {path}");
            assert!(is_escape(engine.write(path, &Value::Null).await), "write {path}");
            assert!(is_escape(engine.exists(path).await), "exists {path}");
            assert!(is_escape(engine.list(path).await), "list {path}");
            assert!(is_escape(engine.remove(path).await), "remove {path}");
            assert!(is_escape(engine.make_directory(path).await), "mkdir {path}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape() {
        let (tmp, engine) = setup_engine().await;
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();

        assert!(is_escape(engine.read("link/secret").await));
        assert!(is_escape(engine.write("link/secret", &Value::Null).await));
        assert!(!outside.path().join("secret").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cached_entry_behind_swapped_symlink() {
        let (tmp, engine) = setup_engine().await;
        engine.write("shelf/item", &Value::from("kept")).await.unwrap();
        assert_eq!(engine.read("shelf/item").await.unwrap(), Some(Value::from("kept")));

        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("item"), "other").unwrap();
        std::fs::remove_dir_all(tmp.path().join("shelf")).unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("shelf")).unwrap();

        assert!(is_escape(engine.read("shelf/item").await));
        assert!(is_escape(engine.exists("shelf/item").await));
    }
}
