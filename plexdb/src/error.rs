use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlexDbError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Database already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Not a database (no metadata file): {}", .0.display())]
    NotADatabase(PathBuf),

    #[error("Path escapes the database root: {path}")]
    PathEscape { path: String },

    #[error("Missing required field '{field}' in collection '{collection}'")]
    MissingRequiredField { collection: String, field: String },

    #[error("Unique constraint violated: {collection}.{field} = {value}")]
    UniqueConstraintViolation {
        collection: String,
        field: String,
        value: String,
    },

    #[error("Value of field '{field}' cannot be indexed: {reason}")]
    NonCanonicalValue { field: String, reason: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database is closed")]
    Closed,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, PlexDbError>;
