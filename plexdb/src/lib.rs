pub mod collection;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod events;
pub mod index;
pub mod metadata;
pub mod schema;
pub mod storage;
pub mod tasks;
pub mod validation;

pub use collection::Collection;
pub use config::DatabaseConfig;
pub use database::Database;
pub use document::{Document, Fields};
pub use error::{PlexDbError, Result};
pub use events::{Event, EventKind, SubscriptionId};
pub use schema::{FieldDescriptor, Schema, SchemaDefinition};
