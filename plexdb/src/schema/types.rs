use crate::error::{PlexDbError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type ProducerFn = Arc<dyn Fn() -> serde_yaml::Value + Send + Sync>;
pub type AsyncProducerFn = Arc<dyn Fn() -> BoxFuture<serde_yaml::Value> + Send + Sync>;

/// Name of the implicit primary key present in every schema
pub const ID_FIELD: &str = "id";

/// How a missing field value is filled in at create time
#[derive(Clone, Default)]
pub enum DefaultValue {
    #[default]
    None,
    Constant(serde_yaml::Value),
    Producer(ProducerFn),
    AsyncProducer(AsyncProducerFn),
}

impl DefaultValue {
    pub fn is_configured(&self) -> bool {
        !matches!(self, DefaultValue::None)
    }

    /// Produce the default value, awaiting async producers.
    pub async fn resolve(&self) -> Option<serde_yaml::Value> {
        match self {
            DefaultValue::None => None,
            DefaultValue::Constant(value) => Some(value.clone()),
            DefaultValue::Producer(produce) => Some(produce()),
            DefaultValue::AsyncProducer(produce) => Some(produce().await),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::None => f.write_str("None"),
            DefaultValue::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            DefaultValue::Producer(_) => f.write_str("Producer(..)"),
            DefaultValue::AsyncProducer(_) => f.write_str("AsyncProducer(..)"),
        }
    }
}

/// Descriptor of a single schema field
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub indexed: bool,
    pub unique: bool,
    pub required: bool,
    pub default: DefaultValue,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        FieldDescriptor {
            name: name.into(),
            indexed: false,
            unique: false,
            required: false,
            default: DefaultValue::None,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<serde_yaml::Value>) -> Self {
        self.default = DefaultValue::Constant(value.into());
        self
    }

    pub fn default_with<F>(mut self, produce: F) -> Self
    where
        F: Fn() -> serde_yaml::Value + Send + Sync + 'static,
    {
        self.default = DefaultValue::Producer(Arc::new(produce));
        self
    }

    pub fn default_with_async<F, Fut>(mut self, produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = serde_yaml::Value> + Send + 'static,
    {
        self.default = DefaultValue::AsyncProducer(Arc::new(move || Box::pin(produce())));
        self
    }
}

/// Strategy used to generate document ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    #[default]
    Uuid,
    Ulid,
    Nanoid,
}

impl AutoIdStrategy {
    pub fn generate(&self) -> String {
        match self {
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            AutoIdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Ordered list of field descriptors. The `id` descriptor always comes
/// first; it is indexed, unique, required and defaulted to a fresh id.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
    id_strategy: AutoIdStrategy,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Self {
        Schema {
            fields: vec![id_descriptor(AutoIdStrategy::default())],
            id_strategy: AutoIdStrategy::default(),
        }
    }

    pub fn with_id_strategy(mut self, strategy: AutoIdStrategy) -> Self {
        self.id_strategy = strategy;
        self.fields[0] = id_descriptor(strategy);
        self
    }

    /// Append a field. Order of insertion is the order of the create pass.
    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }

    pub fn id_strategy(&self) -> AutoIdStrategy {
        self.id_strategy
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_indexed(&self, name: &str) -> bool {
        self.get(name).map(|f| f.indexed).unwrap_or(false)
    }

    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.indexed)
    }

    pub fn index_definitions(&self) -> Vec<IndexDefinition> {
        self.indexed_fields()
            .map(|f| IndexDefinition {
                field: f.name.clone(),
                unique: f.unique,
            })
            .collect()
    }

    /// Check field names: path-safe, no duplicates, `id` not redefined.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (position, field) in self.fields.iter().enumerate() {
            validate_name(&field.name)?;
            if field.name == ID_FIELD && position != 0 {
                return Err(PlexDbError::Schema(
                    "the 'id' field is implicit and cannot be redefined".into(),
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(PlexDbError::Schema(format!(
                    "field '{}' is declared twice",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

fn id_descriptor(strategy: AutoIdStrategy) -> FieldDescriptor {
    FieldDescriptor::new(ID_FIELD)
        .indexed()
        .unique()
        .required()
        .default_with(move || serde_yaml::Value::String(strategy.generate()))
}

/// Collection and field names end up as path segments
pub fn validate_name(name: &str) -> Result<()> {
    static NAME: OnceLock<Regex> = OnceLock::new();
    let re = NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid name regex"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(PlexDbError::InvalidName(format!(
            "'{name}' (allowed: letters, digits, '_' and '-')"
        )))
    }
}

/// An index recorded in the database metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub field: String,
    #[serde(default)]
    pub unique: bool,
}

// ── schema.yaml ────────────────────────────────────────────────

/// Top-level schema file: collection name -> definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionDefinition {
    #[serde(default)]
    pub id: Option<IdConfig>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdConfig {
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<DefaultDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultDefinition {
    Generate { generate: Generator },
    Constant(serde_yaml::Value),
}

/// Built-in value producers available from schema.yaml
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generator {
    Uuid,
    Ulid,
    Nanoid,
    Now,
}

impl Generator {
    pub fn produce(&self) -> serde_yaml::Value {
        let s = match self {
            Generator::Uuid => AutoIdStrategy::Uuid.generate(),
            Generator::Ulid => AutoIdStrategy::Ulid.generate(),
            Generator::Nanoid => AutoIdStrategy::Nanoid.generate(),
            Generator::Now => chrono::Utc::now().to_rfc3339(),
        };
        serde_yaml::Value::String(s)
    }
}

impl CollectionDefinition {
    /// Build the runtime schema. Fields follow the (sorted) order of the
    /// definition map.
    pub fn to_schema(&self) -> Result<Schema> {
        let strategy = self
            .id
            .as_ref()
            .and_then(|id| id.auto)
            .unwrap_or_default();
        let mut schema = Schema::new().with_id_strategy(strategy);

        for (name, def) in &self.fields {
            let mut descriptor = FieldDescriptor::new(name.clone());
            descriptor.indexed = def.indexed;
            descriptor.unique = def.unique;
            descriptor.required = def.required;
            descriptor.default = match &def.default {
                None => DefaultValue::None,
                Some(DefaultDefinition::Constant(value)) => DefaultValue::Constant(value.clone()),
                Some(DefaultDefinition::Generate { generate }) => {
                    let generator = *generate;
                    DefaultValue::Producer(Arc::new(move || generator.produce()))
                }
            };
            schema = schema.field(descriptor);
        }

        schema.validate()?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_starts_with_id() {
        let schema = Schema::new().field(FieldDescriptor::new("name").indexed());
        let id = &schema.fields()[0];
        assert_eq!(id.name, ID_FIELD);
        assert!(id.indexed && id.unique && id.required);
        assert!(id.default.is_configured());
        assert!(schema.is_indexed("name"));
        assert!(!schema.is_indexed("missing"));
        assert_eq!(
            schema.index_definitions(),
            vec![
                IndexDefinition { field: "id".into(), unique: true },
                IndexDefinition { field: "name".into(), unique: false },
            ]
        );
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let schema = Schema::new().field(FieldDescriptor::new("../etc"));
        assert!(matches!(schema.validate(), Err(PlexDbError::InvalidName(_))));

        let schema = Schema::new().field(FieldDescriptor::new("id"));
        assert!(matches!(schema.validate(), Err(PlexDbError::Schema(_))));

        let schema = Schema::new()
            .field(FieldDescriptor::new("a"))
            .field(FieldDescriptor::new("a"));
        assert!(matches!(schema.validate(), Err(PlexDbError::Schema(_))));
    }

    #[test]
    fn test_id_strategies() {
        let ulid = AutoIdStrategy::Ulid.generate();
        assert_eq!(ulid.len(), 26);
        assert_eq!(ulid, ulid.to_lowercase());
        assert_eq!(AutoIdStrategy::Uuid.generate().len(), 36);
        assert_eq!(AutoIdStrategy::Nanoid.generate().len(), 21);
        assert_ne!(AutoIdStrategy::Uuid.generate(), AutoIdStrategy::Uuid.generate());
    }

    #[tokio::test]
    async fn test_default_value_resolution() {
        assert_eq!(DefaultValue::None.resolve().await, None);
        assert_eq!(
            DefaultValue::Constant("member".into()).resolve().await,
            Some("member".into())
        );

        let field = FieldDescriptor::new("n").default_with(|| serde_yaml::Value::from(7));
        assert_eq!(field.default.resolve().await, Some(7.into()));

        let field = FieldDescriptor::new("n").default_with_async(|| async {
            tokio::task::yield_now().await;
            serde_yaml::Value::from("later")
        });
        assert_eq!(field.default.resolve().await, Some("later".into()));
    }
}
