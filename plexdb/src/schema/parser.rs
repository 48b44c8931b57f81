use super::types::SchemaDefinition;
use crate::error::Result;
use std::path::Path;

/// Conventional schema file name inside a database root
pub const SCHEMA_FILE: &str = "schema.yaml";

/// Parse a schema.yaml file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AutoIdStrategy, DefaultValue, Generator};
    use crate::schema::types::DefaultDefinition;

    const SCHEMA: &str = r#"
collections:
  user:
    id: { auto: ulid }
    fields:
      username: { required: true, unique: true, indexed: true, default: { generate: nanoid } }
      role: { indexed: true, default: member }
      bio: {}
  event:
    fields:
      kind: { indexed: true }
      at: { default: { generate: now } }
"#;

    #[test]
    fn test_parse_collections() {
        let def = parse_schema_str(SCHEMA).unwrap();
        assert_eq!(def.collections.len(), 2);

        let user = &def.collections["user"];
        assert_eq!(user.id.as_ref().and_then(|i| i.auto), Some(AutoIdStrategy::Ulid));
        assert!(matches!(
            user.fields["username"].default,
            Some(DefaultDefinition::Generate { generate: Generator::Nanoid })
        ));
        assert!(matches!(
            user.fields["role"].default,
            Some(DefaultDefinition::Constant(serde_yaml::Value::String(ref s))) if s == "member"
        ));
        assert!(user.fields["bio"].default.is_none());
    }

    #[test]
    fn test_to_schema() {
        let def = parse_schema_str(SCHEMA).unwrap();
        let schema = def.collections["user"].to_schema().unwrap();

        assert_eq!(schema.id_strategy(), AutoIdStrategy::Ulid);
        let names: Vec<_> = schema.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "bio", "role", "username"]);

        let username = schema.get("username").unwrap();
        assert!(username.required && username.unique && username.indexed);
        assert!(matches!(username.default, DefaultValue::Producer(_)));

        let event = def.collections["event"].to_schema().unwrap();
        assert_eq!(event.id_strategy(), AutoIdStrategy::Uuid);
    }

    #[test]
    fn test_invalid_field_name() {
        let def = parse_schema_str("collections:\n  c:\n    fields:\n      'a/b': {}\n").unwrap();
        assert!(def.collections["c"].to_schema().is_err());
    }

    #[test]
    fn test_parse_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(SCHEMA_FILE);
        std::fs::write(&path, SCHEMA).unwrap();
        assert_eq!(parse_schema(&path).unwrap().collections.len(), 2);
    }
}
