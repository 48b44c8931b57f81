use crate::document::{Document, Fields};
use crate::error::{PlexDbError, Result};
use crate::schema::{Schema, ID_FIELD};

/// Assemble a document from create input in one ordered pass over the
/// schema descriptors.
///
/// - `id` always comes from the id producer; an `id` in the input is ignored.
/// - A declared field takes the input value when present and non-null.
/// - A required field without one falls back to its default (constants
///   cloned, producers invoked, async producers awaited), and is
///   `MissingRequiredField` if it has none. Optional fields stay absent.
/// - Input fields the schema does not declare are carried over as-is.
pub async fn prepare_document(collection: &str, schema: &Schema, input: &Fields) -> Result<Document> {
    let mut fields: Fields = input
        .iter()
        .filter(|(name, _)| name.as_str() != ID_FIELD && schema.get(name).is_none())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut id = None;

    for descriptor in schema.fields() {
        let missing = || PlexDbError::MissingRequiredField {
            collection: collection.to_string(),
            field: descriptor.name.clone(),
        };

        if descriptor.name == ID_FIELD {
            let value = descriptor.default.resolve().await.ok_or_else(missing)?;
            id = Some(id_from_value(&value)?);
            continue;
        }

        let provided = input
            .get(&descriptor.name)
            .filter(|value| !value.is_null())
            .cloned();
        let value = match provided {
            Some(value) => Some(value),
            None if descriptor.required => descriptor.default.resolve().await,
            None => None,
        };

        match value {
            Some(value) => {
                fields.insert(descriptor.name.clone(), value);
            }
            None if descriptor.required => return Err(missing()),
            None => {}
        }
    }

    let id = id.ok_or_else(|| PlexDbError::MissingRequiredField {
        collection: collection.to_string(),
        field: ID_FIELD.to_string(),
    })?;
    Ok(Document::new(id, fields))
}

fn id_from_value(value: &serde_yaml::Value) -> Result<String> {
    let id = match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => {
            return Err(PlexDbError::InvalidDocumentId(format!(
                "id producer returned {other:?}"
            )))
        }
    };
    validate_document_id(&id)?;
    Ok(id)
}

/// A document id is used verbatim as a file name
pub fn validate_document_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(PlexDbError::InvalidDocumentId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fields;
    use crate::schema::{AutoIdStrategy, FieldDescriptor};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_schema() -> Schema {
        Schema::new()
            .field(FieldDescriptor::new("name").required())
            .field(FieldDescriptor::new("role").default_value("member"))
            .field(FieldDescriptor::new("level").required().default_value(1))
            .field(FieldDescriptor::new("nickname"))
    }

    #[tokio::test]
    async fn test_valid_document() {
        let doc = prepare_document("users", &test_schema(), &fields([("name", "Alice")]))
            .await
            .unwrap();
        assert_eq!(doc.id.len(), 36);
        assert_eq!(
            doc.fields,
            fields([("name", serde_yaml::Value::from("Alice")), ("level", serde_yaml::Value::from(1))])
        );
    }

    #[tokio::test]
    async fn test_optional_default_is_not_applied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let schema = Schema::new()
            .field(FieldDescriptor::new("role").default_value("member"))
            .field(FieldDescriptor::new("stamp").default_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                serde_yaml::Value::from("now")
            }));

        let doc = prepare_document("users", &schema, &Fields::new()).await.unwrap();
        assert!(!doc.fields.contains_key("role"));
        assert!(!doc.fields.contains_key("stamp"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let input = fields([("role", serde_yaml::Value::Null)]);
        let doc = prepare_document("users", &schema, &input).await.unwrap();
        assert!(!doc.fields.contains_key("role"));
    }

    #[tokio::test]
    async fn test_missing_required_field() {
        let err = prepare_document("users", &test_schema(), &Fields::new())
            .await
            .unwrap_err();
        match err {
            PlexDbError::MissingRequiredField { collection, field } => {
                assert_eq!(collection, "users");
                assert_eq!(field, "name");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_null_counts_as_missing() {
        let input = fields([("name", serde_yaml::Value::Null)]);
        assert!(prepare_document("users", &test_schema(), &input).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_defaults_doesnt_overwrite() {
        let input = fields([("name", "Alice"), ("role", "admin")]);
        let doc = prepare_document("users", &test_schema(), &input).await.unwrap();
        assert_eq!(doc.fields["role"], serde_yaml::Value::from("admin"));
    }

    #[tokio::test]
    async fn test_input_id_is_ignored() {
        let input = fields([("name", "Alice"), ("id", "chosen")]);
        let doc = prepare_document("users", &test_schema(), &input).await.unwrap();
        assert_ne!(doc.id, "chosen");
        assert!(!doc.fields.contains_key("id"));
    }

    #[tokio::test]
    async fn test_additional_properties_kept() {
        let input = fields([("name", "Alice"), ("extra", "data")]);
        let doc = prepare_document("users", &test_schema(), &input).await.unwrap();
        assert_eq!(doc.fields["extra"], serde_yaml::Value::from("data"));
    }

    #[tokio::test]
    async fn test_producers_run_once_per_create() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let schema = Schema::new()
            .with_id_strategy(AutoIdStrategy::Ulid)
            .field(FieldDescriptor::new("seq").required().default_with(move || {
                serde_yaml::Value::from(counter.fetch_add(1, Ordering::SeqCst) as u64)
            }))
            .field(
                FieldDescriptor::new("token")
                    .required()
                    .default_with_async(|| async { serde_yaml::Value::from("async") }),
            );

        let first = prepare_document("c", &schema, &Fields::new()).await.unwrap();
        let second = prepare_document("c", &schema, &Fields::new()).await.unwrap();
        assert_eq!(first.fields["seq"], serde_yaml::Value::from(0u64));
        assert_eq!(second.fields["seq"], serde_yaml::Value::from(1u64));
        assert_eq!(first.fields["token"], serde_yaml::Value::from("async"));
        assert_eq!(first.id.len(), 26);
        assert_ne!(first.id, second.id);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_validate_document_id() {
        assert!(validate_document_id("abc-123").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "../x"] {
            assert!(validate_document_id(bad).is_err(), "{bad:?}");
        }
    }
}
