// Document model - an id plus schema fields, stored as a YAML mapping

use crate::schema::ID_FIELD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field name -> value. Used for document bodies, create input and queries.
pub type Fields = BTreeMap<String, serde_yaml::Value>;

/// A stored record. On disk this is a flat YAML mapping with `id` next to
/// the other fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Document {
            id: id.into(),
            fields,
        }
    }

    /// Value of a field, with `id` answered from the document id
    pub fn value_of(&self, field: &str) -> Option<serde_yaml::Value> {
        if field == ID_FIELD {
            Some(serde_yaml::Value::String(self.id.clone()))
        } else {
            self.fields.get(field).cloned()
        }
    }

    pub fn get(&self, field: &str) -> Option<&serde_yaml::Value> {
        self.fields.get(field)
    }

    /// Exact equality on every queried field. A null in the query matches an
    /// absent field.
    pub fn matches(&self, query: &Fields) -> bool {
        query.iter().all(|(field, expected)| {
            if field == ID_FIELD {
                return expected.as_str() == Some(self.id.as_str());
            }
            match self.fields.get(field) {
                Some(actual) => actual == expected,
                None => expected.is_null(),
            }
        })
    }
}

/// Build a `Fields` map from `(name, value)` pairs
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<serde_yaml::Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
