//! Entities of the crate's `@graph`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Entity types used by FAIROps crates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityType {
    Dataset,
    File,
    Person,
    CreativeWork,
    /// A pipeline run that produced the artifact.
    CreateAction,
    Custom(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dataset => "Dataset",
            Self::File => "File",
            Self::Person => "Person",
            Self::CreativeWork => "CreativeWork",
            Self::CreateAction => "CreateAction",
            Self::Custom(t) => t,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the crate graph.
///
/// `@type` may be a single string or an array in documents written by other
/// tools; both forms are accepted and a single type is written back as a
/// plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "@id")]
    pub id: String,

    #[serde(rename = "@type", with = "type_field")]
    pub types: Vec<String>,

    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            id: id.into(),
            types: vec![entity_type.to_string()],
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_property("name", name.into())
    }

    /// Add a `{"@id": ...}` reference to another entity.
    pub fn with_reference(self, key: impl Into<String>, ref_id: impl Into<String>) -> Self {
        self.with_property(key, json!({ "@id": ref_id.into() }))
    }

    /// Add an ordered list of references.
    pub fn with_references<I, S>(self, key: impl Into<String>, ref_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let refs: Vec<Value> = ref_ids
            .into_iter()
            .map(|id| json!({ "@id": id.into() }))
            .collect();
        self.with_property(key, refs)
    }

    pub fn is_type(&self, entity_type: &EntityType) -> bool {
        self.types.iter().any(|t| t == entity_type.as_str())
    }

    /// String property, if present and a string.
    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer property; tolerates numbers written as strings.
    pub fn u64_property(&self, key: &str) -> Option<u64> {
        match self.properties.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Referenced ids under `key`, accepting a single reference or a list.
    pub fn references(&self, key: &str) -> Vec<String> {
        fn ref_id(v: &Value) -> Option<String> {
            v.get("@id").and_then(Value::as_str).map(String::from)
        }

        match self.properties.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(ref_id).collect(),
            Some(v) => ref_id(v).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

mod type_field {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(types: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        match types {
            [single] => single.serialize(serializer),
            many => many.serialize(serializer),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(t) => Ok(vec![t]),
            OneOrMany::Many(ts) if !ts.is_empty() => Ok(ts),
            OneOrMany::Many(_) => Err(D::Error::custom("@type must not be empty")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_type_serializes_as_string() {
        let entity = Entity::new("./", EntityType::Dataset).with_name("Image");
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["@type"], "Dataset");
        assert_eq!(value["name"], "Image");
    }

    #[test]
    fn test_type_array_accepted() {
        let entity: Entity = serde_json::from_value(json!({
            "@id": "image.tar",
            "@type": ["File", "SoftwareApplication"],
            "contentSize": "42"
        }))
        .unwrap();

        assert!(entity.is_type(&EntityType::File));
        assert_eq!(entity.u64_property("contentSize"), Some(42));
    }

    #[test]
    fn test_empty_type_array_rejected() {
        let result: Result<Entity, _> = serde_json::from_value(json!({ "@id": "x", "@type": [] }));
        assert!(result.is_err());
    }

    #[test]
    fn test_references_single_and_list() {
        let entity = Entity::new("./", EntityType::Dataset)
            .with_reference("license", "https://spdx.org/licenses/MIT")
            .with_references("author", ["#a", "#b"]);

        assert_eq!(entity.references("license"), vec!["https://spdx.org/licenses/MIT"]);
        assert_eq!(entity.references("author"), vec!["#a", "#b"]);
        assert!(entity.references("hasPart").is_empty());
    }
}
