use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One named raw-data capture attached to an entity. Names are unique within
/// an entity's `_rawData` list; the first entry is always `default` when the
/// provider source was non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataEntry {
    pub name: String,
    #[serde(rename = "rawData")]
    pub raw_data: Value,
}

impl RawDataEntry {
    pub fn new(name: impl Into<String>, raw_data: Value) -> Self {
        Self {
            name: name.into(),
            raw_data,
        }
    }
}

/// Canonical graph entity: the typed envelope plus an open property bag that
/// flattens into the wire representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_type")]
    pub entity_type: String,
    #[serde(rename = "_class")]
    pub class: Vec<String>,
    #[serde(rename = "_rawData", default, skip_serializing_if = "Vec::is_empty")]
    pub raw_data: Vec<RawDataEntry>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Entity {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.property("displayName").and_then(Value::as_str)
    }
}

/// Canonical graph relationship. The verb tag is a single class; endpoints
/// are either direct entity keys or a mapped-endpoint descriptor, opaque to
/// the scheduler and the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "_key")]
    pub key: String,
    #[serde(rename = "_type")]
    pub relationship_type: String,
    #[serde(rename = "_class")]
    pub class: String,
    #[serde(
        rename = "_fromEntityKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub from_entity_key: Option<String>,
    #[serde(
        rename = "_toEntityKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub to_entity_key: Option<String>,
    #[serde(rename = "_mapping", default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Relationship {
    /// Whether the relationship names its endpoints one way or the other.
    pub fn has_endpoints(&self) -> bool {
        (self.from_entity_key.is_some() && self.to_entity_key.is_some())
            || self.mapping.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_serializes_with_flattened_properties() {
        let mut properties = Map::new();
        properties.insert("displayName".to_string(), json!("web-tier"));
        properties.insert("active".to_string(), json!(true));
        let entity = Entity {
            key: "network:web".to_string(),
            entity_type: "acme_network".to_string(),
            class: vec!["Network".to_string()],
            raw_data: vec![RawDataEntry::new("default", json!({"id": "web"}))],
            properties,
        };

        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["_key"], json!("network:web"));
        assert_eq!(value["_class"], json!(["Network"]));
        assert_eq!(value["displayName"], json!("web-tier"));
        assert_eq!(value["_rawData"][0]["name"], json!("default"));

        let round: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(round, entity);
    }

    #[test]
    fn relationship_endpoint_detection() {
        let direct = Relationship {
            key: "a|has|b".to_string(),
            relationship_type: "acme_network_has_host".to_string(),
            class: "HAS".to_string(),
            from_entity_key: Some("a".to_string()),
            to_entity_key: Some("b".to_string()),
            mapping: None,
            properties: Map::new(),
        };
        assert!(direct.has_endpoints());

        let mapped = Relationship {
            mapping: Some(json!({"sourceEntityKey": "a", "targetFilterKeys": [["_key"]]})),
            from_entity_key: None,
            to_entity_key: None,
            ..direct.clone()
        };
        assert!(mapped.has_endpoints());

        let dangling = Relationship {
            from_entity_key: Some("a".to_string()),
            to_entity_key: None,
            mapping: None,
            ..direct
        };
        assert!(!dangling.has_endpoints());
    }
}
