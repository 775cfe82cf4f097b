use std::collections::BTreeSet;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::models::{Entity, RawDataEntry};
use crate::{IntegrationError, Result};

/// Source fields copied into the entity as-is when present. Provider-specific
/// fields beyond these ride in through `assign`, which always wins.
const COMMON_PROPERTY_WHITELIST: &[&str] = &[
    "id",
    "name",
    "displayName",
    "description",
    "environment",
    "createdOn",
    "active",
];

/// Tag keys lifted to top-level properties even without an explicit
/// `tag_properties` request.
const COMMON_TAG_PROMOTIONS: &[&str] = &["classification", "name", "owner"];

/// `_class` accepts a single tag or a list; canonicalization always emits a
/// list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassAssignment {
    One(String),
    Many(Vec<String>),
}

impl ClassAssignment {
    fn into_list(self) -> Vec<String> {
        match self {
            Self::One(class) => vec![class],
            Self::Many(classes) => classes,
        }
    }
}

impl From<&str> for ClassAssignment {
    fn from(class: &str) -> Self {
        Self::One(class.to_string())
    }
}

impl From<Vec<&str>> for ClassAssignment {
    fn from(classes: Vec<&str>) -> Self {
        Self::Many(classes.into_iter().map(str::to_string).collect())
    }
}

/// Caller-forced fields layered on top of whatever the source provides.
#[derive(Debug, Clone)]
pub struct EntityAssignments {
    pub class: ClassAssignment,
    pub entity_type: String,
    pub key: Option<String>,
    pub display_name: Option<String>,
    pub raw_data: Vec<RawDataEntry>,
    pub properties: Map<String, Value>,
}

impl EntityAssignments {
    pub fn new(class: impl Into<ClassAssignment>, entity_type: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            entity_type: entity_type.into(),
            key: None,
            display_name: None,
            raw_data: Vec::new(),
            properties: Map::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn raw_data(mut self, entry: RawDataEntry) -> Self {
        self.raw_data.push(entry);
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// Input to [`create_integration_entity`].
#[derive(Debug, Clone)]
pub struct IntegrationEntityInput {
    pub assign: EntityAssignments,
    pub source: Value,
    pub tag_properties: Vec<String>,
}

impl IntegrationEntityInput {
    pub fn new(assign: EntityAssignments, source: Value) -> Self {
        Self {
            assign,
            source,
            tag_properties: Vec::new(),
        }
    }

    pub fn tag_properties(mut self, keys: Vec<String>) -> Self {
        self.tag_properties = keys;
        self
    }
}

/// Deterministic mapping from raw provider data plus caller assignments into
/// a schema-compliant entity. Applying it twice to the same input yields
/// equal outputs; failures never produce partial entities.
pub fn create_integration_entity(input: IntegrationEntityInput) -> Result<Entity> {
    let IntegrationEntityInput {
        assign,
        source,
        tag_properties,
    } = input;

    let mut properties = Map::new();
    let source_obj = source.as_object();

    if let Some(src) = source_obj {
        for name in COMMON_PROPERTY_WHITELIST {
            if let Some(value) = src.get(*name) {
                properties.insert((*name).to_string(), value.clone());
            }
        }

        // `status` drives `active` rather than being copied through.
        if let Some(status) = src.get("status") {
            if status.as_str() == Some("Active") {
                properties.insert("active".to_string(), Value::Bool(true));
            } else {
                properties.remove("active");
            }
        }

        if let Some(ms) = epoch_millis(src.get("creationDate")) {
            properties.insert("createdOn".to_string(), Value::from(ms));
        }
    }

    let mut tag_name: Option<String> = None;
    if let Some(tags) = source_obj
        .and_then(|src| src.get("tags"))
        .and_then(Value::as_array)
        .filter(|tags| !tags.is_empty())
    {
        for tag in tags {
            let Some(key) = tag.get("Key").and_then(Value::as_str) else {
                continue;
            };
            let value = tag.get("Value").cloned().unwrap_or(Value::Null);
            if key == "name" {
                tag_name = value.as_str().map(str::to_string);
            }
            if COMMON_TAG_PROMOTIONS.contains(&key) || tag_properties.iter().any(|p| p == key) {
                properties.insert(key.to_string(), value.clone());
            }
            properties.insert(format!("tag.{key}"), value);
        }
    }

    for (name, value) in &assign.properties {
        properties.insert(name.clone(), value.clone());
    }

    // displayName precedence: a caller assignment wins outright; otherwise
    // the tag/source name chain overrides whatever the whitelist fold copied
    // from a raw `source.displayName`.
    let assigned_display_name = assign.display_name.clone().or_else(|| {
        assign
            .properties
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let display_name = assigned_display_name.or(tag_name).or_else(|| {
        source_obj
            .and_then(|src| src.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match display_name {
        Some(name) => {
            properties.insert("displayName".to_string(), Value::String(name));
        }
        None => {
            return Err(IntegrationError::canonicalization(
                "name required: no displayName assignment, name tag, or source name",
            ));
        }
    }

    let mut raw_data = Vec::new();
    if !is_structurally_empty(&source) {
        raw_data.push(RawDataEntry::new("default", source.clone()));
    }
    raw_data.extend(assign.raw_data);

    let mut seen_names = BTreeSet::new();
    for entry in &raw_data {
        if !seen_names.insert(entry.name.as_str()) {
            return Err(IntegrationError::canonicalization(format!(
                "duplicate _rawData name: \"{}\"",
                entry.name
            )));
        }
    }

    let class = assign.class.into_list();
    if class.is_empty() {
        return Err(IntegrationError::canonicalization(
            "at least one _class is required",
        ));
    }

    let key = match assign.key {
        Some(key) => key,
        None => source_key(source_obj).ok_or_else(|| {
            IntegrationError::canonicalization("_key required: no _key assignment or source id")
        })?,
    };

    // The envelope fields live outside the property bag.
    for envelope in ["_key", "_type", "_class", "_rawData"] {
        properties.remove(envelope);
    }

    Ok(Entity {
        key,
        entity_type: assign.entity_type,
        class,
        raw_data,
        properties,
    })
}

fn source_key(source: Option<&Map<String, Value>>) -> Option<String> {
    match source?.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn epoch_millis(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(ms) => ms.as_i64(),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

fn is_structurally_empty(source: &Value) -> bool {
    match source {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn promotes_classified_tags_and_captures_default_raw_data() {
        let source = json!({
            "id": "x",
            "name": "N",
            "tags": [{"Key": "classification", "Value": "critical"}],
        });
        let entity = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Network", "t"),
            source.clone(),
        ))
        .unwrap();

        assert_eq!(entity.key, "x");
        assert_eq!(entity.class, vec!["Network"]);
        assert_eq!(entity.property("classification"), Some(&json!("critical")));
        assert_eq!(
            entity.property("tag.classification"),
            Some(&json!("critical"))
        );
        assert_eq!(entity.display_name(), Some("N"));
        assert_eq!(entity.raw_data, vec![RawDataEntry::new("default", source)]);
    }

    #[test]
    fn duplicate_raw_data_name_is_fatal() {
        let input = IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t")
                .raw_data(RawDataEntry::new("default", json!("x"))),
            json!({"id": "h", "name": "host"}),
        );
        let err = create_integration_entity(input).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("duplicate"));
    }

    #[test]
    fn is_deterministic_and_idempotent() {
        let build = || {
            IntegrationEntityInput::new(
                EntityAssignments::new(vec!["Host", "Device"], "acme_host")
                    .property("hostname", json!("h-1")),
                json!({
                    "id": "h-1",
                    "name": "host-one",
                    "status": "Active",
                    "creationDate": "2024-03-01T00:00:00Z",
                }),
            )
        };
        let first = create_integration_entity(build()).unwrap();
        let second = create_integration_entity(build()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.class, vec!["Host", "Device"]);
        assert_eq!(first.property("active"), Some(&json!(true)));
        assert_eq!(first.property("createdOn"), Some(&json!(1_709_251_200_000i64)));
    }

    #[test]
    fn tag_properties_lift_requested_keys_only() {
        let source = json!({
            "id": "i",
            "name": "n",
            "tags": [
                {"Key": "team", "Value": "infra"},
                {"Key": "cost-center", "Value": 42},
            ],
        });
        let entity = create_integration_entity(
            IntegrationEntityInput::new(EntityAssignments::new("Resource", "t"), source)
                .tag_properties(vec!["team".to_string()]),
        )
        .unwrap();

        assert_eq!(entity.property("team"), Some(&json!("infra")));
        assert_eq!(entity.property("tag.team"), Some(&json!("infra")));
        assert_eq!(entity.property("cost-center"), None);
        assert_eq!(entity.property("tag.cost-center"), Some(&json!(42)));
    }

    #[test]
    fn name_tag_outranks_source_name_for_display_name() {
        let entity = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t"),
            json!({
                "id": "h",
                "name": "raw-name",
                "tags": [{"Key": "name", "Value": "tagged-name"}],
            }),
        ))
        .unwrap();
        assert_eq!(entity.display_name(), Some("tagged-name"));
    }

    #[test]
    fn source_name_overrides_a_folded_display_name() {
        let entity = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t"),
            json!({"id": "x", "displayName": "Old", "name": "New"}),
        ))
        .unwrap();
        assert_eq!(entity.display_name(), Some("New"));

        let forced = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t").display_name("Forced"),
            json!({"id": "x", "displayName": "Old", "name": "New"}),
        ))
        .unwrap();
        assert_eq!(forced.display_name(), Some("Forced"));
    }

    #[test]
    fn missing_every_name_source_fails() {
        let err = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t").key("k"),
            json!({"id": "h"}),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("name required"));
    }

    #[test]
    fn key_falls_back_to_source_id_then_fails() {
        let entity = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t"),
            json!({"id": 7, "name": "seven"}),
        ))
        .unwrap();
        assert_eq!(entity.key, "7");

        let err = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t"),
            json!({"name": "anonymous"}),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("_key required"));
    }

    #[test]
    fn inactive_status_unsets_whitelisted_active() {
        let entity = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t"),
            json!({"id": "h", "name": "n", "active": true, "status": "Suspended"}),
        ))
        .unwrap();
        assert_eq!(entity.property("active"), None);

        let forced = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t").property("active", json!(false)),
            json!({"id": "h", "name": "n", "status": "Suspended"}),
        ))
        .unwrap();
        assert_eq!(forced.property("active"), Some(&json!(false)));
    }

    #[test]
    fn empty_source_skips_the_default_raw_data_entry() {
        let entity = create_integration_entity(IntegrationEntityInput::new(
            EntityAssignments::new("Host", "t")
                .key("k")
                .display_name("bare"),
            json!({}),
        ))
        .unwrap();
        assert!(entity.raw_data.is_empty());
    }
}
