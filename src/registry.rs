//! Built-in protocol definitions the app needs installed on a user's DWN.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RegistryError;

pub const PROFILE_PROTOCOL_URI: &str = "https://areweweb5yet.com/protocols/profile";
pub const TASK_PROTOCOL_URI: &str = "https://schema.org/TaskSample";
pub const TASK_SCHEMA_URI: &str = "https://schema.org/TaskSample/schemas/name";

const JSON_FORMAT: &str = "application/json";
const IMAGE_FORMATS: [&str; 4] = ["image/gif", "image/png", "image/jpeg", "image/webp"];

/// A record type declared by a protocol
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

impl ProtocolType {
    pub fn with_formats<'a>(formats: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            schema: None,
            data_formats: Some(formats.into_iter().map(str::to_string).collect()),
        }
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(schema) = &self.schema {
            map.insert("schema".into(), Value::from(schema.as_str()));
        }
        if let Some(formats) = &self.data_formats {
            map.insert("dataFormats".into(), Value::from(formats.clone()));
        }
        Value::Object(map)
    }
}

/// Protocol definition in the shape a DWN stores it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    pub protocol: String,
    pub published: bool,
    pub types: BTreeMap<String, ProtocolType>,
    pub structure: Map<String, Value>,
}

impl ProtocolDefinition {
    /// JSON form used for canonical comparison and for configure calls
    pub fn to_value(&self) -> Value {
        let types: Map<String, Value> = self
            .types
            .iter()
            .map(|(name, ty)| (name.clone(), ty.to_value()))
            .collect();
        json!({
            "protocol": self.protocol,
            "published": self.published,
            "types": types,
            "structure": self.structure,
        })
    }
}

/// A definition together with the URI it is registered under
#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolEntry {
    pub uri: String,
    pub definition: ProtocolDefinition,
}

/// Immutable catalog of protocols keyed by URI, in registration order
#[derive(Clone, Debug)]
pub struct ProtocolRegistry {
    entries: Vec<ProtocolEntry>,
}

impl ProtocolRegistry {
    pub fn new(entries: Vec<ProtocolEntry>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.uri != entry.definition.protocol {
                return Err(RegistryError::UriMismatch {
                    uri: entry.uri.clone(),
                    protocol: entry.definition.protocol.clone(),
                });
            }
            if !seen.insert(entry.uri.as_str()) {
                return Err(RegistryError::Duplicate(entry.uri.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// The process-wide registry of built-in protocols
    pub fn builtin() -> &'static ProtocolRegistry {
        static BUILTIN: OnceLock<ProtocolRegistry> = OnceLock::new();
        BUILTIN.get_or_init(|| ProtocolRegistry {
            entries: vec![profile_entry(), task_entry()],
        })
    }

    pub fn all(&self) -> &[ProtocolEntry] {
        &self.entries
    }

    pub fn lookup(&self, uri: &str) -> Result<&ProtocolEntry, RegistryError> {
        self.entries
            .iter()
            .find(|entry| entry.uri == uri)
            .ok_or_else(|| RegistryError::NotFound(uri.to_string()))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ProtocolDefinition> {
        self.entries.iter().map(|entry| &entry.definition)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Profile protocol: ten record types, avatar and hero carry images
pub fn profile_definition() -> ProtocolDefinition {
    let json_types = [
        "name", "social", "messaging", "phone", "address", "career", "payment", "connect",
    ];
    let mut types: BTreeMap<String, ProtocolType> = json_types
        .iter()
        .map(|name| (name.to_string(), ProtocolType::with_formats([JSON_FORMAT])))
        .collect();
    for name in ["avatar", "hero"] {
        types.insert(name.to_string(), ProtocolType::with_formats(IMAGE_FORMATS));
    }

    let structure = types
        .keys()
        .map(|name| (name.clone(), Value::Object(Map::new())))
        .collect();

    ProtocolDefinition {
        protocol: PROFILE_PROTOCOL_URI.to_string(),
        published: true,
        types,
        structure,
    }
}

/// Task protocol: one record type with a required boolean `completed` tag
pub fn task_definition() -> ProtocolDefinition {
    let mut types = BTreeMap::new();
    types.insert(
        "task".to_string(),
        ProtocolType::with_formats([JSON_FORMAT]).schema(TASK_SCHEMA_URI),
    );

    let structure = match json!({
        "task": {
            "$tags": {
                "$requiredTags": ["completed"],
                "completed": { "type": "boolean" }
            }
        }
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    ProtocolDefinition {
        protocol: TASK_PROTOCOL_URI.to_string(),
        published: true,
        types,
        structure,
    }
}

fn profile_entry() -> ProtocolEntry {
    ProtocolEntry {
        uri: PROFILE_PROTOCOL_URI.to_string(),
        definition: profile_definition(),
    }
}

fn task_entry() -> ProtocolEntry {
    ProtocolEntry {
        uri: TASK_PROTOCOL_URI.to_string(),
        definition: task_definition(),
    }
}
