//! Core types for reconciliation: resource identity, content and fingerprints

use chrono::{DateTime, Utc};
use kibanakit::{Reference, SPACE_TYPE, SavedObject, normalize_space_attributes};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identity of a manageable resource within one environment.
///
/// Ordering is by type, then id, then space; plans use it as the stable
/// order within a phase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Saved object type, or `space` for space definitions
    pub resource_type: String,
    /// Object id
    pub id: String,
    /// Space the object lives in (empty for spaces)
    pub space: String,
}

impl ResourceKey {
    /// Create a key. Spaces always get an empty space component.
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        space: impl Into<String>,
    ) -> Self {
        let resource_type = resource_type.into();
        let space = if resource_type == SPACE_TYPE {
            String::new()
        } else {
            space.into()
        };
        Self {
            resource_type,
            id: id.into(),
            space,
        }
    }

    /// Whether this key identifies a space definition.
    pub fn is_space(&self) -> bool {
        self.resource_type == SPACE_TYPE
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_space() {
            write!(f, "{}/{}", self.resource_type, self.id)
        } else {
            write!(f, "{}/{}@{}", self.resource_type, self.id, self.space)
        }
    }
}

/// Deterministic hash of a normalized payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated digest for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Tags proving ownership of remote objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementTags {
    /// Tag present on every object this tool manages
    pub marker: String,
    /// Tag added to managed objects that were soft-deleted
    pub disabled: String,
}

impl ManagementTags {
    /// Whether a reference is one of the ownership tags.
    pub fn is_ownership_reference(&self, reference: &Reference) -> bool {
        reference.is_tag(&self.marker) || reference.is_tag(&self.disabled)
    }
}

/// Content of a resource: what gets written to and read from Kibana.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Type-specific attributes
    pub attributes: Value,
    /// References to other objects, ownership tags excluded
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl Payload {
    /// Create a payload with no references.
    pub fn new(attributes: Value) -> Self {
        Self {
            attributes,
            references: Vec::new(),
        }
    }

    /// Drop ownership tags and sort references. Space attributes also lose
    /// the fields Kibana fills in by itself.
    pub fn normalized_for(mut self, key: &ResourceKey, tags: &ManagementTags) -> Self {
        if key.is_space() {
            normalize_space_attributes(&mut self.attributes);
        }
        self.normalized(tags)
    }

    /// Drop ownership tags and sort references.
    pub fn normalized(mut self, tags: &ManagementTags) -> Self {
        self.references.retain(|r| !tags.is_ownership_reference(r));
        self.references.sort();
        self.references.dedup();
        self
    }

    /// Hash of the canonical JSON rendering (object keys sorted, references sorted).
    pub fn fingerprint(&self) -> Fingerprint {
        let mut references = self.references.clone();
        references.sort();
        let references = references
            .iter()
            .map(|r| {
                Value::Array(vec![
                    Value::String(r.object_type.clone()),
                    Value::String(r.id.clone()),
                    Value::String(r.name.clone()),
                ])
            })
            .collect();
        let canonical = Value::Array(vec![canonicalize(&self.attributes), Value::Array(references)]);
        Fingerprint(blake3::hash(canonical.to_string().as_bytes()).to_hex().to_string())
    }
}

/// Rebuild `value` with every object's keys inserted in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// A resource as declared in the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDefinition {
    /// Identity
    pub key: ResourceKey,
    /// Desired content
    pub payload: Payload,
    /// Fingerprint of `payload`
    pub fingerprint: Fingerprint,
    /// Ownership tag written with the resource
    pub marker: String,
}

impl ResourceDefinition {
    /// Create a definition, normalizing the payload and computing its fingerprint.
    pub fn new(key: ResourceKey, payload: Payload, tags: &ManagementTags) -> Self {
        let payload = payload.normalized_for(&key, tags);
        let fingerprint = payload.fingerprint();
        Self {
            key,
            payload,
            fingerprint,
            marker: tags.marker.clone(),
        }
    }

    /// The object to write remotely, carrying the management marker.
    pub fn to_saved_object(&self) -> SavedObject {
        let mut object = SavedObject::new(
            self.key.space.clone(),
            self.key.resource_type.clone(),
            self.key.id.clone(),
            self.payload.attributes.clone(),
        );
        object.references = self.payload.references.clone();
        object.with_tag(&self.marker)
    }
}

/// A resource as found in a live environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedResource {
    /// Identity
    pub key: ResourceKey,
    /// Current content, ownership tags excluded
    pub payload: Payload,
    /// Fingerprint of `payload`
    pub fingerprint: Fingerprint,
    /// Carries the management marker
    pub managed: bool,
    /// Carries the disabled tag
    pub disabled: bool,
    /// Last modification reported by Kibana
    pub updated_at: Option<DateTime<Utc>>,
}

impl ObservedResource {
    /// Build from a saved object returned by the backend.
    pub fn from_saved_object(object: SavedObject, tags: &ManagementTags) -> Self {
        let managed = object.has_tag(&tags.marker);
        let disabled = object.has_tag(&tags.disabled);
        let key = ResourceKey::new(object.object_type, object.id, object.space);
        let payload = Payload {
            attributes: object.attributes,
            references: object.references,
        }
        .normalized_for(&key, tags);
        let fingerprint = payload.fingerprint();
        Self {
            key,
            payload,
            fingerprint,
            managed,
            disabled,
            updated_at: object.updated_at,
        }
    }

    /// The object to write back when soft-deleting this resource.
    pub fn to_disabled_object(&self, tags: &ManagementTags) -> SavedObject {
        let mut object = SavedObject::new(
            self.key.space.clone(),
            self.key.resource_type.clone(),
            self.key.id.clone(),
            self.payload.attributes.clone(),
        );
        object.references = self.payload.references.clone();
        object.with_tag(&tags.marker).with_tag(&tags.disabled)
    }
}
