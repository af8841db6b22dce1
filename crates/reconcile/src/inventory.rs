//! Inventory resolution - desired set from source files, observed set from Kibana
//!
//! The desired set is read once per run from a directory of saved object
//! files, then projected onto each environment (space remapping and
//! attribute overrides). The observed set is listed per environment through
//! the target connector.

use crate::config::{EnvironmentTarget, ManagementConfig};
use crate::connector::TargetConnector;
use crate::error::{Error, Result};
use crate::types::{ObservedResource, Payload, ResourceDefinition, ResourceKey};
use kibanakit::{CancelToken, DEFAULT_SPACE, Reference, SPACE_TYPE};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A saved object declared in the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceObject {
    /// Identity as declared (before environment space mapping)
    pub key: ResourceKey,
    /// Declared content
    pub payload: Payload,
    /// File the object was read from
    pub origin: PathBuf,
}

/// One record of a source file, in Kibana export shape.
#[derive(Debug, Deserialize)]
struct SourceRecord {
    #[serde(rename = "type")]
    object_type: Option<String>,
    id: Option<String>,
    #[serde(default)]
    attributes: Value,
    #[serde(default)]
    references: Vec<Reference>,
    #[serde(default)]
    space: Option<String>,
    #[serde(default)]
    namespaces: Vec<String>,
}

/// Read every `*.json` and `*.ndjson` file below `dir`, in path order.
///
/// Records without `type`/`id` (such as export summary lines) and records
/// of unmanaged types are skipped.
pub fn load_source(dir: &Path, management: &ManagementConfig) -> Result<Vec<SourceObject>> {
    if !dir.is_dir() {
        return Err(Error::Source {
            path: dir.to_path_buf(),
            message: "not a directory".to_string(),
        });
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Source {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let records = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => read_json(path)?,
            Some("ndjson") => read_ndjson(path)?,
            _ => continue,
        };
        for record in records {
            if let Some(object) = to_source_object(path, record, management)? {
                objects.push(object);
            }
        }
    }

    log::debug!("loaded {} source objects from {}", objects.len(), dir.display());
    Ok(objects)
}

fn source_error(path: &Path, message: impl Into<String>) -> Error {
    Error::Source {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn read_json(path: &Path) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path).map_err(|e| source_error(path, e.to_string()))?;
    match serde_json::from_str(&content).map_err(|e| source_error(path, e.to_string()))? {
        Value::Array(items) => Ok(items),
        value @ Value::Object(_) => Ok(vec![value]),
        _ => Err(source_error(path, "expected an object or an array of objects")),
    }
}

fn read_ndjson(path: &Path) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path).map_err(|e| source_error(path, e.to_string()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| source_error(path, format!("line {}: {e}", n + 1)))
        })
        .collect()
}

fn to_source_object(
    path: &Path,
    value: Value,
    management: &ManagementConfig,
) -> Result<Option<SourceObject>> {
    let record: SourceRecord =
        serde_json::from_value(value).map_err(|e| source_error(path, e.to_string()))?;

    let (Some(object_type), Some(id)) = (record.object_type, record.id) else {
        return Ok(None);
    };
    if !management.manages(&object_type) {
        log::debug!("skipping unmanaged type {object_type}/{id} in {}", path.display());
        return Ok(None);
    }
    if !record.attributes.is_object() {
        return Err(source_error(
            path,
            format!("{object_type}/{id}: attributes must be an object"),
        ));
    }

    let space = record
        .space
        .or_else(|| record.namespaces.into_iter().next())
        .unwrap_or_else(|| DEFAULT_SPACE.to_string());

    Ok(Some(SourceObject {
        key: ResourceKey::new(object_type, id, space),
        payload: Payload {
            attributes: record.attributes,
            references: record.references,
        },
        origin: path.to_path_buf(),
    }))
}

/// Builds desired and observed inventories for environment targets.
pub struct Resolver<'a> {
    source: &'a [SourceObject],
    management: &'a ManagementConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(source: &'a [SourceObject], management: &'a ManagementConfig) -> Self {
        Self { source, management }
    }

    /// Project the source objects onto one environment.
    pub fn desired(&self, target: &EnvironmentTarget) -> Vec<ResourceDefinition> {
        let tags = self.management.tags();
        self.source
            .iter()
            .map(|object| {
                let source_key = &object.key;
                let key = if source_key.is_space() {
                    ResourceKey::new(SPACE_TYPE, target.map_space(&source_key.id), "")
                } else {
                    ResourceKey::new(
                        source_key.resource_type.clone(),
                        source_key.id.clone(),
                        target.map_space(&source_key.space),
                    )
                };

                let mut payload = object.payload.clone();
                for o in &target.overrides {
                    let matches = o.resource_type == source_key.resource_type
                        && o.id == source_key.id
                        && o.space.as_ref().is_none_or(|s| *s == source_key.space);
                    if matches {
                        merge_attributes(&mut payload.attributes, &o.attributes);
                    }
                }

                ResourceDefinition::new(key, payload, &tags)
            })
            .collect()
    }

    /// List everything carrying the management marker in the environment.
    ///
    /// Spaces scanned: the target's configured spaces, every space a
    /// desired resource lives in or declares, and every managed space found.
    pub fn observed(
        &self,
        target: &EnvironmentTarget,
        connector: &TargetConnector,
        desired: &[ResourceDefinition],
        cancel: &CancelToken,
    ) -> Result<Vec<ObservedResource>> {
        let tags = self.management.tags();
        let resolve_error = |source: kibanakit::Error| match source {
            kibanakit::Error::Cancelled => Error::Cancelled,
            source => Error::Resolve {
                environment: target.name.clone(),
                source,
            },
        };

        let mut scan: BTreeSet<String> = target.spaces.iter().cloned().collect();
        for definition in desired {
            if definition.key.is_space() {
                scan.insert(definition.key.id.clone());
            } else {
                scan.insert(definition.key.space.clone());
            }
        }

        let mut observed = Vec::new();
        if self.management.manages(SPACE_TYPE) {
            let spaces = connector
                .list(DEFAULT_SPACE, &[SPACE_TYPE.to_string()], cancel)
                .map_err(resolve_error)?;
            for space in spaces {
                let resource = ObservedResource::from_saved_object(space, &tags);
                if resource.managed {
                    scan.insert(resource.key.id.clone());
                }
                observed.push(resource);
            }
        }

        let object_types: Vec<String> = self
            .management
            .types
            .iter()
            .filter(|t| *t != SPACE_TYPE)
            .cloned()
            .collect();
        if !object_types.is_empty() {
            for space in &scan {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let objects = connector
                    .list(space, &object_types, cancel)
                    .map_err(resolve_error)?;
                observed.extend(
                    objects
                        .into_iter()
                        .map(|o| ObservedResource::from_saved_object(o, &tags)),
                );
            }
        }

        Ok(observed)
    }

    /// Desired and observed inventories for one environment.
    pub fn resolve(
        &self,
        target: &EnvironmentTarget,
        connector: &TargetConnector,
        cancel: &CancelToken,
    ) -> Result<(Vec<ResourceDefinition>, Vec<ObservedResource>)> {
        let desired = self.desired(target);
        let observed = self.observed(target, connector, &desired, cancel)?;
        log::info!(
            "{}: resolved {} desired and {} observed resources",
            target.name,
            desired.len(),
            observed.len()
        );
        Ok((desired, observed))
    }
}

/// Shallow-merge `patch` into `attributes` (both objects).
fn merge_attributes(attributes: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (attributes, patch) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}
