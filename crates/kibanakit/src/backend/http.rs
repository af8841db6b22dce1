//! HTTP backend for a live Kibana instance.
//!
//! Saved objects go through `/api/saved_objects`, spaces through
//! `/api/spaces/space`. Objects outside the default space are addressed
//! with the `/s/{space}` prefix.
//!
//! Spaces cannot carry references, so tags on a space are stored as
//! `[tag:<id>]` tokens at the end of its description.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::types::{
    DEFAULT_SPACE, Reference, SPACE_TYPE, SavedObject, TAG_TYPE, normalize_space_attributes,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;
use ureq::http::Response;
use ureq::{Agent, Body, RequestBuilder};

/// Largest response body accepted (a full `_find` page can be large).
const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// Objects requested per `_find` page.
const DEFAULT_PAGE_SIZE: u32 = 1000;

static TAG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[tag:([^\]\s]+)\]").expect("tag token pattern is valid"));

/// The block [`encode_tags`] appends, including its separator.
static TAG_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\n\n)?\[tag:[^\]\s]+\](?: \[tag:[^\]\s]+\])*\z")
        .expect("tag block pattern is valid")
});

/// Kibana backend over blocking HTTP.
pub struct HttpBackend {
    /// HTTP agent for requests.
    agent: Agent,
    /// Kibana base URL, without trailing slash.
    base_url: String,
    /// Extra headers sent with every request.
    headers: Vec<(String, String)>,
    /// Page size for `_find`.
    page_size: u32,
}

impl HttpBackend {
    /// Create a backend for the Kibana at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(config),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Send these headers with every request (e.g. `Authorization`).
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Get the Kibana base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn space_prefix(&self, space: &str) -> String {
        if space.is_empty() || space == DEFAULT_SPACE {
            self.base_url.clone()
        } else {
            format!("{}/s/{}", self.base_url, encode_segment(space))
        }
    }

    fn object_url(&self, space: &str, object_type: &str, id: &str) -> String {
        format!(
            "{}/api/saved_objects/{}/{}",
            self.space_prefix(space),
            encode_segment(object_type),
            encode_segment(id)
        )
    }

    fn find_url(&self, space: &str) -> String {
        format!("{}/api/saved_objects/_find", self.space_prefix(space))
    }

    fn spaces_url(&self) -> String {
        format!("{}/api/spaces/space", self.base_url)
    }

    fn space_url(&self, id: &str) -> String {
        format!("{}/{}", self.spaces_url(), encode_segment(id))
    }

    fn prepare<B>(&self, request: RequestBuilder<B>) -> RequestBuilder<B> {
        let mut request = request
            .header("kbn-xsrf", "true")
            .header("Accept", "application/json")
            .header("User-Agent", "kibanakit-rs");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// Read a response, turning non-2xx statuses into categorised errors.
    fn read(
        url: &str,
        result: std::result::Result<Response<Body>, ureq::Error>,
    ) -> Result<String> {
        let mut response = result.map_err(|e| Error::from_transport(url, e))?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_SIZE)
            .read_to_string()
            .map_err(|e| Error::from_transport(url, e))?;

        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(Error::from_status(status, url, &body, retry_after.as_deref()))
        }
    }

    fn find_spaces(&self, tag: &str) -> Result<Vec<SavedObject>> {
        let url = self.spaces_url();
        let body = Self::read(&url, self.prepare(self.agent.get(&url)).call())?;
        let spaces: Vec<Value> = decode(&url, &body)?;
        Ok(spaces
            .into_iter()
            .filter_map(space_from_api)
            .filter(|s| s.has_tag(tag))
            .collect())
    }

    /// Page through `_find`, filtered to objects referencing `tag` if given.
    fn find_objects(
        &self,
        space: &str,
        types: &[&str],
        tag: Option<&str>,
    ) -> Result<Vec<SavedObject>> {
        let url = self.find_url(space);
        let has_reference = tag.map(|tag| json!({"type": TAG_TYPE, "id": tag}).to_string());
        let mut found = Vec::new();
        let mut page = 1u32;

        loop {
            let mut request = self
                .agent
                .get(&url)
                .query("per_page", self.page_size.to_string())
                .query("page", page.to_string());
            if let Some(has_reference) = &has_reference {
                request = request.query("has_reference", has_reference.as_str());
            }
            for object_type in types {
                request = request.query("type", *object_type);
            }

            let body = match Self::read(&url, self.prepare(request).call()) {
                Ok(body) => body,
                // Space does not exist (yet): nothing is managed there.
                Err(Error::NotFound { .. }) => return Ok(found),
                Err(e) => return Err(e),
            };
            let response: FindResponse = decode(&url, &body)?;
            let count = response.saved_objects.len();
            found.extend(
                response
                    .saved_objects
                    .into_iter()
                    .map(|o| o.into_saved_object(space)),
            );

            if count == 0 || found.len() as u64 >= response.total {
                break;
            }
            page += 1;
        }

        log::debug!("found {} objects in space {}", found.len(), space);
        Ok(found)
    }
}

impl Backend for HttpBackend {
    fn find(&self, space: &str, types: &[String], tag: &str) -> Result<Vec<SavedObject>> {
        let mut found = Vec::new();
        if types.iter().any(|t| t == SPACE_TYPE) {
            found.extend(self.find_spaces(tag)?);
        }
        let object_types: Vec<&str> = types
            .iter()
            .map(String::as_str)
            .filter(|t| *t != SPACE_TYPE)
            .collect();
        if !object_types.is_empty() {
            found.extend(self.find_objects(space, &object_types, Some(tag))?);
        }
        Ok(found)
    }

    fn find_all(&self, space: &str, types: &[String]) -> Result<Vec<SavedObject>> {
        let object_types: Vec<&str> = types
            .iter()
            .map(String::as_str)
            .filter(|t| *t != SPACE_TYPE)
            .collect();
        if object_types.is_empty() {
            return Ok(Vec::new());
        }
        self.find_objects(space, &object_types, None)
    }

    fn get(&self, space: &str, object_type: &str, id: &str) -> Result<Option<SavedObject>> {
        let url = if object_type == SPACE_TYPE {
            self.space_url(id)
        } else {
            self.object_url(space, object_type, id)
        };
        let body = match Self::read(&url, self.prepare(self.agent.get(&url)).call()) {
            Ok(body) => body,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if object_type == SPACE_TYPE {
            let value: Value = decode(&url, &body)?;
            Ok(space_from_api(value))
        } else {
            let object: ApiSavedObject = decode(&url, &body)?;
            Ok(Some(object.into_saved_object(space)))
        }
    }

    fn create(&self, object: &SavedObject) -> Result<()> {
        if object.is_space() {
            let url = self.spaces_url();
            let request = self.prepare(self.agent.post(&url));
            Self::read(&url, request.send_json(space_to_api(object)))?;
        } else {
            let url = self.object_url(&object.space, &object.object_type, &object.id);
            let request = self.prepare(self.agent.post(&url));
            Self::read(&url, request.send_json(object_body(object)))?;
        }
        Ok(())
    }

    fn upsert(&self, object: &SavedObject) -> Result<()> {
        if object.is_space() {
            let url = self.space_url(&object.id);
            let request = self.prepare(self.agent.put(&url));
            match Self::read(&url, request.send_json(space_to_api(object))) {
                Ok(_) => Ok(()),
                Err(Error::NotFound { .. }) => self.create(object),
                Err(e) => Err(e),
            }
        } else {
            let url = self.object_url(&object.space, &object.object_type, &object.id);
            let request = self
                .prepare(self.agent.post(&url))
                .query("overwrite", "true");
            Self::read(&url, request.send_json(object_body(object)))?;
            Ok(())
        }
    }

    fn delete(&self, space: &str, object_type: &str, id: &str) -> Result<()> {
        let url = if object_type == SPACE_TYPE {
            self.space_url(id)
        } else {
            self.object_url(space, object_type, id)
        };
        let mut request = self.prepare(self.agent.delete(&url));
        if object_type != SPACE_TYPE {
            request = request.query("force", "true");
        }
        Self::read(&url, request.call())?;
        Ok(())
    }
}

// =============================================================================
// Kibana API payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    saved_objects: Vec<ApiSavedObject>,
}

#[derive(Debug, Deserialize)]
struct ApiSavedObject {
    #[serde(rename = "type")]
    object_type: String,
    id: String,
    #[serde(default)]
    attributes: Value,
    #[serde(default)]
    references: Vec<Reference>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl ApiSavedObject {
    fn into_saved_object(self, space: &str) -> SavedObject {
        let space = if space.is_empty() {
            DEFAULT_SPACE
        } else {
            space
        };
        SavedObject {
            space: space.to_string(),
            object_type: self.object_type,
            id: self.id,
            attributes: self.attributes,
            references: self.references,
            updated_at: self.updated_at,
        }
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::InvalidResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn object_body(object: &SavedObject) -> Value {
    json!({
        "attributes": object.attributes,
        "references": object.references,
    })
}

/// Split `[tag:<id>]` tokens out of a space description.
///
/// The text before the appended token block is returned byte for byte.
pub fn decode_tags(description: &str) -> (String, Vec<String>) {
    let tags = TAG_TOKEN
        .captures_iter(description)
        .map(|c| c[1].to_string())
        .collect();
    let clean = TAG_BLOCK.replace(description, "");
    // stray tokens edited into the middle of the text
    let clean = TAG_TOKEN.replace_all(&clean, "").into_owned();
    (clean, tags)
}

/// Append `[tag:<id>]` tokens to a space description.
pub fn encode_tags(description: &str, tags: &[&str]) -> String {
    let tokens = tags
        .iter()
        .map(|t| format!("[tag:{t}]"))
        .collect::<Vec<_>>()
        .join(" ");
    match (description.is_empty(), tokens.is_empty()) {
        (true, _) => tokens,
        (false, true) => description.to_string(),
        (false, false) => format!("{description}\n\n{tokens}"),
    }
}

fn space_from_api(value: Value) -> Option<SavedObject> {
    let Value::Object(mut map) = value else {
        return None;
    };
    let id = match map.remove("id") {
        Some(Value::String(id)) => id,
        _ => return None,
    };
    let description = map
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let (clean, tags) = decode_tags(&description);
    map.insert("description".to_string(), Value::String(clean));

    let mut attributes = Value::Object(map);
    normalize_space_attributes(&mut attributes);
    let mut space = SavedObject::new("", SPACE_TYPE, id, attributes);
    space.references = tags.into_iter().map(Reference::tag).collect();
    Some(space)
}

fn space_to_api(object: &SavedObject) -> Value {
    let mut map: Map<String, Value> = object.attributes.as_object().cloned().unwrap_or_default();
    let tags: Vec<&str> = object
        .references
        .iter()
        .filter(|r| r.object_type == TAG_TYPE)
        .map(|r| r.id.as_str())
        .collect();
    let description = map
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    map.insert(
        "description".to_string(),
        Value::String(encode_tags(&description, &tags)),
    );
    map.insert("id".to_string(), Value::String(object.id.clone()));
    Value::Object(map)
}

/// Percent-encode a URL path segment.
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}
