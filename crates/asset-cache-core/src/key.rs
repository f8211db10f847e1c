//! Request keys and versioned schema keys
//!
//! A request key is the path and query of the request URI. Scheme and
//! authority are dropped since one manager fronts a single origin.
//!
//! Schema documents are requested as
//! `<path>/schema.json?module_id=<uuid>&date=<epoch-seconds>`. Every key with
//! the same path and `module_id` is a revision of the same document.

use http::Uri;
use uuid::Uuid;

use crate::error::CoreError;

const SCHEMA_FILE: &str = "schema.json";
const HYPHENATED_UUID_LEN: usize = 36;

/// Cache key for a request URI
pub fn request_key(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Normalize a configured resource path or URL into a request key
///
/// Accepts absolute URLs (`http://host/a?b`), absolute paths (`/a?b`) and
/// bare relative paths (`a?b`, resolved against the root).
pub fn normalize_key(raw: &str) -> Result<String, CoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CoreError::InvalidKey("empty resource path".to_string()));
    }

    let candidate = if raw.starts_with('/') || raw.contains("://") {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };

    let uri: Uri = candidate
        .parse()
        .map_err(|e| CoreError::InvalidKey(format!("{}: {}", raw, e)))?;
    Ok(request_key(&uri))
}

/// A request key naming one revision of a module schema document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedKey {
    path: String,
    module_id: Uuid,
    revision: Option<String>,
}

impl VersionedKey {
    /// Parse a request key, `None` unless it is a schema request with a valid `module_id`
    ///
    /// `module_id` must be a hyphenated UUID (case-insensitive). The `date`
    /// revision is kept verbatim and never interpreted.
    pub fn parse(key: &str) -> Option<Self> {
        let (path, query) = key.split_once('?')?;
        if path.rsplit('/').next() != Some(SCHEMA_FILE) {
            return None;
        }

        let mut module_id = None;
        let mut revision = None;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "module_id" if module_id.is_none() => module_id = Some(parse_module_id(&value)?),
                "date" if revision.is_none() => revision = Some(value.into_owned()),
                _ => {}
            }
        }

        Some(Self {
            path: path.to_string(),
            module_id: module_id?,
            revision,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn module_id(&self) -> Uuid {
        self.module_id
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Whether both keys are revisions of the same schema document
    pub fn same_resource(&self, other: &VersionedKey) -> bool {
        self.module_id == other.module_id && self.path == other.path
    }
}

fn parse_module_id(value: &str) -> Option<Uuid> {
    // Uuid::try_parse also accepts simple, braced and urn forms
    if value.len() != HYPHENATED_UUID_LEN {
        return None;
    }
    Uuid::try_parse(value).ok()
}
