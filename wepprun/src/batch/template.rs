//! Run-id templates over GeoJSON feature properties.
//!
//! A pattern like `{HUC12}-{NAME}` is expanded once per feature, then
//! sanitized into a filesystem- and channel-safe runid. Validation pins
//! the dataset with a SHA-256 checksum so a later enqueue can detect that
//! the file changed underneath the template.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::BatchError;

/// Longest runid a template may produce.
const MAX_RUNID_LEN: usize = 64;

/// Placeholder syntax: `{FIELD}` over `[A-Za-z0-9_]` field names.
const PLACEHOLDER: &str = r"\{([A-Za-z0-9_]+)\}";

/// Validation state of a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateState {
    #[default]
    Invalid,
    Ok,
}

/// A run-id template plus its validation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTemplate {
    pub pattern: String,
    pub state: TemplateState,
    /// SHA-256 of the dataset the template was validated against.
    pub resource_checksum: Option<String>,
}

impl BatchTemplate {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            state: TemplateState::Invalid,
            resource_checksum: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == TemplateState::Ok
    }

    /// Expands the template over every feature of the dataset, records
    /// the checksum, and marks the template `Ok`.
    ///
    /// Any expansion failure (missing property, empty or duplicate
    /// runid) leaves the template `Invalid`.
    pub fn validate(&mut self, geojson: &Path) -> Result<Vec<String>, BatchError> {
        self.state = TemplateState::Invalid;
        self.resource_checksum = None;

        let bytes = fs::read(geojson).map_err(|e| BatchError::Io {
            path: geojson.to_path_buf(),
            source: e,
        })?;
        let runids = expand_features(&self.pattern, &bytes)?;

        self.resource_checksum = Some(resource_checksum(&bytes));
        self.state = TemplateState::Ok;
        Ok(runids)
    }
}

/// SHA-256 hex digest of a dataset.
pub fn resource_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Collapses a raw expansion into a runid: disallowed characters become
/// `-`, runs collapse, edges trim, length is bounded.
pub fn sanitize_runid(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            last_dash = c == '-';
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    trimmed.chars().take(MAX_RUNID_LEN).collect()
}

/// Expands `pattern` over each feature of a GeoJSON FeatureCollection.
pub(crate) fn expand_features(pattern: &str, bytes: &[u8]) -> Result<Vec<String>, BatchError> {
    let placeholder = Regex::new(PLACEHOLDER).map_err(|e| BatchError::Pattern(e.to_string()))?;

    let doc: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| BatchError::Geojson(e.to_string()))?;
    let features = doc
        .get("features")
        .and_then(|f| f.as_array())
        .ok_or_else(|| BatchError::Geojson("no features array".to_string()))?;

    let mut runids = Vec::with_capacity(features.len());
    for (index, feature) in features.iter().enumerate() {
        let properties = feature
            .get("properties")
            .and_then(|p| p.as_object())
            .ok_or_else(|| BatchError::Geojson(format!("feature {} has no properties", index)))?;

        let expanded = expand_one(pattern, &placeholder, properties, index)?;
        let runid = sanitize_runid(&expanded);
        if runid.is_empty() {
            return Err(BatchError::EmptyRunid { index });
        }
        if runids.contains(&runid) {
            return Err(BatchError::DuplicateRunid { runid });
        }
        runids.push(runid);
    }
    Ok(runids)
}

fn expand_one(
    pattern: &str,
    placeholder: &Regex,
    properties: &serde_json::Map<String, serde_json::Value>,
    index: usize,
) -> Result<String, BatchError> {
    let mut out = String::with_capacity(pattern.len());
    let mut cursor = 0;
    for caps in placeholder.captures_iter(pattern) {
        let whole = caps.get(0).ok_or_else(|| {
            BatchError::Pattern("placeholder match without capture".to_string())
        })?;
        let field = &caps[1];
        out.push_str(&pattern[cursor..whole.start()]);

        let value = properties.get(field).ok_or_else(|| BatchError::MissingField {
            index,
            field: field.to_string(),
        })?;
        match value {
            serde_json::Value::String(s) => out.push_str(s),
            serde_json::Value::Number(n) => out.push_str(&n.to_string()),
            other => {
                return Err(BatchError::Geojson(format!(
                    "feature {} property {} is not a scalar: {}",
                    index, field, other
                )))
            }
        }
        cursor = whole.end();
    }
    out.push_str(&pattern[cursor..]);
    Ok(out)
}
