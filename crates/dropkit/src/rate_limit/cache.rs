//! Per-target entity validators for conditional requests.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::headers::QuotaHeaderNames;
use crate::transport::header_value;

/// Validators last seen for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn etag(etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
            last_modified: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Pull validators out of response headers.
    pub fn from_headers(headers: &HashMap<String, String>, names: &QuotaHeaderNames) -> Self {
        Self {
            etag: header_value(headers, &names.etag).map(str::to_string),
            last_modified: header_value(headers, &names.last_modified).map(str::to_string),
        }
    }

    /// `If-None-Match` / `If-Modified-Since` headers for these validators.
    pub fn conditional_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(etag) = &self.etag {
            headers.insert("If-None-Match".to_string(), etag.clone());
        }
        if let Some(last_modified) = &self.last_modified {
            headers.insert("If-Modified-Since".to_string(), last_modified.clone());
        }
        headers
    }
}

/// Validators keyed by target. Entries are only ever overwritten, never expired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionalCacheStore {
    entries: BTreeMap<String, Validators>,
}

impl ConditionalCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: &str) -> Option<&Validators> {
        self.entries.get(target)
    }

    pub fn put(&mut self, target: impl Into<String>, validators: Validators) {
        self.entries.insert(target.into(), validators);
    }

    /// Store validators from a successful response, if it carried any.
    pub fn capture(
        &mut self,
        target: &str,
        headers: &HashMap<String, String>,
        names: &QuotaHeaderNames,
    ) -> bool {
        let validators = Validators::from_headers(headers, names);
        if validators.is_empty() {
            return false;
        }
        self.put(target, validators);
        true
    }

    pub fn conditional_headers(&self, target: &str) -> HashMap<String, String> {
        self.get(target)
            .map(Validators::conditional_headers)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, Validators> {
        &self.entries
    }
}

impl From<BTreeMap<String, Validators>> for ConditionalCacheStore {
    fn from(entries: BTreeMap<String, Validators>) -> Self {
        Self { entries }
    }
}
