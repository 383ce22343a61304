//! Incremental response payloads for the cache
//!
//! A cached pipeline step must only store what it contributed to the
//! response, never the state written by handlers that ran before it.
//! [`compute_diff`] isolates that contribution from two snapshots of the
//! response and [`CacheEntry::apply`] replays it on a cache hit.

use crate::error::{BouncerError, Result};
use crate::models::ResponseAccumulator;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stored contribution of one cached step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Headers the step added or changed
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// `Set-Cookie` directives the step appended
    #[serde(default)]
    pub cookies: Vec<String>,
    /// Body chunk the step returned
    #[serde(default)]
    pub body: String,
}

/// Snapshot of the header and cookie state of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<String>,
}

impl ResponseSnapshot {
    pub fn capture(response: &ResponseAccumulator) -> Self {
        ResponseSnapshot {
            headers: response.headers().clone(),
            cookies: response.cookies().to_vec(),
        }
    }
}

/// Compute what changed between two snapshots
///
/// A header is part of the diff if it is new or its value changed. Removed
/// headers are not represented. A cookie is part of the diff if an equal
/// directive was not already present before.
pub fn compute_diff(pre: &ResponseSnapshot, post: &ResponseSnapshot) -> CacheEntry {
    let headers = post
        .headers
        .iter()
        .filter(|(name, value)| pre.headers.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let cookies = post
        .cookies
        .iter()
        .filter(|cookie| !pre.cookies.contains(cookie))
        .cloned()
        .collect();

    CacheEntry {
        headers,
        cookies,
        body: String::new(),
    }
}

impl CacheEntry {
    /// Attach the body chunk produced alongside the diff
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Replay this entry onto a response and return its body chunk
    pub fn apply(&self, response: &mut ResponseAccumulator) -> String {
        for (name, value) in &self.headers {
            response.set_header(name, value);
        }
        for cookie in &self.cookies {
            response.push_cookie(cookie.clone());
        }
        self.body.clone()
    }

    /// Serialize for storage in the cache backend
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize a stored value
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| BouncerError::CodecError(format!("Failed to decode cache entry: {}", e)))
    }
}
