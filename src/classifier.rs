//! Device classification from user-agent strings
//!
//! The caching layer treats classification as a black box behind the
//! [`Classifier`] trait. [`RuleClassifier`] is the bundled implementation:
//! an ordered list of substring rules, first match wins.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of classifying a user-agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device identifier (e.g., "apple_iphone")
    pub id: String,
    /// Capability attributes (e.g., `tier` -> `high`)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceDescriptor {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Maps a user-agent string to a device descriptor
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, user_agent: &str) -> Result<DeviceDescriptor>;
}

/// One classification rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Device identifier reported on match
    pub id: String,
    /// Case-insensitive substrings; any one of them matches
    pub match_any: Vec<String>,
    /// Attributes of the matched device
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DeviceRule {
    fn matches(&self, user_agent_lower: &str) -> bool {
        self.match_any
            .iter()
            .any(|needle| user_agent_lower.contains(&needle.to_ascii_lowercase()))
    }
}

/// Classifier driven by an ordered list of substring rules
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<DeviceRule>,
    fallback: DeviceDescriptor,
}

impl Default for RuleClassifier {
    fn default() -> Self {
        RuleClassifier::new(default_rules())
    }
}

impl RuleClassifier {
    /// Create a classifier from rules, falling back to a generic low-tier device
    pub fn new(rules: Vec<DeviceRule>) -> Self {
        RuleClassifier {
            rules,
            fallback: DeviceDescriptor::new("generic").with_attribute("tier", "low"),
        }
    }

    /// Replace the descriptor reported when no rule matches
    pub fn with_fallback(mut self, fallback: DeviceDescriptor) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn rules(&self) -> &[DeviceRule] {
        &self.rules
    }

    /// Synchronous lookup used by the async trait method
    pub fn lookup(&self, user_agent: &str) -> DeviceDescriptor {
        let lowered = user_agent.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| DeviceDescriptor {
                id: rule.id.clone(),
                attributes: rule.attributes.clone(),
            })
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, user_agent: &str) -> Result<DeviceDescriptor> {
        Ok(self.lookup(user_agent))
    }
}

fn rule(id: &str, match_any: &[&str], tier: &str, category: &str) -> DeviceRule {
    DeviceRule {
        id: id.to_string(),
        match_any: match_any.iter().map(|s| s.to_string()).collect(),
        attributes: [
            ("tier".to_string(), tier.to_string()),
            ("category".to_string(), category.to_string()),
        ]
        .into(),
    }
}

/// Built-in rules used when the configuration does not provide any
pub fn default_rules() -> Vec<DeviceRule> {
    vec![
        rule("apple_iphone", &["iPhone", "iPod"], "high", "smart"),
        rule("apple_ipad", &["iPad"], "high", "tablet"),
        rule("generic_android", &["Android"], "high", "smart"),
        rule("nokia_generic", &["Nokia", "SymbianOS"], "medium", "mobi"),
        rule("blackberry_generic", &["BlackBerry"], "medium", "mobi"),
        rule("generic_midp", &["MIDP", "CLDC"], "medium", "mobi"),
    ]
}
