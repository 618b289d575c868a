//! Equality-based label selection
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, iter::FromIterator, str::FromStr};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;

const MAX_NAME_LENGTH: usize = 63;
const MAX_PREFIX_LENGTH: usize = 253;

/// A label selector as it is persisted on objects
///
/// Only `matchLabels` is supported, every pair is a required exact match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Required key=value pairs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: Map,
}

/// Reasons a selector is rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// A key is not a qualified name
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key
        key: String,
        /// What is wrong with it
        reason: &'static str,
    },
    /// A value is not a valid label value
    #[error("invalid value {value:?} for label key {key:?}: {reason}")]
    InvalidValue {
        /// The key the value belongs to
        key: String,
        /// The offending value
        value: String,
        /// What is wrong with it
        reason: &'static str,
    },
    /// A selector string could not be parsed
    #[error("unable to parse selector requirement {0:?}, expected key=value")]
    Parse(String),
}

/// Perform selection on a set of required label pairs
///
/// AND semantics over exact string equality. An empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Map);

impl Selector {
    /// Convert a selector to its `k1=v1,k2=v2` string form
    pub fn to_selector_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Indicates whether this label selector matches everything
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the given label set contains every required pair
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Add a requirement, replacing any previous requirement on the same key
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Check every key and value against the label syntax rules
    pub fn validate(&self) -> Result<(), SelectorError> {
        for (key, value) in &self.0 {
            validate_key(key)?;
            validate_value(key, value)?;
        }
        Ok(())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

fn check_name(name: &str) -> Result<(), &'static str> {
    if name.len() > MAX_NAME_LENGTH {
        return Err("must be no more than 63 characters");
    }
    if !name.chars().all(is_name_char) {
        return Err("must consist of alphanumeric characters, '-', '_' or '.'");
    }
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err("must start and end with an alphanumeric character");
    }
    Ok(())
}

fn check_prefix(prefix: &str) -> Result<(), &'static str> {
    if prefix.len() > MAX_PREFIX_LENGTH {
        return Err("prefix must be no more than 253 characters");
    }
    let valid_segment = |s: &str| {
        !s.is_empty()
            && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !s.starts_with('-')
            && !s.ends_with('-')
    };
    if prefix.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err("prefix must be a lowercase DNS subdomain")
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason| SelectorError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            check_prefix(prefix).map_err(invalid)?;
            name
        }
        None => key,
    };
    if name.is_empty() {
        return Err(invalid("name part must be non-empty"));
    }
    check_name(name).map_err(invalid)
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    check_name(value).map_err(|reason| SelectorError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    })
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector_string())
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|req| !req.is_empty())
            .map(|req| {
                let (k, v) = req
                    .split_once('=')
                    .ok_or_else(|| SelectorError::Parse(req.to_string()))?;
                Ok((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl From<LabelSelector> for Selector {
    fn from(value: LabelSelector) -> Self {
        Self(value.match_labels)
    }
}

impl From<&LabelSelector> for Selector {
    fn from(value: &LabelSelector) -> Self {
        Self(value.match_labels.clone())
    }
}

impl From<Selector> for LabelSelector {
    fn from(value: Selector) -> Self {
        LabelSelector { match_labels: value.0 }
    }
}
