//! Compute configuration handed to connectors, plus batch settings loaded via
//! `ortho-config`.
//!
//! A [`ComputeConfig`] is the provider-specific key/value map read from the
//! compute section of a service provider definition. Values arrive as
//! arbitrary JSON scalars and are normalised to strings so adapters only deal
//! with one representation.

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

mod batch;

pub use batch::{
    BatchConfig, BatchConfigError, ConnectSettings, DEFAULT_CONNECT_INTERVAL_SECS,
    DEFAULT_CONNECT_RETRIES,
};

/// Name and human-readable meaning of a required compute key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequiredKey {
    /// Key as it appears in the compute configuration.
    pub name: &'static str,
    /// Description used in error messages.
    pub description: &'static str,
}

impl RequiredKey {
    /// Creates a required key entry.
    #[must_use]
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

/// Errors raised while reading or validating a compute configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// One or more required keys are absent, null, or blank.
    #[error("missing configuration keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),
    /// A key holds a value that cannot be used.
    #[error("invalid value for configuration key '{key}': {message}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Why the value was rejected.
        message: String,
    },
    /// The configuration file could not be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        message: String,
    },
    /// The configuration file is not a JSON object of scalars.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path of the file.
        path: String,
        /// Parser error.
        message: String,
    },
}

/// Provider-specific compute settings as an ordered string map.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct ComputeConfig {
    values: BTreeMap<String, Option<String>>,
}

fn normalise(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(normalise)
                .collect::<Vec<_>>()
                .join(","),
        ),
        other @ Value::Object(_) => Some(other.to_string()),
    }
}

impl From<BTreeMap<String, Value>> for ComputeConfig {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        Self {
            values: raw
                .into_iter()
                .map(|(key, value)| (key, normalise(value)))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ComputeConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), Some(value.into())))
                .collect(),
        }
    }
}

impl ComputeConfig {
    /// Reads a JSON object from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be opened and
    /// [`ConfigError::Parse`] when it is not a JSON object.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let read_error = |message: String| ConfigError::Read {
            path: path.to_string(),
            message,
        };
        let parent = path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| read_error(String::from("path has no file name")))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| read_error(err.to_string()))?;
        let text = dir
            .read_to_string(file_name)
            .map_err(|err| read_error(err.to_string()))?;
        Self::from_json(&text).map_err(|message| ConfigError::Parse {
            path: path.to_string(),
            message,
        })
    }

    /// Parses a JSON object.
    ///
    /// # Errors
    ///
    /// Returns the parser message when `text` is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|err| err.to_string())
    }

    /// Sets `key` to `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), Some(value.into()));
    }

    /// Builder-style [`ComputeConfig::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Value of `key`, treating null and blank values as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(Option::as_deref)
            .filter(|value| !value.trim().is_empty())
    }

    /// Value of a key already checked by [`ComputeConfig::validate`], or an
    /// empty string.
    #[must_use]
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or_default()
    }

    /// Value of `key`, or [`ConfigError::MissingKeys`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKeys`] naming `key` when it is absent.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKeys(vec![key.to_owned()]))
    }

    /// Interprets `key` as a boolean; absent keys are `false`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "1" | "on"
            )
        })
    }

    /// Splits a comma separated value into its non-empty items.
    #[must_use]
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copies the first present alias into `key` when `key` is absent.
    pub fn fill_from_aliases(&mut self, key: &str, aliases: &[&str]) {
        if self.get(key).is_some() {
            return;
        }
        let found = aliases
            .iter()
            .find_map(|alias| self.get(alias))
            .map(str::to_owned);
        if let Some(value) = found {
            self.insert(key, value);
        }
    }

    /// Copies every key of `defaults` that is absent here.
    pub fn fill_missing_from(&mut self, defaults: &Self) {
        for (key, value) in &defaults.values {
            if self.get(key).is_none() && value.is_some() {
                self.values.insert(key.clone(), value.clone());
            }
        }
    }

    /// Checks that every key in `required` is present.
    ///
    /// Each missing key is logged with its description before the error is
    /// returned, so operators see the complete list at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingKeys`] listing every absent key.
    pub fn validate(&self, required: &[RequiredKey]) -> Result<(), ConfigError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|key| self.get(key.name).is_none())
            .inspect(|key| {
                error!(
                    key = key.name,
                    "No value found for configuration key '{}' ({})",
                    key.name,
                    key.description
                );
            })
            .map(|key| key.name.to_owned())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingKeys(missing))
        }
    }
}

#[cfg(test)]
mod tests;
