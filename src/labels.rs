//! Label identifiers and the ordered label set the orchestrator sizes and downloads.
//!
//! Labels come from configuration loaded outside the orchestrator and are
//! immutable for the duration of a run. A [`LabelSource`] abstracts where
//! they come from (inline values, a JSON file).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Opaque identifier naming a group of remote assets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Creates a label, rejecting blank identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::Empty`] if the value is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self, LabelError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(LabelError::Empty);
        }
        Ok(Self(value))
    }

    /// Returns the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors raised while building or loading a label set.
#[derive(Debug, Error)]
pub enum LabelError {
    /// A label was empty or whitespace only.
    #[error("label must not be empty")]
    Empty,

    /// The same label appeared twice.
    #[error("duplicate label '{0}'")]
    Duplicate(String),

    /// The label file could not be read.
    #[error("failed to read label file {}", .path.display())]
    Io {
        /// Path of the label file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The label file was not valid JSON of the expected shape.
    #[error("failed to parse label file {}", .path.display())]
    Parse {
        /// Path of the label file.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Ordered collection of distinct labels.
///
/// Issuance order of the per-label operations follows this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    /// Builds a set from raw strings, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::Empty`] for a blank entry and
    /// [`LabelError::Duplicate`] when an entry repeats.
    pub fn new<I, S>(values: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut labels = Vec::new();
        for value in values {
            let label = Label::new(value)?;
            if !seen.insert(label.clone()) {
                return Err(LabelError::Duplicate(label.0));
            }
            labels.push(label);
        }
        Ok(Self { labels })
    }

    /// Parses the JSON label file format `{ "labels": ["a", "b"] }`.
    ///
    /// # Errors
    ///
    /// Returns [`LabelError::Parse`] on malformed JSON, or a validation error
    /// from [`LabelSet::new`].
    pub fn from_json_str(raw: &str, path: &Path) -> Result<Self, LabelError> {
        let file: LabelFile = serde_json::from_str(raw).map_err(|source| LabelError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(file.labels)
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if the set holds no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterates labels in configured order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.labels.iter()
    }

    /// Labels as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Label] {
        &self.labels
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.labels.iter()
    }
}

#[derive(Debug, Deserialize)]
struct LabelFile {
    labels: Vec<String>,
}

/// Source of the label configuration.
///
/// Uses `async_trait` so sources can be held as `Box<dyn LabelSource>`.
#[async_trait]
pub trait LabelSource: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Loads the label set.
    async fn load(&self) -> Result<LabelSet, LabelError>;
}

/// Labels supplied inline (CLI flags or config values).
#[derive(Debug, Clone)]
pub struct StaticLabelSource {
    values: Vec<String>,
}

impl StaticLabelSource {
    /// Creates a source over the given raw values.
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl LabelSource for StaticLabelSource {
    fn describe(&self) -> String {
        format!("inline ({} labels)", self.values.len())
    }

    async fn load(&self) -> Result<LabelSet, LabelError> {
        LabelSet::new(self.values.iter().cloned())
    }
}

/// Labels read from a JSON file.
#[derive(Debug, Clone)]
pub struct FileLabelSource {
    path: PathBuf,
}

impl FileLabelSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LabelSource for FileLabelSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<LabelSet, LabelError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| LabelError::Io {
                path: self.path.clone(),
                source,
            })?;
        let labels = LabelSet::from_json_str(&raw, &self.path)?;
        debug!(count = labels.len(), "loaded labels");
        Ok(labels)
    }
}
