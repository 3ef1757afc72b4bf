//! Untyped pipeline configuration.
//!
//! The pipeline config is YAML loaded into a [`serde_yaml::Value`] tree.
//! [`ConfMap`] wraps the tree with `::`-separated path accessors and the
//! deep merge used to apply converter patches.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

/// Separator between path segments, as in `service::pipelines::traces`.
pub const KEY_DELIMITER: &str = "::";

/// Errors from building or reading a [`ConfMap`].
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfMapError {
    /// The document is not valid YAML.
    #[error("invalid YAML")]
    Parse(#[source] serde_yaml::Error),

    /// The document root is not a mapping.
    #[error("configuration root must be a mapping")]
    NotAMapping,

    /// A subtree does not have the expected shape.
    #[error("invalid configuration at {path}")]
    Decode {
        /// Path of the subtree.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// A configuration tree with path-based access.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfMap {
    root: Mapping,
}

impl ConfMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document. An empty document yields an empty map.
    pub fn from_yaml(source: &str) -> Result<Self, ConfMapError> {
        let value: Value = serde_yaml::from_str(source).map_err(ConfMapError::Parse)?;
        Self::from_value(value)
    }

    /// Wraps an existing value, which must be a mapping or null.
    pub fn from_value(value: Value) -> Result<Self, ConfMapError> {
        match value {
            Value::Mapping(root) => Ok(Self { root }),
            Value::Null => Ok(Self::new()),
            _ => Err(ConfMapError::NotAMapping),
        }
    }

    /// Returns the root mapping.
    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    /// Returns the tree as a value.
    pub fn into_value(self) -> Value {
        Value::Mapping(self.root)
    }

    /// Returns true when the root mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Looks up the value at `path`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(KEY_DELIMITER);
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_mapping()?.get(segment)?;
        }
        Some(current)
    }

    /// Returns the mapping at `path`, if the value there is one.
    pub fn get_mapping(&self, path: &str) -> Option<&Mapping> {
        self.get(path).and_then(Value::as_mapping)
    }

    /// Returns the string keys of the mapping at `path`.
    pub fn keys(&self, path: &str) -> Vec<String> {
        self.get_mapping(path)
            .map(|m| m.keys().filter_map(|k| k.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    /// Returns true when `path` holds a value.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Sets `path` to `value`, creating intermediate mappings and replacing
    /// any non-mapping value in the way.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let segments: Vec<&str> = path.split(KEY_DELIMITER).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut current = &mut self.root;
        for segment in parents {
            let key = Value::from(*segment);
            if !current.get(&key).is_some_and(Value::is_mapping) {
                current.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            current = match current.get_mut(&key) {
                Some(Value::Mapping(next)) => next,
                _ => return,
            };
        }
        current.insert(Value::from(*last), value.into());
    }

    /// Deep-merges `patch` into this map.
    ///
    /// Mappings merge key by key; any other value in the patch, sequences
    /// included, replaces what is there.
    pub fn merge(&mut self, patch: ConfMap) {
        merge_mapping(&mut self.root, patch.root);
    }

    /// Deserializes the subtree at `path` into `T`. A missing subtree
    /// deserializes from null.
    pub fn decode<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfMapError> {
        let value = self.get(path).cloned().unwrap_or(Value::Null);
        serde_yaml::from_value(value).map_err(|source| ConfMapError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// Expands `${env:NAME}` and `${NAME}` in every string scalar using
    /// `lookup`. Unknown names expand to the empty string and `$$` is a
    /// literal `$`.
    pub fn expand_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (_, value) in self.root.iter_mut() {
            expand_value(value, &lookup);
        }
    }
}

fn merge_mapping(target: &mut Mapping, patch: Mapping) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_mapping(existing, incoming)
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

fn expand_value<F>(value: &mut Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) if s.contains('$') => *s = expand_str(s, lookup),
        Value::Sequence(items) => items.iter_mut().for_each(|v| expand_value(v, lookup)),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| expand_value(v, lookup)),
        Value::Tagged(tagged) => expand_value(&mut tagged.value, lookup),
        _ => {}
    }
}

fn expand_str<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$$") {
            out.push('$');
            rest = after;
        } else if let Some(body) = tail.strip_prefix("${")
            && let Some(end) = body.find('}')
        {
            let name = &body[..end];
            let name = name.strip_prefix("env:").unwrap_or(name);
            out.push_str(&lookup(name).unwrap_or_default());
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}
