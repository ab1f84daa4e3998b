use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Free-form data attached to a known plate, e.g. `{"owner": "John"}`.
pub type Metadata = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read known plates: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid known plates JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Known plates must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("Metadata for plate '{0}' must be an object or null")]
    InvalidEntry(String),
}

/// Read-only set of known plates, keyed by uppercase plate text.
///
/// The registry is built once at startup and never mutated afterwards, so it
/// can be shared behind an `Arc` and read from any number of uploads at once.
#[derive(Debug, Clone, Default)]
pub struct PlateRegistry {
    plates: HashMap<String, Metadata>,
}

impl PlateRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the registry from the configured sources.
    ///
    /// A readable, well-formed file wins. Otherwise the inline JSON is tried,
    /// and if that is missing or broken too the registry is empty. Problems
    /// are logged, never returned: the server has to start regardless.
    pub fn load(file: Option<&Path>, inline: Option<&str>) -> Self {
        if let Some(path) = file {
            if path.exists() {
                match std::fs::read_to_string(path)
                    .map_err(RegistryError::from)
                    .and_then(|content| Self::from_json(&content))
                {
                    Ok(registry) => {
                        info!(
                            "Loaded {} known plates from {}",
                            registry.len(),
                            path.display()
                        );
                        return registry;
                    }
                    Err(e) => error!(
                        "Failed to load known plates from {}: {}",
                        path.display(),
                        e
                    ),
                }
            } else {
                warn!("Known plates file not found: {}", path.display());
            }
        }

        if let Some(content) = inline.filter(|c| !c.trim().is_empty()) {
            match Self::from_json(content) {
                Ok(registry) => {
                    info!(
                        "Loaded {} known plates from KNOWN_PLATES env var",
                        registry.len()
                    );
                    return registry;
                }
                Err(e) => warn!("Failed to parse KNOWN_PLATES env var: {}", e),
            }
        }

        Self::empty()
    }

    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let entries = match serde_json::from_str::<Value>(content)? {
            Value::Object(entries) => entries,
            other => return Err(RegistryError::NotAnObject(json_type(&other))),
        };

        let mut plates = HashMap::with_capacity(entries.len());
        for (plate, value) in entries {
            let metadata = match value {
                Value::Object(metadata) => metadata,
                Value::Null => Metadata::new(),
                _ => return Err(RegistryError::InvalidEntry(plate)),
            };
            let key = normalize_plate(&plate);
            if plates.insert(key, metadata).is_some() {
                debug!("Duplicate known plate '{}', keeping the last entry", plate);
            }
        }

        Ok(Self { plates })
    }

    pub fn lookup(&self, plate: &str) -> Option<&Metadata> {
        self.plates.get(&normalize_plate(plate))
    }

    pub fn is_known(&self, plate: &str) -> bool {
        self.lookup(plate).is_some()
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }
}

/// Canonical plate text: whitespace removed, uppercased.
///
/// Both registry keys and recognized plates go through this, so `ab 123`
/// read off a camera matches an `AB123` or `AB 123` entry.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lookup_ignores_case() {
        let registry =
            PlateRegistry::from_json(r#"{"abc123": {"owner": "John"}, "XYZ789": {}}"#).unwrap();

        for variant in ["ABC123", "abc123", "aBc123", " Abc123 "] {
            let metadata = registry.lookup(variant).expect("plate should be known");
            assert_eq!(metadata["owner"], "John");
        }
        assert!(registry.is_known("xyz789"));
        assert!(!registry.is_known("XYZ780"));
    }

    #[test]
    fn test_lookup_ignores_whitespace() {
        let registry = PlateRegistry::from_json(r#"{"AB 123": {"owner": "John"}}"#).unwrap();

        for variant in ["AB123", "ab 123", "ab\t12 3"] {
            assert_eq!(registry.lookup(variant).unwrap()["owner"], "John");
        }
        assert_eq!(normalize_plate(" ab c\n123 "), "ABC123");
    }

    #[test]
    fn test_null_metadata_is_empty() {
        let registry = PlateRegistry::from_json(r#"{"ABC123": null}"#).unwrap();
        assert_eq!(registry.lookup("abc123"), Some(&Metadata::new()));
    }

    #[test]
    fn test_rejects_non_object_sources() {
        assert!(matches!(
            PlateRegistry::from_json(r#"["ABC123"]"#),
            Err(RegistryError::NotAnObject("an array"))
        ));
        assert!(matches!(
            PlateRegistry::from_json(r#"{"ABC123": "John"}"#),
            Err(RegistryError::InvalidEntry(plate)) if plate == "ABC123"
        ));
        assert!(matches!(
            PlateRegistry::from_json("{not json"),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn test_load_without_sources_is_empty() {
        let registry = PlateRegistry::load(None, None);
        assert!(registry.is_empty());
        assert!(!registry.is_known("ABC123"));
        assert!(PlateRegistry::load(None, Some("  ")).is_empty());
    }

    #[test]
    fn test_load_malformed_inline_falls_back_to_empty() {
        let registry = PlateRegistry::load(None, Some(r#"{"ABC123": {"#));
        assert!(registry.is_empty());
        assert!(!registry.is_known("ABC123"));
    }

    #[test]
    fn test_file_takes_precedence_over_inline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"FILE01": {{"source": "file"}}}}"#).unwrap();

        let registry = PlateRegistry::load(Some(file.path()), Some(r#"{"INLINE01": {}}"#));
        assert!(registry.is_known("file01"));
        assert!(!registry.is_known("INLINE01"));
    }

    #[test]
    fn test_missing_or_broken_file_falls_back_to_inline() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("plates.json");
        let registry = PlateRegistry::load(Some(&missing), Some(r#"{"INLINE01": {}}"#));
        assert!(registry.is_known("INLINE01"));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "[1, 2, 3]").unwrap();
        let registry = PlateRegistry::load(Some(&broken), Some(r#"{"INLINE01": {}}"#));
        assert!(registry.is_known("inline01"));
        assert_eq!(registry.len(), 1);
    }
}
