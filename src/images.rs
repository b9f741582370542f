use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository root of every sandbox image; the full reference shape is
/// `matryoshka/<language>:<os>-<arch>`.
pub const IMAGE_ROOT: &str = "matryoshka";

pub const FILTER_LANGUAGE: &str = "language";
pub const FILTER_OPERATING_SYSTEM: &str = "operating_system";
pub const FILTER_ARCHITECTURE: &str = "architecture";

/// Selection criteria for image listings. Keys are case-folded; absent keys
/// become `*` wildcards in the engine reference pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFilter(HashMap<String, Vec<String>>);

impl ImageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, val: impl Into<String>) {
        self.0
            .entry(key.to_lowercase())
            .or_default()
            .push(val.into());
    }

    pub fn set(&mut self, key: &str, val: impl Into<String>) {
        self.0.insert(key.to_lowercase(), vec![val.into()]);
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_lowercase())
            .and_then(|vals| vals.first())
            .map(String::as_str)
    }

    pub fn delete(&mut self, key: &str) {
        self.0.remove(&key.to_lowercase());
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_lowercase())
    }

    /// The engine reference pattern this filter selects,
    /// `matryoshka/<language?>:<os?>-<arch?>` with `*` for missing fields.
    /// Values are lowercased before matching.
    pub fn reference_pattern(&self) -> String {
        let field = |key: &str| {
            self.get(key)
                .filter(|val| !val.is_empty())
                .map(str::to_lowercase)
                .unwrap_or_else(|| "*".to_owned())
        };
        format!(
            "{IMAGE_ROOT}/{}:{}-{}",
            field(FILTER_LANGUAGE),
            field(FILTER_OPERATING_SYSTEM),
            field(FILTER_ARCHITECTURE)
        )
    }
}

/// Strips the digest algorithm prefix from an engine image id, exposing only
/// the hex part of `sha256:<hex>` forms.
pub fn normalize_image_id(id: &str) -> &str {
    match id.split_once(':') {
        Some((_, hex)) => hex,
        None => id,
    }
}

/// One sandbox image as the engine reports it. Identity is
/// `<repository>:<tag>`; the repository carries the language and the tag
/// carries the OS and architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub size: i64,
}

impl ImageSummary {
    /// The full image reference, `<repository>:<tag>`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// The language component of the repository, empty when the repository
    /// has no `<root>/<language>` shape.
    pub fn language(&self) -> &str {
        self.repository.split('/').nth(1).unwrap_or("")
    }

    /// The OS component of the tag.
    pub fn operating_system(&self) -> &str {
        self.tag.split('-').next().unwrap_or("")
    }

    /// The architecture component of the tag, empty when the tag has no
    /// `<os>-<arch>` shape.
    pub fn architecture(&self) -> &str {
        self.tag.split('-').nth(1).unwrap_or("")
    }

    /// The id truncated to 12 hex characters for plain output.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keys_are_case_folded() {
        let mut filter = ImageFilter::new();
        filter.add("HELLO", "world");
        filter.add("hello", "darkness");
        assert_eq!(filter.get("Hello"), Some("world"));
        assert!(filter.has("hellO"));

        filter.set("hello", "there");
        assert_eq!(filter.get("HELLO"), Some("there"));

        filter.delete("HeLLo");
        assert_eq!(filter.get("hello"), None);
        assert!(!filter.has("hello"));
    }

    #[test]
    fn reference_pattern_wildcards_missing_fields() {
        let mut filter = ImageFilter::new();
        assert_eq!(filter.reference_pattern(), "matryoshka/*:*-*");

        filter.set(FILTER_LANGUAGE, "Go");
        assert_eq!(filter.reference_pattern(), "matryoshka/go:*-*");

        filter.set(FILTER_OPERATING_SYSTEM, "debian");
        filter.set(FILTER_ARCHITECTURE, "AMD64");
        assert_eq!(filter.reference_pattern(), "matryoshka/go:debian-amd64");
    }

    #[test]
    fn name_and_projections_roundtrip() {
        let image = ImageSummary {
            id: "1a2b3c4d5e6f7890".to_owned(),
            repository: "matryoshka/golang".to_owned(),
            tag: "debian-amd64".to_owned(),
            created_at: DateTime::parse_from_rfc3339("2011-03-02T22:11:00Z")
                .unwrap()
                .with_timezone(&Utc),
            size: 630_600_000,
        };
        assert_eq!(image.name(), "matryoshka/golang:debian-amd64");
        assert_eq!(image.language(), "golang");
        assert_eq!(image.operating_system(), "debian");
        assert_eq!(image.architecture(), "amd64");
        assert_eq!(image.short_id(), "1a2b3c4d5e6f");
    }

    #[test]
    fn projections_tolerate_flat_shapes() {
        let image = ImageSummary {
            id: "ab".to_owned(),
            repository: "plainrepo".to_owned(),
            tag: "latest".to_owned(),
            created_at: Utc::now(),
            size: 0,
        };
        assert_eq!(image.language(), "");
        assert_eq!(image.operating_system(), "latest");
        assert_eq!(image.architecture(), "");
        assert_eq!(image.short_id(), "ab");
    }

    #[test]
    fn image_id_prefix_is_stripped() {
        assert_eq!(normalize_image_id("sha256:deadbeef"), "deadbeef");
        assert_eq!(normalize_image_id("deadbeef"), "deadbeef");
    }
}
