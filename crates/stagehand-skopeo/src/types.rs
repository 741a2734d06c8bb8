//! Type definitions for skopeo output

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Parsed `skopeo inspect` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspection {
    /// Repository name
    pub name: Option<String>,
    /// Manifest digest
    pub digest: Option<String>,
    /// Tags present in the repository
    #[serde(default, deserialize_with = "null_as_default")]
    pub repo_tags: Vec<String>,
    /// Creation timestamp as reported
    pub created: Option<String>,
    /// Image architecture
    pub architecture: Option<String>,
    /// Image operating system
    pub os: Option<String>,
    /// Image labels
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    /// Layer digests
    #[serde(default, deserialize_with = "null_as_default")]
    pub layers: Vec<String>,
    /// Environment baked into the image
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: Vec<String>,
    /// Everything else skopeo reported
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ImageInspection {
    /// Look up a label
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_collections_become_empty() {
        let inspection: ImageInspection = serde_json::from_str(
            r#"{"Name": "quay.io/some/image", "RepoTags": null, "Labels": null, "Layers": null}"#,
        )
        .unwrap();

        assert!(inspection.repo_tags.is_empty());
        assert!(inspection.labels.is_empty());
        assert!(inspection.layers.is_empty());
        assert_eq!(inspection.label("version"), None);
    }

    #[test]
    fn test_unknown_fields_kept() {
        let inspection: ImageInspection = serde_json::from_str(
            r#"{"Digest": "sha256:abc", "DockerVersion": "24.0.7"}"#,
        )
        .unwrap();

        assert_eq!(inspection.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(
            inspection.extra.get("DockerVersion"),
            Some(&serde_json::Value::String("24.0.7".to_string()))
        );
    }
}
