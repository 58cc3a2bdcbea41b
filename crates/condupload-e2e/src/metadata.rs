//! Upload metadata file.
//!
//! The upload tool consumes a JSON document describing where the staged
//! snapshot should land.  The key shape is fixed by the tool; keys are
//! written in sorted order so successive runs diff cleanly.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::HarnessResult;

/// Per-destination-tag entry in the metadata document.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationTag {
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "synchronizeTo")]
    pub synchronize_to: String,
}

/// The metadata document written next to every staged snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    #[serde(rename = "destinationDatabase")]
    pub destination_database: String,
    #[serde(rename = "destinationTags")]
    pub destination_tags: BTreeMap<String, DestinationTag>,
    #[serde(rename = "inputTag")]
    pub input_tag: String,
    pub since: i64,
    #[serde(rename = "userText")]
    pub user_text: String,
}

impl UploadMetadata {
    /// Build the document for one upload.  The destination tag is always
    /// registered with the permissive synchronization target; the campaign
    /// stamps the real mode onto the tag after a CREATE.
    #[must_use]
    pub fn new(
        destination_database: &str,
        input_tag: &str,
        dest_tag: &str,
        since: i64,
        user_text: &str,
    ) -> Self {
        let mut destination_tags = BTreeMap::new();
        destination_tags.insert(
            dest_tag.to_owned(),
            DestinationTag {
                dependencies: BTreeMap::new(),
                synchronize_to: "any".to_owned(),
            },
        );
        Self {
            destination_database: destination_database.to_owned(),
            destination_tags,
            input_tag: input_tag.to_owned(),
            since,
            user_text: user_text.to_owned(),
        }
    }

    /// Write the document as pretty JSON with sorted keys, replacing any
    /// previous file.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Json` on serialization failure or
    /// `HarnessError::Io` on write failure.
    pub fn write(&self, path: &Path) -> HarnessResult<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        // Round-trip through `Value` so the top-level keys come out sorted
        // regardless of struct field order.
        let value = serde_json::to_value(self)?;
        let text = serde_json::to_string_pretty(&value)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_has_the_tool_key_shape() {
        let meta = UploadMetadata::new(
            "oracle://prep/CONDITIONS",
            "source_tag",
            "dest_tag_any",
            200_000,
            "upload #1",
        );
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value["destinationDatabase"], "oracle://prep/CONDITIONS");
        assert_eq!(value["inputTag"], "source_tag");
        assert_eq!(value["since"], 200_000);
        assert_eq!(value["userText"], "upload #1");
        assert_eq!(
            value["destinationTags"]["dest_tag_any"]["synchronizeTo"],
            "any"
        );
        assert!(value["destinationTags"]["dest_tag_any"]["dependencies"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn write_emits_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let meta = UploadMetadata::new("db", "in", "out", 1, "text");
        meta.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let dd = text.find("destinationDatabase").unwrap();
        let dt = text.find("destinationTags").unwrap();
        let it = text.find("inputTag").unwrap();
        let si = text.find("\"since\"").unwrap();
        let ut = text.find("userText").unwrap();
        assert!(dd < dt && dt < it && it < si && si < ut);
    }

    #[test]
    fn write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, "stale").unwrap();
        UploadMetadata::new("db", "in", "out", 1, "t")
            .write(&path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('{'));
    }
}
