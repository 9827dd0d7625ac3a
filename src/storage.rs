//! Segment persistence.
//!
//! Each session owns one directory under the configured base; segment bodies
//! are written there once under deterministic names and never mutated or
//! deleted afterwards.

use std::path::{Path, PathBuf};

use crate::errors::StorageError;

/// Writes segment bodies into a single session directory.
#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// Open a store rooted at an already-created session directory.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic on-disk name: `p<period>_segment_<seq:06d>.{mp4|m4s}`.
    pub fn segment_filename(period: u32, sequence: u64, is_init: bool) -> String {
        let ext = if is_init { "mp4" } else { "m4s" };
        format!("p{period}_segment_{sequence:06}.{ext}")
    }

    /// Persist one segment body. A failure leaves the session state
    /// untouched.
    pub async fn persist(&self, filename: &str, body: &[u8]) -> Result<(), StorageError> {
        let path = self.dir.join(filename);
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| StorageError::WriteSegment {
                filename: filename.to_string(),
                source,
            })
    }
}

/// Rejects names that could escape a session directory when used as a path
/// component (loopback readers take them straight from the URL).
pub fn is_safe_path_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_zero_padded_and_period_aware() {
        assert_eq!(
            SegmentStore::segment_filename(0, 10, true),
            "p0_segment_000010.mp4"
        );
        assert_eq!(
            SegmentStore::segment_filename(0, 11, false),
            "p0_segment_000011.m4s"
        );
        assert_eq!(
            SegmentStore::segment_filename(3, 1234567, false),
            "p3_segment_1234567.m4s"
        );
    }

    #[tokio::test]
    async fn persist_writes_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().to_path_buf());
        store.persist("p0_segment_000001.m4s", b"moof").await.unwrap();

        let on_disk = std::fs::read(dir.path().join("p0_segment_000001.m4s")).unwrap();
        assert_eq!(on_disk, b"moof");
    }

    #[test]
    fn path_components_are_vetted() {
        assert!(is_safe_path_component("p0_segment_000001.m4s"));
        assert!(is_safe_path_component("key_20260801_101500"));
        assert!(!is_safe_path_component(""));
        assert!(!is_safe_path_component(".."));
        assert!(!is_safe_path_component("a/b"));
        assert!(!is_safe_path_component("a\\b"));
    }
}
