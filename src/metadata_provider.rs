//! The `MetadataProvider` boundary: stands in for the out-of-scope catalog store + scanner.
//! A play id resolves to zero or more source variants; each variant is probed on demand.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{PlayError, Result};
use crate::probe::{self, SourceMetadata};

/// A decoded play identifier. Token signature verification and the {kind, identifiers,
/// expiry} decode are an external collaborator (the auth token decoder); this crate only
/// needs the resolved play id string to hand to the provider.
#[derive(Debug, Clone)]
pub struct PlayId(pub String);

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Resolve a play id to its known source file paths, by source index.
    async fn source_paths(&self, play_id: &PlayId) -> Result<Vec<PathBuf>>;

    /// Probe one source variant's metadata.
    async fn metadata(&self, play_id: &PlayId, source_index: usize) -> Result<SourceMetadata> {
        let paths = self.source_paths(play_id).await?;
        let path = paths
            .get(source_index)
            .ok_or_else(|| PlayError::NoMetadata(format!("source index {source_index} out of range")))?;
        self.probe_path(path).await
    }

    /// Probe an arbitrary resolved path (used by `metadata`'s default implementation; exposed
    /// so a provider backed by a real catalog can reuse the same probing logic).
    async fn probe_path(&self, path: &std::path::Path) -> Result<SourceMetadata>;
}

/// File-backed provider: a static list of paths per play id, with probing done via the real
/// `probe` subprocess. This is what lets the crate run end-to-end against real media without
/// a database.
pub struct FileMetadataProvider {
    probe_path: PathBuf,
    sources: dashmap::DashMap<String, Vec<PathBuf>>,
}

impl FileMetadataProvider {
    pub fn new(probe_path: PathBuf) -> Self {
        Self {
            probe_path,
            sources: dashmap::DashMap::new(),
        }
    }

    /// Register the known source files for a play id (in lieu of a real catalog lookup).
    pub fn register(&self, play_id: &str, paths: Vec<PathBuf>) {
        self.sources.insert(play_id.to_string(), paths);
    }
}

#[async_trait]
impl MetadataProvider for FileMetadataProvider {
    async fn source_paths(&self, play_id: &PlayId) -> Result<Vec<PathBuf>> {
        self.sources
            .get(&play_id.0)
            .map(|e| e.clone())
            .ok_or_else(|| PlayError::NoMetadata(format!("unknown play id {}", play_id.0)))
    }

    async fn probe_path(&self, path: &std::path::Path) -> Result<SourceMetadata> {
        probe::probe_file(&self.probe_path, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_play_id_is_no_metadata() {
        let provider = FileMetadataProvider::new(PathBuf::from("ffprobe"));
        let err = provider
            .source_paths(&PlayId("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, PlayError::NoMetadata(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_source_index() {
        let provider = FileMetadataProvider::new(PathBuf::from("ffprobe"));
        provider.register("show-1", vec![PathBuf::from("/media/a.mkv")]);
        let err = provider
            .metadata(&PlayId("show-1".to_string()), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayError::NoMetadata(_)));
    }
}
