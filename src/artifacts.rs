use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::openai::AnalysisBackend;

/// Resolves a generated chart's remote file id to an inline `data:` URL the
/// browser can render without another round trip.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, file_id: &str) -> Result<String, AppError>;
}

/// Disk-backed fetch-once cache for chart images.
///
/// Remote content is immutable for a given file id, so a disk hit never
/// revalidates. Persisting is best-effort: a failed write still returns the
/// data URL and the next resolve simply fetches again.
pub struct ArtifactCache {
    backend: Arc<dyn AnalysisBackend>,
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(backend: Arc<dyn AnalysisBackend>, dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            dir: dir.into(),
        }
    }

    /// Cache location for a file id. Ids are opaque remote identifiers, so
    /// anything that could walk out of the cache directory is refused.
    fn cache_path(&self, file_id: &str) -> Option<PathBuf> {
        if file_id.is_empty()
            || file_id.contains('/')
            || file_id.contains('\\')
            || file_id.contains("..")
        {
            return None;
        }
        Some(self.dir.join(format!("{file_id}.png")))
    }
}

fn to_data_url(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64_STANDARD.encode(bytes))
}

#[async_trait]
impl ArtifactResolver for ArtifactCache {
    async fn resolve(&self, file_id: &str) -> Result<String, AppError> {
        let path = self
            .cache_path(file_id)
            .ok_or_else(|| AppError::artifact(file_id, "invalid file id"))?;

        if let Ok(bytes) = tokio::fs::read(&path).await {
            debug!(file_id, "Serving chart from disk cache");
            return Ok(to_data_url(&bytes));
        }

        let bytes = self.backend.fetch_file_content(file_id).await?;
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(file_id, "Failed to cache chart to {}: {e}", path.display());
        }
        Ok(to_data_url(&bytes))
    }
}
