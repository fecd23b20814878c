//! Watermark storage for connector runs

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Watermark;
use crate::platform::Platform;

/// Get/set the watermark of one connector instance.
///
/// `get` on a connector that never ran yields an empty watermark. `set` must
/// either fully replace the previous record or leave it untouched.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self) -> Result<Watermark>;
    async fn set(&self, watermark: Watermark) -> Result<()>;
}

/// Watermark kept in the platform's connector state
#[derive(Clone)]
pub struct PlatformStateStore {
    platform: Arc<dyn Platform>,
}

impl PlatformStateStore {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl StateStore for PlatformStateStore {
    async fn get(&self) -> Result<Watermark> {
        match self.platform.get_state().await? {
            Some(state) => Ok(serde_json::from_value(state)?),
            None => Ok(Watermark::default()),
        }
    }

    async fn set(&self, watermark: Watermark) -> Result<()> {
        self.platform.set_state(serde_json::to_value(watermark)?).await
    }
}

/// Watermark kept in a local JSON file
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self) -> Result<Watermark> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Watermark::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Watermark::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, watermark: Watermark) -> Result<()> {
        // Write aside, then rename over the target
        let staging = self.staging_path();
        let body = serde_json::to_vec(&watermark)?;

        tokio::fs::write(&staging, &body).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}
