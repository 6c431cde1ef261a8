use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Storage trait for received payloads.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Move a fully received payload to its permanent home and return the
    /// final location. `received` is consumed on success.
    async fn persist(&self, name: &str, received: &Path) -> Result<PathBuf>;
}

/// Local filesystem-based storage implementation.
#[derive(Clone)]
pub struct LocalStorage {
    incoming_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let incoming_dir = base_dir.join("incoming");
        std::fs::create_dir_all(&incoming_dir)
            .context("Failed to create incoming directory")?;

        Ok(Self { incoming_dir })
    }

    pub fn incoming_dir(&self) -> &Path {
        &self.incoming_dir
    }

    /// Only the last path component of a peer-supplied name is used.
    fn destination(&self, name: &str) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .filter(|n| *n != "." && *n != "..")
            .ok_or_else(|| anyhow!("Invalid resource name {:?}", name))?;
        Ok(self.incoming_dir.join(file_name))
    }

    /// Hidden sibling the payload lands in before it takes the final name.
    fn landing(&self, destination: &Path) -> PathBuf {
        let file_name = destination.file_name().unwrap_or_default().to_string_lossy();
        self.incoming_dir.join(format!(".{}.incoming", file_name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn persist(&self, name: &str, received: &Path) -> Result<PathBuf> {
        let destination = self.destination(name)?;
        let landing = self.landing(&destination);

        // Staging may live on another filesystem
        if let Err(err) = fs::rename(received, &landing).await {
            tracing::debug!("Rename of {} failed ({}), copying instead", received.display(), err);
            if let Err(err) = fs::copy(received, &landing).await {
                discard(&landing).await;
                return Err(err)
                    .with_context(|| format!("Failed to move {} into storage", received.display()));
            }
            if let Err(err) = fs::remove_file(received).await {
                tracing::warn!("Could not remove staged {}: {}", received.display(), err);
            }
        }

        // Replaces an earlier file of the same name in one step
        if let Err(err) = fs::rename(&landing, &destination).await {
            discard(&landing).await;
            return Err(err)
                .with_context(|| format!("Failed to replace {}", destination.display()));
        }

        tracing::debug!("Stored {} at {}", name, destination.display());
        Ok(destination)
    }
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Could not remove {}: {}", path.display(), err);
        }
    }
}
