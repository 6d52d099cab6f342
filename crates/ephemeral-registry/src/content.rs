//! Content storage for object bytes

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Readable object content
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Durable byte storage keyed by an opaque location
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write `reader` to a new location and make it durable before returning.
    /// Fails if the location already exists.
    async fn write(&self, location: &str, reader: &mut (dyn AsyncRead + Send + Unpin))
        -> io::Result<u64>;

    /// Open stored content, `None` if nothing is stored there
    async fn open(&self, location: &str) -> io::Result<Option<ContentReader>>;

    /// Delete stored content. Returns `false` if it was already gone.
    async fn delete(&self, location: &str) -> io::Result<bool>;

    /// Every location currently holding content
    async fn locations(&self) -> io::Result<Vec<String>>;
}

/// Content store backed by one flat directory
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the storage directory exists
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        info!(root = ?self.root, "Content store initialized");
        Ok(())
    }

    fn resolve(&self, location: &str) -> io::Result<PathBuf> {
        let valid = !location.is_empty()
            && location != "."
            && location != ".."
            && !location.contains(|c: char| c == '/' || c == '\\' || c == '\0');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid content location: {:?}", location),
            ));
        }
        Ok(self.root.join(location))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn write(
        &self,
        location: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        let path = self.resolve(location)?;
        if fs::try_exists(&path).await? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("content already stored at {}", location),
            ));
        }

        // Stage under a suffix so a crash never leaves a truncated file at
        // the final location.
        let staging = self.root.join(format!("{}.part", location));
        let result = async {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&staging)
                .await?;
            let written = tokio::io::copy(&mut *reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&staging, &path).await?;
            Ok::<u64, io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => {
                debug!(location, size = written, "Stored content");
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn open(&self, location: &str) -> io::Result<Option<ContentReader>> {
        let path = self.resolve(location)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, location: &str) -> io::Result<bool> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(location, "Deleted content");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn locations(&self) -> io::Result<Vec<String>> {
        let mut locations = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => locations.push(name),
                Err(name) => warn!(?name, "Skipping non UTF-8 file in content store"),
            }
        }
        Ok(locations)
    }
}
