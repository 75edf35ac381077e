//! Filesystem storage backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use arborsync_common::{Error, LocalObject, ObjectKey, ObjectKind, Result};

use crate::backend::{StorageBackend, StorageChange, StorageEvent, WriteBatch};

const EVENT_CAPACITY: usize = 1024;

/// Filesystem storage backend.
///
/// Stores each object as `<root>/<kind>/<id>.json`. Every file is replaced
/// through a rename, so a reader sees either the old or the new document.
pub struct FileBackend {
    root: PathBuf,
    writer: Mutex<()>,
    events: broadcast::Sender<StorageEvent>,
}

impl FileBackend {
    /// Open a backend rooted at the given directory.
    ///
    /// # Postconditions
    /// - One subdirectory per object kind exists under `root`
    ///
    /// # Errors
    /// - Permission denied
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for kind in ObjectKind::all() {
            fs::create_dir_all(root.join(kind.as_str())).await?;
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            root,
            writer: Mutex::new(()),
            events,
        })
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.root
            .join(key.kind.as_str())
            .join(format!("{}.json", key.id))
    }

    async fn read_object(path: &Path) -> Result<Option<LocalObject>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_object(&self, object: &LocalObject) -> Result<bool> {
        let path = self.object_path(&object.key());
        let existed = fs::try_exists(&path).await?;
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(object)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(existed)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<LocalObject>> {
        Self::read_object(&self.object_path(key)).await
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<LocalObject>> {
        let mut objects = Vec::new();
        let mut entries = fs::read_dir(self.root.join(kind.as_str())).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_object(&path).await {
                Ok(Some(object)) => objects.push(object),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable object: {}", e),
            }
        }

        Ok(objects)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let _writer = self.writer.lock().await;
        let mut emitted = Vec::new();

        for object in batch.puts() {
            let existed = self.write_object(object).await?;
            emitted.push(StorageEvent {
                key: object.key(),
                change: if existed {
                    StorageChange::Updated
                } else {
                    StorageChange::Inserted
                },
            });
        }

        for key in batch.removes() {
            match fs::remove_file(self.object_path(key)).await {
                Ok(()) => emitted.push(StorageEvent {
                    key: key.clone(),
                    change: StorageChange::Removed,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        for key in batch.touches() {
            if fs::try_exists(self.object_path(key)).await? {
                emitted.push(StorageEvent {
                    key: key.clone(),
                    change: StorageChange::Touched,
                });
            }
        }

        debug!(writes = emitted.len(), root = %self.root.display(), "Committed batch to file backend");
        for event in emitted {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
