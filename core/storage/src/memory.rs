//! In-memory storage backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

use arborsync_common::{LocalObject, ObjectKey, ObjectKind, Result};

use crate::backend::{StorageBackend, StorageChange, StorageEvent, WriteBatch};

const EVENT_CAPACITY: usize = 1024;

/// In-memory storage backend.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<ObjectKey, LocalObject>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, LocalObject>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, LocalObject>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<LocalObject>> {
        Ok(self.read().get(key).cloned())
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<LocalObject>> {
        Ok(self
            .read()
            .values()
            .filter(|object| object.kind() == kind)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut emitted = Vec::new();
        {
            // The write guard is the single writer; readers see the batch all at once.
            let mut objects = self.write();

            for object in batch.puts() {
                let key = object.key();
                let change = if objects.insert(key.clone(), object.clone()).is_some() {
                    StorageChange::Updated
                } else {
                    StorageChange::Inserted
                };
                emitted.push(StorageEvent { key, change });
            }

            for key in batch.removes() {
                if objects.remove(key).is_some() {
                    emitted.push(StorageEvent {
                        key: key.clone(),
                        change: StorageChange::Removed,
                    });
                }
            }

            for key in batch.touches() {
                if objects.contains_key(key) {
                    emitted.push(StorageEvent {
                        key: key.clone(),
                        change: StorageChange::Touched,
                    });
                }
            }
        }

        debug!(writes = emitted.len(), "Committed batch to memory backend");
        for event in emitted {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
