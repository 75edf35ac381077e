//! Storage backend trait definition.

use async_trait::async_trait;
use tokio::sync::broadcast;

use arborsync_common::{LocalObject, ObjectKey, ObjectKind, Result};

/// What happened to an object in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageChange {
    Inserted,
    Updated,
    Removed,
    /// Unchanged, but observers should refresh.
    Touched,
}

/// Change notification emitted after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: ObjectKey,
    pub change: StorageChange,
}

/// A set of writes applied as one read-write transaction.
///
/// Puts are applied first, then removals, then touches. Touching a key that
/// does not exist after the puts and removals is ignored.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    puts: Vec<LocalObject>,
    removes: Vec<ObjectKey>,
    touches: Vec<ObjectKey>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object.
    pub fn put(&mut self, object: LocalObject) -> &mut Self {
        self.puts.push(object);
        self
    }

    /// Remove an object.
    pub fn remove(&mut self, key: ObjectKey) -> &mut Self {
        self.removes.push(key);
        self
    }

    /// Notify observers of an object without changing it.
    pub fn touch(&mut self, key: ObjectKey) -> &mut Self {
        if !self.touches.contains(&key) {
            self.touches.push(key);
        }
        self
    }

    pub fn puts(&self) -> &[LocalObject] {
        &self.puts
    }

    pub fn removes(&self) -> &[ObjectKey] {
        &self.removes
    }

    pub fn touches(&self) -> &[ObjectKey] {
        &self.touches
    }

    /// Check if the batch holds no work.
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty() && self.touches.is_empty()
    }
}

/// Local persistent store for domain objects.
///
/// Implementations serialize commits through a single writer. Reads may run
/// concurrently with a commit and observe either the state before or after it,
/// never a partial batch.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read one object.
    async fn get(&self, key: &ObjectKey) -> Result<Option<LocalObject>>;

    /// Read every object of a kind.
    async fn list(&self, kind: ObjectKind) -> Result<Vec<LocalObject>>;

    /// Apply a batch of writes as one transaction.
    ///
    /// # Postconditions
    /// - Either every write in the batch is visible or none is
    /// - One `StorageEvent` is broadcast per applied write
    ///
    /// # Errors
    /// - I/O or serialization failure of the underlying store
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Emit a change notification for an object without modifying it.
    async fn touch(&self, key: &ObjectKey) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.touch(key.clone());
        self.commit(batch).await
    }

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use arborsync_common::{ContainerData, LocalId, Payload};

    #[test]
    fn test_batch_deduplicates_touches() {
        let key = ObjectKey::new(ObjectKind::Container, LocalId::new("c1").unwrap());
        let mut batch = WriteBatch::new();
        batch.touch(key.clone()).touch(key.clone());
        assert_eq!(batch.touches().len(), 1);
    }

    #[test]
    fn test_batch_is_empty() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.put(LocalObject::new(
            None,
            Payload::Container(ContainerData {
                name: "Inbox".to_string(),
            }),
        ));
        assert!(!batch.is_empty());
        assert_eq!(batch.puts().len(), 1);
    }
}
