//! Pending changesets: local edits not yet acknowledged by the remote.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use arborsync_common::{Error, ObjectKey, Result};

/// A single field edit, in the order it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEdit {
    /// Monotonic sequence number across the whole log.
    pub seq: u64,
    /// Payload field name.
    pub field: String,
    /// New value of the field.
    pub value: serde_json::Value,
    /// When the edit was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Edits of one local object awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Object the edits apply to.
    pub key: ObjectKey,
    /// Field edits in recording order.
    pub edits: Vec<FieldEdit>,
    /// The object has local state that still has to be pushed.
    pub upload_pending: bool,
}

impl Changeset {
    fn new(key: ObjectKey) -> Self {
        Self {
            key,
            edits: Vec::new(),
            upload_pending: true,
        }
    }

    /// Check if there are field edits.
    pub fn has_edits(&self) -> bool {
        !self.edits.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    next_seq: u64,
    changesets: Vec<Changeset>,
}

/// Log of pending changesets, optionally persisted to disk.
pub struct ChangesetLog {
    changesets: HashMap<ObjectKey, Changeset>,
    next_seq: u64,
    registry_path: Option<PathBuf>,
}

impl ChangesetLog {
    /// Create a log that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            changesets: HashMap::new(),
            next_seq: 0,
            registry_path: None,
        }
    }

    /// Open a log persisted under `state_dir`.
    pub async fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir).await?;
        let registry_path = state_dir.join("changesets.json");

        let registry = match fs::read_to_string(&registry_path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Discarding unreadable changeset registry: {}", e);
                Registry::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Registry::default(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            changesets: registry
                .changesets
                .into_iter()
                .map(|c| (c.key.clone(), c))
                .collect(),
            next_seq: registry.next_seq,
            registry_path: Some(registry_path),
        })
    }

    /// Record a field edit. Returns its sequence number.
    pub async fn record(
        &mut self,
        key: &ObjectKey,
        field: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let changeset = self
            .changesets
            .entry(key.clone())
            .or_insert_with(|| Changeset::new(key.clone()));
        changeset.upload_pending = true;
        changeset.edits.push(FieldEdit {
            seq,
            field: field.into(),
            value,
            recorded_at: Utc::now(),
        });

        self.persist().await?;
        Ok(seq)
    }

    /// Mark an object as needing upload without recording a field edit.
    ///
    /// Used for new objects and for payloads that are replaced wholesale.
    pub async fn queue_upload(&mut self, key: &ObjectKey) -> Result<()> {
        self.changesets
            .entry(key.clone())
            .or_insert_with(|| Changeset::new(key.clone()))
            .upload_pending = true;
        self.persist().await
    }

    /// Pending changeset of an object.
    pub fn get(&self, key: &ObjectKey) -> Option<&Changeset> {
        self.changesets.get(key)
    }

    /// Check if an object has state awaiting upload.
    pub fn is_upload_pending(&self, key: &ObjectKey) -> bool {
        self.changesets
            .get(key)
            .map(|c| c.upload_pending)
            .unwrap_or(false)
    }

    /// Drop a changeset after its edits were merged into a committed object.
    pub async fn clear(&mut self, key: &ObjectKey) -> Result<Option<Changeset>> {
        let removed = self.changesets.remove(key);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Abandon pending uploads of an object. The local object is untouched.
    ///
    /// Returns whether anything was pending.
    pub async fn skip_uploads(&mut self, key: &ObjectKey) -> Result<bool> {
        match self.changesets.remove(key) {
            Some(changeset) => {
                debug!(
                    object = %key,
                    edits = changeset.edits.len(),
                    "Skipped pending uploads"
                );
                self.persist().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Put back the changeset of an object as it was before a failed write.
    ///
    /// `None` removes the object's changeset.
    pub async fn restore(&mut self, key: &ObjectKey, previous: Option<Changeset>) -> Result<()> {
        match previous {
            Some(changeset) => {
                self.changesets.insert(key.clone(), changeset);
            }
            None => {
                self.changesets.remove(key);
            }
        }
        self.persist().await
    }

    /// Every pending changeset.
    pub fn pending(&self) -> impl Iterator<Item = &Changeset> {
        self.changesets.values()
    }

    /// Number of pending changesets.
    pub fn len(&self) -> usize {
        self.changesets.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.changesets.is_empty()
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let mut changesets: Vec<Changeset> = self.changesets.values().cloned().collect();
        changesets.sort_by_key(|c| c.edits.first().map(|e| e.seq).unwrap_or(u64::MAX));
        let registry = Registry {
            next_seq: self.next_seq,
            changesets,
        };

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&registry)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
