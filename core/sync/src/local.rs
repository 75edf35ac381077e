//! Local mutations that have to be reflected in the tree.
//!
//! Each operation runs under the reconciler's writer lock, updates the
//! storage backend, the link registry and the node table together, and
//! queues the affected objects for upload.

use chrono::Utc;
use tracing::{debug, info};

use arborsync_common::{
    AttachmentData, Error, LocalId, LocalObject, Node, NodeId, ObjectKey, ObjectKind, Payload,
    Permission, Result, UserId,
};
use arborsync_storage::WriteBatch;

use crate::changeset::FieldEdit;
use crate::controller::Reconciler;
use crate::merge;

/// Name of the attachment node below an item.
pub const ATTACHMENT_NODE_NAME: &str = "img";

impl Reconciler {
    /// Create a local object together with a not yet uploaded node.
    ///
    /// `parent` defaults to the owner's root. The payload kind must match
    /// the depth the node will have.
    ///
    /// # Errors
    /// - `NotFound` if the parent is unknown or has no local object
    /// - `InvalidInput` if the payload kind does not fit the position
    pub async fn create_local_object(
        &self,
        owner: &UserId,
        parent: Option<&NodeId>,
        name: &str,
        payload: Payload,
    ) -> Result<(NodeId, LocalObject)> {
        let shared = &self.shared;
        let _writer = shared.writer.lock().await;

        let (parent_id, depth) = {
            let tree = shared.tree.read().await;
            let parent_id = match parent {
                Some(parent) => parent.clone(),
                None => tree
                    .root(owner)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("No root for user {}", owner)))?,
            };
            let record = tree
                .get(&parent_id)
                .ok_or_else(|| Error::NotFound(format!("Unknown parent {}", parent_id)))?;
            if &record.node.owner != owner {
                return Err(Error::InvalidInput(format!(
                    "Parent {} belongs to another user",
                    parent_id
                )));
            }
            (parent_id, record.depth + 1)
        };

        let kind = ObjectKind::from_depth(depth)
            .ok_or_else(|| Error::InvalidInput("Cannot create a root".to_string()))?;
        if payload.kind() != kind {
            return Err(Error::InvalidInput(format!(
                "A {} cannot be created at depth {}",
                payload.kind(),
                depth
            )));
        }

        let parent_key = match kind {
            ObjectKind::Container => None,
            ObjectKind::Item | ObjectKind::Attachment => {
                Some(shared.links.lookup(&parent_id).ok_or_else(|| {
                    Error::NotFound(format!("Parent {} has no local object", parent_id))
                })?)
            }
        };

        let node = Node::child(NodeId::generate(), owner.clone(), parent_id, name, None);
        let object = LocalObject::new(parent_key.as_ref().map(|k| k.id.clone()), payload);
        shared.links.link(&node.id, kind, &object.id)?;

        let mut batch = WriteBatch::new();
        batch.put(object.clone());
        if let Some(parent_key) = parent_key {
            batch.touch(parent_key);
        }
        if let Err(e) = shared.storage.commit(batch).await {
            shared.links.unlink_node(&node.id);
            return Err(e);
        }

        shared.tree.write().await.upsert(node.clone())?;
        shared.changesets.lock().await.queue_upload(&object.key()).await?;
        shared.persist().await?;

        debug!(node_id = %node.id, object = %object.key(), "Created local object");
        Ok((node.id, object))
    }

    /// Apply a field edit to a local object and queue it for upload.
    ///
    /// Returns the edit's sequence number.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    /// - `InvalidInput` if the field is unknown or the value has the wrong type
    pub async fn record_local_edit(
        &self,
        key: &ObjectKey,
        field: &str,
        value: serde_json::Value,
    ) -> Result<u64> {
        let shared = &self.shared;
        let _writer = shared.writer.lock().await;

        let object = shared
            .storage
            .get(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Object {} not found", key)))?;

        let edit = FieldEdit {
            seq: 0,
            field: field.to_string(),
            value: value.clone(),
            recorded_at: Utc::now(),
        };
        let payload = merge::apply_edits(&object.payload, std::slice::from_ref(&edit))
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        // The edit is logged first so a stored edit is never missing from
        // its changeset.
        let mut changesets = shared.changesets.lock().await;
        let previous = changesets.get(key).cloned();
        let seq = changesets.record(key, field, value).await?;

        let mut batch = WriteBatch::new();
        batch.put(LocalObject { payload, ..object });
        if let Err(e) = shared.storage.commit(batch).await {
            changesets.restore(key, previous).await?;
            return Err(e);
        }
        Ok(seq)
    }

    /// Grant and revoke access to a container and everything below it.
    ///
    /// Added users get read and write permission. The container is touched
    /// and its nodes are marked for metadata upload.
    pub async fn modify_share_list(
        &self,
        container_id: &LocalId,
        added: &[UserId],
        removed: &[UserId],
    ) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let shared = &self.shared;
        let _writer = shared.writer.lock().await;

        let key = ObjectKey::new(ObjectKind::Container, container_id.clone());
        let node_id = shared
            .links
            .lookup_node(&key)
            .ok_or_else(|| Error::NotFound(format!("Container {} is not linked", container_id)))?;

        let updated = {
            let mut tree = shared.tree.write().await;
            let mut stack = vec![node_id];
            let mut updated = 0;
            while let Some(id) = stack.pop() {
                stack.extend(tree.children(&id));
                if let Some(record) = tree.get_mut(&id) {
                    let share_list = &mut record.node.share_list;
                    for user in added {
                        share_list.grant(user.clone(), Permission::Read);
                        share_list.grant(user.clone(), Permission::Write);
                    }
                    for user in removed {
                        share_list.revoke(user);
                    }
                    record.metadata_upload_pending = true;
                    updated += 1;
                }
            }
            updated
        };

        shared.storage.touch(&key).await?;
        shared.persist().await?;

        info!(
            container = %container_id,
            added = added.len(),
            removed = removed.len(),
            nodes = updated,
            "Modified share list"
        );
        Ok(())
    }

    /// Set an item's attachment, creating the attachment node if needed.
    ///
    /// # Errors
    /// - `NotFound` if the item is not linked
    /// - `InvalidInput` if `bytes` is empty
    pub async fn set_attachment(&self, item_id: &LocalId, bytes: Vec<u8>) -> Result<NodeId> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("Attachment cannot be empty".to_string()));
        }

        let shared = &self.shared;
        let _writer = shared.writer.lock().await;

        let item_key = ObjectKey::new(ObjectKind::Item, item_id.clone());
        let item_node = shared
            .links
            .lookup_node(&item_key)
            .ok_or_else(|| Error::NotFound(format!("Item {} is not linked", item_id)))?;

        let (owner, existing) = {
            let tree = shared.tree.read().await;
            let item = tree
                .get(&item_node)
                .ok_or_else(|| Error::NotFound(format!("Unknown node {}", item_node)))?;
            (
                item.node.owner.clone(),
                tree.find_child(&item_node, ATTACHMENT_NODE_NAME)
                    .map(|r| r.node.clone()),
            )
        };

        let payload = Payload::Attachment(AttachmentData { bytes });
        let linked = existing
            .as_ref()
            .and_then(|node| shared.links.lookup(&node.id).map(|key| (node.clone(), key)));

        let (node, object, new_link) = match linked {
            Some((node, key)) => {
                let object = LocalObject {
                    id: key.id,
                    parent: Some(item_id.clone()),
                    payload,
                };
                (node, object, false)
            }
            None => {
                let node = existing.unwrap_or_else(|| {
                    Node::child(
                        NodeId::generate(),
                        owner,
                        item_node.clone(),
                        ATTACHMENT_NODE_NAME,
                        None,
                    )
                });
                let object = LocalObject::new(Some(item_id.clone()), payload);
                shared
                    .links
                    .link(&node.id, ObjectKind::Attachment, &object.id)?;
                (node, object, true)
            }
        };

        let key = object.key();
        let mut batch = WriteBatch::new();
        batch.put(object);
        batch.touch(item_key);
        if let Err(e) = shared.storage.commit(batch).await {
            if new_link {
                shared.links.unlink_node(&node.id);
            }
            return Err(e);
        }

        shared.tree.write().await.upsert(node.clone())?;
        shared.changesets.lock().await.queue_upload(&key).await?;
        shared.persist().await?;

        debug!(item = %item_id, node_id = %node.id, "Set attachment");
        Ok(node.id)
    }

    /// Remove an item's attachment. Returns whether there was one.
    pub async fn clear_attachment(&self, item_id: &LocalId) -> Result<bool> {
        let shared = &self.shared;
        let _writer = shared.writer.lock().await;

        let item_key = ObjectKey::new(ObjectKind::Item, item_id.clone());
        let item_node = shared
            .links
            .lookup_node(&item_key)
            .ok_or_else(|| Error::NotFound(format!("Item {} is not linked", item_id)))?;

        let Some(attachment) = shared
            .tree
            .read()
            .await
            .find_child(&item_node, ATTACHMENT_NODE_NAME)
            .map(|r| r.id().clone())
        else {
            return Ok(false);
        };

        let linked: Vec<ObjectKey> = shared
            .tree
            .read()
            .await
            .subtree(&attachment)
            .iter()
            .filter_map(|record| shared.links.lookup(record.id()))
            .collect();

        let mut batch = WriteBatch::new();
        for key in &linked {
            batch.remove(key.clone());
        }
        batch.touch(item_key);
        shared.storage.commit(batch).await?;

        let removed = shared.tree.write().await.remove_subtree(&attachment);
        let mut changesets = shared.changesets.lock().await;
        for record in &removed {
            shared.links.unlink_node(record.id());
        }
        for key in &linked {
            changesets.clear(key).await?;
        }
        drop(changesets);
        shared.persist().await?;

        debug!(item = %item_id, node_id = %attachment, "Cleared attachment");
        Ok(true)
    }
}
