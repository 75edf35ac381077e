mod common;

use serde_json::json;

use arborsync_common::{ConflictKind, Error, Node, NodeChange, ObjectKind, Payload, Priority};
use arborsync_storage::{StorageBackend, StorageChange};
use arborsync_sync::{
    ConflictPolicies, ConflictPolicy, DeletePolicy, NodeState, ReconcilerConfig,
    ATTACHMENT_NODE_NAME,
};
use common::{container_payload, item_payload, Harness};

async fn synced_list(h: &Harness) -> (Node, Node) {
    let list = h.container("groceries", "Groceries");
    let milk = h.item("milk", &list, "Milk");
    h.discover(&list).await;
    h.discover(&milk).await;
    h.settle().await;
    (list, milk)
}

#[tokio::test]
async fn container_conflict_skips_the_upload() {
    let h = Harness::new().await;
    let (list, _) = synced_list(&h).await;

    let key = h.key(&list.id);
    h.reconciler
        .record_local_edit(&key, "name", json!("Shopping"))
        .await
        .unwrap();

    h.conflict(&list, ConflictKind::Data).await;
    h.settle().await;

    assert!(h.reconciler.pending_changeset(&key).await.is_none());
    assert_eq!(h.object(&list.id).await.payload, container_payload("Shopping"));
    assert_eq!(h.remote.fetch_count(&list.id), 1);
    assert_eq!(h.reconciler.node_state(&list.id).await, NodeState::Linked);
}

#[tokio::test]
async fn item_conflict_merges_local_edits_into_remote() {
    let h = Harness::new().await;
    let (_, milk) = synced_list(&h).await;

    let key = h.key(&milk.id);
    h.reconciler
        .record_local_edit(&key, "priority", json!("low"))
        .await
        .unwrap();

    let milk_v2 = h.republish(&milk, &item_payload("Oat milk"));
    h.remote.hold(&milk.id);
    h.conflict(&milk_v2, ConflictKind::Data).await;
    assert_eq!(h.reconciler.node_state(&milk.id).await, NodeState::Conflicted);

    h.remote.release(&milk.id);
    h.settle().await;

    let data = h.item_data(&milk.id).await;
    assert_eq!(data.title, "Oat milk");
    assert_eq!(data.priority, Priority::Low);
    assert_eq!(h.remote.fetch_count(&milk.id), 2);
    assert_eq!(h.reconciler.node_state(&milk.id).await, NodeState::Linked);
    assert!(h.reconciler.pending_changeset(&key).await.is_none());
}

#[tokio::test]
async fn attachment_conflict_overwrites_local_bytes() {
    let h = Harness::new().await;
    let (_, milk) = synced_list(&h).await;
    let item_id = h.key(&milk.id).id;

    let node_id = h
        .reconciler
        .set_attachment(&item_id, b"local photo".to_vec())
        .await
        .unwrap();
    let key = h.key(&node_id);
    assert!(h.reconciler.pending_changeset(&key).await.unwrap().upload_pending);

    let local = Node::child(
        node_id.clone(),
        h.user.clone(),
        milk.id.clone(),
        ATTACHMENT_NODE_NAME,
        None,
    );
    let version = h.remote.publish(&node_id, b"remote photo".to_vec());
    let remote = Node {
        version: Some(version),
        ..local
    };
    h.conflict(&remote, ConflictKind::Data).await;
    h.settle().await;

    match h.object(&node_id).await.payload {
        Payload::Attachment(data) => assert_eq!(data.bytes, b"remote photo"),
        other => panic!("expected an attachment, got {:?}", other),
    }
    assert!(h.reconciler.pending_changeset(&key).await.is_none());
    assert_eq!(h.key(&node_id), key);
}

#[tokio::test]
async fn attachment_conflict_overwrites_bytes_at_the_merged_marker() {
    let h = Harness::new().await;
    let (_, milk) = synced_list(&h).await;
    let photo = h.attachment("milk-photo", &milk, b"remote photo");
    h.discover(&photo).await;
    h.reconciler.fetch_attachment(&photo.id).await.unwrap();

    let item_id = h.key(&milk.id).id;
    h.reconciler
        .set_attachment(&item_id, b"local photo".to_vec())
        .await
        .unwrap();

    // Same marker as the merged one: the local replacement must still go.
    h.conflict(&photo, ConflictKind::Data).await;
    h.settle().await;

    match h.object(&photo.id).await.payload {
        Payload::Attachment(data) => assert_eq!(data.bytes, b"remote photo"),
        other => panic!("expected an attachment, got {:?}", other),
    }
    assert_eq!(h.remote.fetch_count(&photo.id), 2);
    assert!(h.reconciler.pending_changeset(&h.key(&photo.id)).await.is_none());
    assert_eq!(h.reconciler.node_state(&photo.id).await, NodeState::Linked);
}

#[tokio::test]
async fn path_conflicts_are_ignored() {
    let h = Harness::new().await;
    let (_, milk) = synced_list(&h).await;

    h.conflict(&milk, ConflictKind::Path).await;
    h.settle().await;

    assert_eq!(h.remote.fetch_count(&milk.id), 1);
    assert_eq!(h.reconciler.node_state(&milk.id).await, NodeState::Linked);
}

#[tokio::test]
async fn conflict_policies_are_configurable() {
    let policies = ConflictPolicies::default().with(ObjectKind::Item, ConflictPolicy::SkipUpload);
    let h = Harness::with_config(ReconcilerConfig::default().with_conflict_policies(policies)).await;
    let (_, milk) = synced_list(&h).await;

    let key = h.key(&milk.id);
    h.reconciler
        .record_local_edit(&key, "completed", json!(true))
        .await
        .unwrap();
    h.conflict(&milk, ConflictKind::Data).await;
    h.settle().await;

    assert_eq!(h.remote.fetch_count(&milk.id), 1);
    assert!(h.reconciler.pending_changeset(&key).await.is_none());
    assert!(h.item_data(&milk.id).await.completed);
}

#[tokio::test]
async fn cascade_delete_removes_subtree_objects() {
    let h = Harness::new().await;
    let (list, milk) = synced_list(&h).await;
    let eggs = h.item("eggs", &list, "Eggs");
    h.discover(&eggs).await;
    h.settle().await;

    let milk_key = h.key(&milk.id);
    h.reconciler
        .record_local_edit(&milk_key, "completed", json!(true))
        .await
        .unwrap();

    h.delete(&list).await;

    assert!(h.storage.is_empty());
    assert!(h.reconciler.links().is_empty());
    assert!(h.reconciler.pending_changeset(&milk_key).await.is_none());
    for node in [&list, &milk, &eggs] {
        assert_eq!(h.reconciler.node_state(&node.id).await, NodeState::Deleted);
    }
}

#[tokio::test]
async fn failed_delete_leaves_links_and_edits_in_place() {
    let h = Harness::new().await;
    let (list, milk) = synced_list(&h).await;
    let milk_key = h.key(&milk.id);
    h.reconciler
        .record_local_edit(&milk_key, "completed", json!(true))
        .await
        .unwrap();

    h.backend.fail_commits(true);
    assert!(matches!(h.try_delete(&list).await, Err(Error::Storage(_))));

    assert_eq!(h.storage.len(), 2);
    assert_eq!(h.reconciler.links().len(), 2);
    assert!(h.reconciler.pending_changeset(&milk_key).await.unwrap().has_edits());
    for node in [&list, &milk] {
        assert_eq!(h.reconciler.node_state(&node.id).await, NodeState::Linked);
    }

    h.backend.fail_commits(false);
    h.delete(&list).await;
    assert!(h.storage.is_empty());
    assert!(h.reconciler.links().is_empty());
    assert!(h.reconciler.pending_changeset(&milk_key).await.is_none());
    assert_eq!(h.reconciler.node_state(&milk.id).await, NodeState::Deleted);
}

#[tokio::test]
async fn orphan_delete_keeps_objects_and_touches_parent() {
    let h = Harness::with_config(
        ReconcilerConfig::default().with_delete_policy(DeletePolicy::Orphan),
    )
    .await;
    let (list, milk) = synced_list(&h).await;
    let list_key = h.key(&list.id);
    let milk_key = h.key(&milk.id);

    let mut events = h.storage.subscribe();
    h.delete(&milk).await;

    assert!(!h.reconciler.links().is_linked(&milk.id));
    assert!(h.stored(&milk_key).await.is_some());
    assert_eq!(h.storage.len(), 2);

    let event = events.try_recv().unwrap();
    assert_eq!(event.key, list_key);
    assert_eq!(event.change, StorageChange::Touched);
}

#[tokio::test]
async fn modified_metadata_touches_without_fetching() {
    let h = Harness::new().await;
    let (list, _) = synced_list(&h).await;

    let renamed = Node {
        name: "Shopping".to_string(),
        ..list.clone()
    };
    let mut events = h.storage.subscribe();
    h.modify(&renamed, NodeChange::Metadata).await;
    h.settle().await;

    assert_eq!(h.remote.fetch_count(&list.id), 1);
    assert_eq!(events.try_recv().unwrap().key, h.key(&list.id));
    assert_eq!(h.reconciler.node(&list.id).await.unwrap().node.name, "Shopping");
}
