//! Decoding fetched payloads and merging them with pending local edits.
//!
//! Containers and items travel as JSON documents. Attachments travel as raw
//! bytes. Merging re-applies the pending field edits, in the order they were
//! recorded, on top of the freshly decoded remote draft: fields touched only
//! remotely take the remote value, fields touched locally take the latest
//! local value.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use arborsync_common::{AttachmentData, Error, LocalId, LocalObject, ObjectKind, Payload, Result};

use crate::changeset::{Changeset, FieldEdit};

/// Serialize a payload to its wire representation.
pub fn encode(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Container(data) => Ok(serde_json::to_vec(data)?),
        Payload::Item(data) => Ok(serde_json::to_vec(data)?),
        Payload::Attachment(data) => Ok(data.bytes.clone()),
    }
}

/// Decode cleartext into a payload of the given kind.
///
/// # Errors
/// - `Decode` if the bytes are not a valid document for `kind`
pub fn decode(cleartext: &[u8], kind: ObjectKind) -> Result<Payload> {
    match kind {
        ObjectKind::Container => Ok(Payload::Container(decode_document(cleartext, kind)?)),
        ObjectKind::Item => Ok(Payload::Item(decode_document(cleartext, kind)?)),
        ObjectKind::Attachment => {
            if cleartext.is_empty() {
                return Err(Error::Decode("Empty attachment payload".to_string()));
            }
            Ok(Payload::Attachment(AttachmentData {
                bytes: cleartext.to_vec(),
            }))
        }
    }
}

fn decode_document<T: DeserializeOwned>(cleartext: &[u8], kind: ObjectKind) -> Result<T> {
    serde_json::from_slice(cleartext)
        .map_err(|e| Error::Decode(format!("Invalid {} document: {}", kind, e)))
}

/// Apply field edits to a payload, in order.
///
/// # Errors
/// - `Merge` on an unknown field, a value of the wrong type, or any edit of
///   an attachment
pub fn apply_edits(payload: &Payload, edits: &[FieldEdit]) -> Result<Payload> {
    if edits.is_empty() {
        return Ok(payload.clone());
    }

    match payload {
        Payload::Container(data) => Ok(Payload::Container(patch_document(data, edits)?)),
        Payload::Item(data) => Ok(Payload::Item(patch_document(data, edits)?)),
        Payload::Attachment(_) => Err(Error::Merge(
            "Attachment payloads cannot be merged field by field".to_string(),
        )),
    }
}

fn patch_document<T: Serialize + DeserializeOwned>(data: &T, edits: &[FieldEdit]) -> Result<T> {
    let mut fields: Map<String, Value> = match serde_json::to_value(data)? {
        Value::Object(map) => map,
        other => {
            return Err(Error::Merge(format!(
                "Expected a document, found {}",
                other
            )))
        }
    };

    for edit in edits {
        let slot = fields
            .get_mut(&edit.field)
            .ok_or_else(|| Error::Merge(format!("Unknown field '{}'", edit.field)))?;
        *slot = edit.value.clone();
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| Error::Merge(format!("Edited document is invalid: {}", e)))
}

/// Remote payload decoded and attached to its local parent.
#[derive(Debug, Clone)]
pub struct ObjectDraft {
    /// Local id of the owning aggregate.
    pub parent: Option<LocalId>,
    pub payload: Payload,
}

/// How the stored object was derived from the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeKind {
    /// No local object existed.
    Created,
    /// Nothing pending locally; the remote draft replaces the object.
    Replaced,
    /// Pending edits were re-applied on top of the remote draft.
    Merged { edits: usize },
    /// Pending edits could not be applied; the remote draft wins.
    FellBack { reason: String },
}

/// Object to store after reconciling a draft with local state.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub object: LocalObject,
    pub kind: MergeKind,
}

/// Reconcile a freshly decoded draft with the existing local object.
///
/// The outcome always keeps the existing local id, so the link survives
/// every path including the fallback.
pub fn reconcile(
    draft: ObjectDraft,
    existing: Option<&LocalObject>,
    pending: Option<&Changeset>,
) -> MergeOutcome {
    let Some(existing) = existing else {
        return MergeOutcome {
            object: LocalObject::new(draft.parent, draft.payload),
            kind: MergeKind::Created,
        };
    };

    let edits = pending.map(|c| c.edits.as_slice()).unwrap_or_default();
    let draft_kind = draft.payload.kind();

    let (payload, kind) = if existing.kind() != draft_kind {
        fall_back(
            draft.payload,
            format!("Local object is a {}, remote is a {}", existing.kind(), draft_kind),
        )
    } else if edits.is_empty() {
        (draft.payload, MergeKind::Replaced)
    } else {
        match apply_edits(&draft.payload, edits) {
            Ok(merged) => {
                debug!(object = %existing.id, edits = edits.len(), "Re-applied pending edits");
                (merged, MergeKind::Merged { edits: edits.len() })
            }
            Err(e) => fall_back(draft.payload, e.to_string()),
        }
    };

    MergeOutcome {
        object: LocalObject {
            id: existing.id.clone(),
            parent: draft.parent,
            payload,
        },
        kind,
    }
}

fn fall_back(payload: Payload, reason: String) -> (Payload, MergeKind) {
    warn!("Merge failed, keeping remote version: {}", reason);
    (payload, MergeKind::FellBack { reason })
}
