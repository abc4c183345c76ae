//! The collection index: a document used purely as a registry mapping
//! entry did -> owner marker, so donors can list and drivers can claim.

use std::sync::Arc;

use tracing::debug;

use crate::document::{Value, set_data};
use crate::error::StoreError;
use crate::handle::{DEFAULT_WRITE_ATTEMPTS, TreeHandle};
use crate::keys::Keypair;
use crate::store::DocumentStore;

/// Index entries live under this path in the collection document.
pub const TRACKABLES_PATH: &str = "trackables";

/// Marker stored against each entry: the unowned sentinel (`false` on the
/// wire) or the did of the claiming owner. Entries are never removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerMarker {
    Unowned,
    Owned(String),
}

impl OwnerMarker {
    fn to_value(&self) -> Value {
        match self {
            OwnerMarker::Unowned => Value::Bool(false),
            OwnerMarker::Owned(did) => Value::text(did.clone()),
        }
    }

    fn from_value(value: &Value) -> Self {
        match value.as_text() {
            Some(did) => OwnerMarker::Owned(did.to_string()),
            None => OwnerMarker::Unowned,
        }
    }
}

/// App-level index document held by a known, passphrase-derived key, so any
/// instance can find it without prior coordination. Created lazily on first
/// write.
pub struct Collection {
    handle: TreeHandle,
}

impl Collection {
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        name: &str,
        namespace: &str,
    ) -> Result<Self, StoreError> {
        let key = Keypair::derive(name.as_bytes(), namespace.as_bytes());
        debug!(name, namespace, did = %key.did(), "opening collection");
        let handle = TreeHandle::find_or_create(store, key).await?;
        Ok(Self { handle })
    }

    pub fn did(&self) -> &str {
        self.handle.did()
    }

    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        self.handle.refresh_to_latest().await
    }

    /// Every entry with its marker. An absent index path is a legitimately
    /// empty, brand-new collection, never an error.
    pub fn list_entries(&self) -> Vec<(String, OwnerMarker)> {
        let Some(entries) = self
            .handle
            .document()
            .resolve_data(TRACKABLES_PATH)
            .and_then(|v| v.as_map())
        else {
            return Vec::new();
        };
        entries
            .iter()
            .map(|(did, marker)| (did.clone(), OwnerMarker::from_value(marker)))
            .collect()
    }

    /// Record a new entry as unowned. Idempotent: re-adding an entry that is
    /// already present (owned or not) leaves its marker alone, which makes
    /// the index write safe to retry independently of the document write.
    pub async fn add_entry(&mut self, entry_did: &str) -> Result<(), StoreError> {
        let path = entry_path(entry_did);
        debug!(entry_did, "adding entry to collection");
        self.handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                if doc.resolve_data(&path).is_some() {
                    return Ok(Vec::new());
                }
                Ok(vec![set_data(&path, OwnerMarker::Unowned.to_value())])
            })
            .await
    }

    /// Claim an entry for an owner, overwriting the unowned sentinel.
    pub async fn claim_entry(
        &mut self,
        entry_did: &str,
        owner_did: &str,
    ) -> Result<(), StoreError> {
        let path = entry_path(entry_did);
        let marker = OwnerMarker::Owned(owner_did.to_string());
        debug!(entry_did, owner_did, "claiming entry");
        self.handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |_doc| {
                Ok(vec![set_data(&path, marker.to_value())])
            })
            .await
    }
}

fn entry_path(entry_did: &str) -> String {
    format!("{TRACKABLES_PATH}/{entry_did}")
}
