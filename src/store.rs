//! The DocumentStore boundary and an in-process sled-backed implementation.
//!
//! The core only ever talks to the trait; the sled implementation exists so
//! the whole stack runs and tests without a network. Conflict detection is a
//! compare-and-swap on the serialized document, so of two racing writers
//! exactly one succeeds and the other sees `Conflict`.

use std::sync::Arc;

use async_trait::async_trait;
use sled::Db;
use tracing::debug;

use crate::document::{Document, Transaction, Value};
use crate::error::StoreError;
use crate::keys::Keypair;

/// How deep graftable-ownership resolution will chase references before
/// giving up. Registry grants are two hops (registry list -> member document).
const MAX_GRAFT_DEPTH: u8 = 4;

/// Resolve-latest / append is the entire surface the core consumes. The
/// ledger's transaction signing and block propagation live behind it.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Latest verified state for a did. `NotFound` when no document exists.
    async fn resolve_latest(&self, did: &str) -> Result<Document, StoreError>;

    /// Append a signed transaction batch at `expected_tip`, returning the
    /// new tip. `Conflict` when the tip is stale, `Unauthorized` when the
    /// signer does not resolve into the ownership set. A missing document is
    /// creatable only by the key that derives its did.
    async fn append(
        &self,
        did: &str,
        expected_tip: &str,
        signer: &Keypair,
        transactions: &[Transaction],
    ) -> Result<String, StoreError>;

    /// Flush durable state; part of the explicit close lifecycle.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process store. Documents live under `doc/<did>`; every accepted batch
/// is also recorded append-only under `log/<tip>` for custody history.
pub struct SledStore {
    db: Arc<Db>,
}

impl SledStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Ok(Self {
            db: Arc::new(sled::open(path)?),
        })
    }

    fn load(&self, did: &str) -> Result<Option<Document>, StoreError> {
        let Some(bytes) = self.db.get(doc_key(did))? else {
            return Ok(None);
        };
        let doc: Document =
            minicbor::decode(&bytes).map_err(|e| StoreError::Encoding(e.to_string()))?;
        Ok(Some(doc))
    }

    /// Walk the ownership set looking for the signer. Entries are either a
    /// plain address, a did (deferring to that document's owners), or a
    /// graft path `did/tree/data/<path>` (deferring to the did list stored
    /// at that path).
    fn signer_owns(&self, ownership: &[String], signer: &Keypair, depth: u8) -> Result<bool, StoreError> {
        if depth == 0 {
            return Ok(false);
        }
        for entry in ownership {
            if entry == signer.address() {
                return Ok(true);
            }
            if let Some((did, path)) = split_graft(entry) {
                if self.graft_member(did, path, signer, depth)? {
                    return Ok(true);
                }
            } else if entry.starts_with("did:") {
                if entry == signer.did() {
                    return Ok(true);
                }
                if let Some(doc) = self.load(entry)? {
                    if self.signer_owns(&doc.ownership, signer, depth - 1)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn graft_member(
        &self,
        did: &str,
        path: &str,
        signer: &Keypair,
        depth: u8,
    ) -> Result<bool, StoreError> {
        let Some(doc) = self.load(did)? else {
            return Ok(false);
        };
        let Some(Value::List(members)) = doc.resolve_data(path) else {
            return Ok(false);
        };
        for member in members {
            let Some(member_did) = member.as_text() else {
                continue;
            };
            if member_did == signer.did() {
                return Ok(true);
            }
            if let Some(member_doc) = self.load(member_did)? {
                if self.signer_owns(&member_doc.ownership, signer, depth - 1)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn resolve_latest(&self, did: &str) -> Result<Document, StoreError> {
        self.load(did)?
            .ok_or_else(|| StoreError::NotFound(did.to_string()))
    }

    async fn append(
        &self,
        did: &str,
        expected_tip: &str,
        signer: &Keypair,
        transactions: &[Transaction],
    ) -> Result<String, StoreError> {
        let key = doc_key(did);
        let old_bytes = self.db.get(&key)?;

        let mut doc = match &old_bytes {
            None => {
                // genesis: only the key that derives the did may create it
                if signer.did() != did {
                    return Err(StoreError::Unauthorized(format!(
                        "{} cannot create {did}",
                        signer.did()
                    )));
                }
                Document::new_empty(did, signer.address())
            }
            Some(bytes) => {
                minicbor::decode(bytes).map_err(|e| StoreError::Encoding(e.to_string()))?
            }
        };

        if doc.tip != expected_tip {
            return Err(StoreError::Conflict(expected_tip.to_string()));
        }
        if old_bytes.is_some() && !self.signer_owns(&doc.ownership, signer, MAX_GRAFT_DEPTH)? {
            return Err(StoreError::Unauthorized(format!(
                "{} is not an owner of {did}",
                signer.did()
            )));
        }

        doc.apply(transactions)?;
        let new_bytes =
            minicbor::to_vec(&doc).map_err(|e| StoreError::Encoding(e.to_string()))?;

        match self
            .db
            .compare_and_swap(&key, old_bytes, Some(new_bytes))?
        {
            Ok(()) => {}
            // another writer advanced the document first
            Err(_) => return Err(StoreError::Conflict(expected_tip.to_string())),
        }

        let log_entry =
            minicbor::to_vec(transactions).map_err(|e| StoreError::Encoding(e.to_string()))?;
        self.db.insert(log_key(&doc.tip), log_entry)?;

        debug!(did, tip = %doc.tip, txns = transactions.len(), "appended batch");
        Ok(doc.tip)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn doc_key(did: &str) -> Vec<u8> {
    format!("doc/{did}").into_bytes()
}

fn log_key(tip: &str) -> Vec<u8> {
    format!("log/{tip}").into_bytes()
}

fn split_graft(entry: &str) -> Option<(&str, &str)> {
    let idx = entry.find("/tree/data/")?;
    Some((&entry[..idx], &entry[idx + "/tree/data/".len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{set_data, set_ownership};

    fn temp_store() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn genesis_requires_the_deriving_key() {
        let (_dir, store) = temp_store();
        let owner = Keypair::derive(b"tree-one", b"testnamespace");
        let stranger = Keypair::derive(b"tree-two", b"testnamespace");
        let empty = Document::new_empty(owner.did(), owner.address());

        let err = store
            .append(
                owner.did(),
                &empty.tip,
                &stranger,
                &[set_data("nothing", Value::text("toseehere"))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));

        store
            .append(
                owner.did(),
                &empty.tip,
                &owner,
                &[set_data("nothing", Value::text("toseehere"))],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_tip_conflicts() {
        let (_dir, store) = temp_store();
        let owner = Keypair::derive(b"tree-conflict", b"testnamespace");
        let empty = Document::new_empty(owner.did(), owner.address());

        store
            .append(
                owner.did(),
                &empty.tip,
                &owner,
                &[set_data("a", Value::Int(1))],
            )
            .await
            .unwrap();

        // second writer still believes the genesis tip
        let err = store
            .append(
                owner.did(),
                &empty.tip,
                &owner,
                &[set_data("b", Value::Int(2))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn did_ownership_defers_to_that_documents_owners() {
        let (_dir, store) = temp_store();

        // user document owned by a secure address
        let user_key = Keypair::derive(b"driver-dan", b"testnamespace");
        let secure = Keypair::derive(b"hunter2", b"driver-dan");
        let user_doc = Document::new_empty(user_key.did(), user_key.address());
        store
            .append(
                user_key.did(),
                &user_doc.tip,
                &user_key,
                &[set_ownership(vec![secure.address().to_string()])],
            )
            .await
            .unwrap();

        // trackable owned by the user did rather than any address
        let trackable_key = Keypair::generate();
        let trackable = Document::new_empty(trackable_key.did(), trackable_key.address());
        let tip = store
            .append(
                trackable_key.did(),
                &trackable.tip,
                &trackable_key,
                &[set_ownership(vec![user_key.did().to_string()])],
            )
            .await
            .unwrap();

        // the secure key signs through the did indirection
        store
            .append(
                trackable_key.did(),
                &tip,
                &secure,
                &[set_data("status", Value::text("Accepted"))],
            )
            .await
            .unwrap();

        // an unrelated key does not
        let other = Keypair::generate();
        let latest = store.resolve_latest(trackable_key.did()).await.unwrap();
        let err = store
            .append(
                trackable_key.did(),
                &latest.tip,
                &other,
                &[set_data("status", Value::text("Delivered"))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
    }
}
