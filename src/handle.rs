//! Process-local handle over one document, with the optimistic-refresh
//! policy every higher-level store shares: refresh, read, decide, append.

use std::sync::Arc;

use tracing::debug;

use crate::document::{Document, Transaction};
use crate::error::StoreError;
use crate::keys::Keypair;
use crate::store::DocumentStore;

/// Default attempts for the bounded retry-with-refresh write loop.
pub const DEFAULT_WRITE_ATTEMPTS: usize = 3;

/// Best-known state for one did plus the signing key used for appends.
///
/// A handle is mutated through `&mut self`, so two operations issued
/// sequentially against the same handle never race each other; across
/// independent handles the store's compare-and-swap arbitrates.
pub struct TreeHandle {
    store: Arc<dyn DocumentStore>,
    keypair: Keypair,
    doc: Document,
}

impl TreeHandle {
    /// Fetch the latest state for the key's did; a `NotFound` becomes a
    /// brand-new empty document owned by the key. Anything else propagates.
    pub async fn find_or_create(
        store: Arc<dyn DocumentStore>,
        keypair: Keypair,
    ) -> Result<Self, StoreError> {
        let did = keypair.did().to_string();
        debug!(%did, "find_or_create");
        let doc = match store.resolve_latest(&did).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => {
                debug!(%did, "not found, starting from an empty document");
                Document::new_empty(&did, keypair.address())
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            store,
            keypair,
            doc,
        })
    }

    /// Open an existing document, signing future appends with `keypair`
    /// (which need not be the key that derived the did). `NotFound`
    /// propagates here: the caller asked for a specific document.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        keypair: Keypair,
        did: &str,
    ) -> Result<Self, StoreError> {
        let doc = store.resolve_latest(did).await?;
        Ok(Self {
            store,
            keypair,
            doc,
        })
    }

    pub fn did(&self) -> &str {
        &self.doc.did
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Swap the signing key, e.g. after transferring ownership of a freshly
    /// created named document to a secure key.
    pub fn set_keypair(&mut self, keypair: Keypair) {
        self.keypair = keypair;
    }

    /// Re-fetch the latest state, preserving the signing key. A `NotFound`
    /// keeps the prior (possibly still-unpublished) state; this is what
    /// lets a just-created document survive a premature refresh. Any other
    /// error leaves the handle undisturbed.
    pub async fn refresh_to_latest(&mut self) -> Result<(), StoreError> {
        debug!(did = %self.doc.did, "refreshing to latest");
        match self.store.resolve_latest(&self.doc.did).await {
            Ok(latest) => {
                debug!(did = %self.doc.did, tip = %latest.tip, "refreshed");
                self.doc = latest;
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Submit a batch at the current tip. On success the batch is applied
    /// locally, so a subsequent call on this handle observes its own write
    /// without a round trip. A stale tip surfaces as `Conflict`.
    pub async fn apply(&mut self, transactions: Vec<Transaction>) -> Result<(), StoreError> {
        let new_tip = self
            .store
            .append(&self.doc.did, &self.doc.tip, &self.keypair, &transactions)
            .await?;
        self.doc.apply(&transactions)?;
        debug_assert_eq!(self.doc.tip, new_tip);
        Ok(())
    }

    /// The default write path: refresh, rebuild the batch from fresh state,
    /// append; retry on `Conflict` up to `attempts` times. The builder sees
    /// the refreshed document each round so a lost race recomputes rather
    /// than replays.
    pub async fn apply_with_refresh<F>(
        &mut self,
        attempts: usize,
        build: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(&Document) -> Result<Vec<Transaction>, StoreError>,
    {
        let mut last_tip = self.doc.tip.clone();
        for attempt in 0..attempts.max(1) {
            self.refresh_to_latest().await?;
            let transactions = build(&self.doc)?;
            // an empty batch means the refreshed state already satisfies the write
            if transactions.is_empty() {
                return Ok(());
            }
            match self.apply(transactions).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(tip)) => {
                    debug!(did = %self.doc.did, attempt, "conflict, refreshing and retrying");
                    last_tip = tip;
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Conflict(last_tip))
    }
}
