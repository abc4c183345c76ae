//! Recipient facilities: named documents under a well-known namespace plus
//! the shared region registry that lists them.

use std::sync::Arc;

use tracing::debug;

use crate::document::{Document, Value, set_data};
use crate::error::StoreError;
use crate::handle::{DEFAULT_WRITE_ATTEMPTS, TreeHandle};
use crate::identity::{self, create_named_tree};
use crate::keys::Keypair;
use crate::store::DocumentStore;
use crate::trackable::Address;

pub const RECIPIENT_NAMESPACE: &str = "givingchain/recipient";
pub const RECIPIENT_ADDRESS_PATH: &str = "givingchain/recipient/address";
pub const RECIPIENT_INSTRUCTIONS_PATH: &str = "givingchain/recipient/instructions";
pub const RECIPIENT_LIST_PATH: &str = "givingchain/recipient/collection";

/// A receiving facility, as read out of its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub did: String,
    pub name: String,
    pub address: Option<Address>,
    pub instructions: Option<String>,
}

impl Recipient {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let name = identity::resolve_username(doc)
            .ok_or_else(|| StoreError::InvalidData(format!("{} has no name", doc.did)))?;
        Ok(Self {
            did: doc.did.clone(),
            name,
            address: doc
                .resolve_data(RECIPIENT_ADDRESS_PATH)
                .and_then(Address::from_value),
            instructions: doc
                .resolve_data(RECIPIENT_INSTRUCTIONS_PATH)
                .and_then(|v| v.as_text())
                .map(str::to_string),
        })
    }
}

/// Create the facility's named document and record its street address and
/// dropoff instructions.
pub async fn create_recipient_tree(
    store: Arc<dyn DocumentStore>,
    name: &str,
    password: &str,
    address: &Address,
    instructions: &str,
) -> Result<TreeHandle, StoreError> {
    debug!(name, "creating recipient tree");
    let mut handle = create_named_tree(store, name, password, RECIPIENT_NAMESPACE).await?;
    handle
        .apply(vec![
            set_data(RECIPIENT_ADDRESS_PATH, address.to_value()),
            set_data(RECIPIENT_INSTRUCTIONS_PATH, Value::text(instructions)),
        ])
        .await?;
    Ok(handle)
}

/// Region-wide list of facility dids, held by a passphrase-derived key so
/// every instance of the engine finds the same registry.
pub struct RecipientCollection {
    handle: TreeHandle,
}

impl RecipientCollection {
    pub async fn new(store: Arc<dyn DocumentStore>, region: &str) -> Result<Self, StoreError> {
        let key = Keypair::derive(region.as_bytes(), RECIPIENT_NAMESPACE.as_bytes());
        debug!(region, did = %key.did(), "opening recipient collection");
        let handle = TreeHandle::find_or_create(store, key).await?;
        Ok(Self { handle })
    }

    pub fn did(&self) -> &str {
        self.handle.did()
    }

    pub async fn add(&mut self, recipient_did: &str) -> Result<(), StoreError> {
        debug!(recipient_did, "adding recipient");
        self.handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                let mut dids = did_list(doc);
                if dids.iter().any(|d| d == recipient_did) {
                    return Ok(Vec::new());
                }
                dids.push(recipient_did.to_string());
                let items = dids.into_iter().map(Value::Text).collect();
                Ok(vec![set_data(RECIPIENT_LIST_PATH, Value::List(items))])
            })
            .await
    }

    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        self.handle.refresh_to_latest().await
    }

    pub fn get_all(&self) -> Vec<String> {
        did_list(self.handle.document())
    }

    pub fn get_first(&self) -> Option<String> {
        did_list(self.handle.document()).into_iter().next()
    }
}

fn did_list(doc: &Document) -> Vec<String> {
    let Some(items) = doc.resolve_data(RECIPIENT_LIST_PATH).and_then(|v| v.as_list()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| v.as_text())
        .map(str::to_string)
        .collect()
}
