//! Shared driver registry: a passphrase-derived document any instance can
//! locate, holding the did list that backs the "any registered driver can
//! accept" ownership grant.

use std::sync::Arc;

use tracing::debug;

use crate::document::{Document, Value, set_data};
use crate::error::StoreError;
use crate::handle::{DEFAULT_WRITE_ATTEMPTS, TreeHandle};
use crate::keys::Keypair;
use crate::store::DocumentStore;

pub const DRIVERS_PATH: &str = "drivers";

pub struct Drivers {
    handle: TreeHandle,
}

impl Drivers {
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        region: &str,
        namespace: &str,
    ) -> Result<Self, StoreError> {
        let key = Keypair::derive(region.as_bytes(), namespace.as_bytes());
        debug!(region, namespace, did = %key.did(), "opening drivers registry");
        let handle = TreeHandle::find_or_create(store, key).await?;
        Ok(Self { handle })
    }

    pub fn did(&self) -> &str {
        self.handle.did()
    }

    /// The ownership entries a donor grants a fresh trackable so that any
    /// registered driver can later claim exclusive ownership: the registry
    /// did itself (for re-delegation) plus a graft into its driver list.
    pub fn graftable_ownership(&self) -> Vec<String> {
        let did = self.handle.did();
        vec![did.to_string(), format!("{did}/tree/data/{DRIVERS_PATH}")]
    }

    /// Enroll a driver. Read-modify-write on the did list with the bounded
    /// refresh-retry loop; enrolling an already-listed driver is a no-op.
    pub async fn add_driver(&mut self, user_did: &str) -> Result<(), StoreError> {
        debug!(user_did, "adding driver");
        self.handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                let mut dids = driver_list(doc);
                if dids.iter().any(|d| d == user_did) {
                    return Ok(Vec::new());
                }
                dids.push(user_did.to_string());
                let items = dids.into_iter().map(Value::Text).collect();
                Ok(vec![set_data(DRIVERS_PATH, Value::List(items))])
            })
            .await
    }

    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        self.handle.refresh_to_latest().await
    }

    pub fn list_drivers(&self) -> Vec<String> {
        driver_list(self.handle.document())
    }
}

fn driver_list(doc: &Document) -> Vec<String> {
    let Some(items) = doc.resolve_data(DRIVERS_PATH).and_then(|v| v.as_list()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| v.as_text())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;

    #[tokio::test]
    async fn enrollment_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> =
            Arc::new(SledStore::open(dir.path().join("drivers.db")).unwrap());

        let mut drivers = Drivers::new(store, "fresno", "testnamespace").await.unwrap();
        drivers.add_driver("did:gc:driver-one").await.unwrap();
        drivers.add_driver("did:gc:driver-two").await.unwrap();
        drivers.add_driver("did:gc:driver-one").await.unwrap();

        assert_eq!(
            drivers.list_drivers(),
            vec!["did:gc:driver-one".to_string(), "did:gc:driver-two".to_string()]
        );
    }

    #[tokio::test]
    async fn graftable_ownership_points_at_the_driver_list() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DocumentStore> =
            Arc::new(SledStore::open(dir.path().join("drivers.db")).unwrap());

        let drivers = Drivers::new(store, "fresno", "testnamespace").await.unwrap();
        let grant = drivers.graftable_ownership();
        assert_eq!(grant.len(), 2);
        assert_eq!(grant[0], drivers.did());
        assert!(grant[1].ends_with("/tree/data/drivers"));
    }
}
