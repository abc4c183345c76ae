//! Service layer: the lifecycle engine driving a donation from donor to
//! driver to recipient, plus the account and registry operations around it.
//!
//! Everything here is explicitly constructed and dependency-injected; the
//! store and the shared registries are fields, not module-level statics,
//! and the acting user is a `Session` argument on every call.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::collection::{Collection, OwnerMarker};
use crate::document::{Document, Value, set_data, set_ownership};
use crate::drivers::Drivers;
use crate::error::StoreError;
use crate::handle::{DEFAULT_WRITE_ATTEMPTS, TreeHandle};
use crate::identity::{self, Session, User};
use crate::keys::Keypair;
use crate::recipient::{self, Recipient, RecipientCollection};
use crate::store::DocumentStore;
use crate::trackable::{
    Address, DRIVER_PATH, IMAGE_PATH, METADATA_PATH, MetadataEntry, NAME_PATH, STATUS_PATH,
    Trackable, TrackableStatus, TrackableUpdate, collaborator_path, update_path,
};

/// Deployment coordinates: which namespace user accounts live in and which
/// region's driver/recipient registries to join.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub namespace: String,
    pub region: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: "givingchain".to_string(),
            region: "global".to_string(),
        }
    }
}

/// Input for publishing a new donation.
#[derive(Debug, Clone)]
pub struct CreateTrackableInput {
    pub name: String,
    pub image: Option<String>,
    pub address: Option<Address>,
    pub instructions: Option<String>,
}

/// One row of the app collection listing: the donation did and, once a
/// driver has claimed it, that driver's did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackableRef {
    pub did: String,
    pub driver: Option<String>,
}

pub struct LifecycleService {
    store: Arc<dyn DocumentStore>,
    config: AppConfig,
    collection: Mutex<Collection>,
    drivers: Mutex<Drivers>,
    recipients: Mutex<RecipientCollection>,
}

impl LifecycleService {
    /// Open (or lazily create) the shared app collection and the driver and
    /// recipient registries for the configured region.
    pub async fn new(store: Arc<dyn DocumentStore>, config: AppConfig) -> Result<Self, StoreError> {
        let collection = Collection::new(store.clone(), "collection", &config.namespace).await?;
        let drivers = Drivers::new(store.clone(), &config.region, &config.namespace).await?;
        let recipients = RecipientCollection::new(store.clone(), &config.region).await?;
        info!(namespace = %config.namespace, region = %config.region, "lifecycle service ready");
        Ok(Self {
            store,
            config,
            collection: Mutex::new(collection),
            drivers: Mutex::new(drivers),
            recipients: Mutex::new(recipients),
        })
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.store.flush().await
    }

    // -- accounts ---------------------------------------------------------

    /// Register a username-password pair. Every account is also enrolled as
    /// a driver: in this deployment only drivers log in.
    pub async fn register(&self, username: &str, password: &str) -> Result<Session, StoreError> {
        let session =
            identity::register(self.store.clone(), username, password, &self.config.namespace)
                .await?;
        self.drivers
            .lock()
            .await
            .add_driver(&session.user.did)
            .await?;
        Ok(session)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, StoreError> {
        identity::verify(&self.store, username, password, &self.config.namespace).await
    }

    /// Dropping the session credential is the logout; the account document
    /// is untouched.
    pub fn logout(&self, session: Session) -> User {
        session.user
    }

    pub fn me<'a>(&self, session: &'a Session) -> &'a User {
        &session.user
    }

    // -- queries ----------------------------------------------------------

    pub async fn get_trackable(&self, did: &str) -> Result<Trackable, StoreError> {
        let doc = self.store.resolve_latest(did).await?;
        Trackable::from_document(&doc)
    }

    pub async fn get_trackables(&self) -> Result<Vec<TrackableRef>, StoreError> {
        let mut collection = self.collection.lock().await;
        collection.refresh().await?;
        Ok(collection
            .list_entries()
            .into_iter()
            .map(|(did, marker)| TrackableRef {
                did,
                driver: match marker {
                    OwnerMarker::Owned(driver) => Some(driver),
                    OwnerMarker::Unowned => None,
                },
            })
            .collect())
    }

    pub async fn get_recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let mut recipients = self.recipients.lock().await;
        recipients.refresh().await?;
        let mut out = Vec::new();
        for did in recipients.get_all() {
            let doc = self.store.resolve_latest(&did).await?;
            out.push(Recipient::from_document(&doc)?);
        }
        Ok(out)
    }

    pub async fn get_first_recipient(&self) -> Result<Option<Recipient>, StoreError> {
        let mut recipients = self.recipients.lock().await;
        recipients.refresh().await?;
        let Some(did) = recipients.get_first() else {
            return Ok(None);
        };
        let doc = self.store.resolve_latest(&did).await?;
        Ok(Some(Recipient::from_document(&doc)?))
    }

    pub async fn create_recipient(
        &self,
        name: &str,
        password: &str,
        address: Address,
        instructions: &str,
    ) -> Result<Recipient, StoreError> {
        let handle = recipient::create_recipient_tree(
            self.store.clone(),
            name,
            password,
            &address,
            instructions,
        )
        .await?;
        self.recipients.lock().await.add(handle.did()).await?;
        Recipient::from_document(handle.document())
    }

    // -- lifecycle mutations ----------------------------------------------

    /// Publish a donation: a fresh unguessable document carrying name,
    /// image, pickup location and an initial "ready for pickup" update,
    /// owned by the donor plus the graftable any-driver grant. The app
    /// collection write that follows is separate and non-atomic; it is
    /// idempotent and safe to retry on its own.
    pub async fn create_trackable(
        &self,
        session: &Session,
        input: CreateTrackableInput,
    ) -> Result<Trackable, StoreError> {
        let key = Keypair::generate();
        info!(did = %key.did(), name = %input.name, "creating trackable");
        let mut handle = TreeHandle::find_or_create(self.store.clone(), key).await?;

        let now = Utc::now();
        let mut update_metadata = vec![MetadataEntry::text(
            "status",
            TrackableStatus::Published.as_str(),
        )];
        if let Some(instructions) = &input.instructions {
            update_metadata.push(MetadataEntry::text("instructions", instructions.clone()));
        }
        let update = TrackableUpdate {
            timestamp: now,
            message: "ready for pickup".to_string(),
            metadata: update_metadata,
            user_did: session.user.did.clone(),
            user_name: session.user.username.clone(),
        };

        let mut ownership = vec![session.keypair().address().to_string()];
        ownership.extend(self.drivers.lock().await.graftable_ownership());

        let mut transactions = vec![
            set_data(NAME_PATH, Value::text(input.name.clone())),
            set_data(
                STATUS_PATH,
                Value::text(TrackableStatus::Published.as_str()),
            ),
        ];
        if let Some(image) = &input.image {
            transactions.push(set_data(IMAGE_PATH, Value::text(image.clone())));
        }
        if let Some(address) = &input.address {
            transactions.push(set_data(
                format!("{METADATA_PATH}/location"),
                address.to_value(),
            ));
        }
        transactions.push(set_data(update_path(update.timestamp_ms()), update.to_value()));
        transactions.push(set_ownership(ownership));

        handle.apply(transactions).await?;
        self.collection.lock().await.add_entry(handle.did()).await?;

        Trackable::from_document(handle.document())
    }

    /// Append a free-form update. Never touches status.
    pub async fn add_update(
        &self,
        session: &Session,
        trackable_did: &str,
        message: &str,
        metadata: Vec<MetadataEntry>,
    ) -> Result<TrackableUpdate, StoreError> {
        let mut handle =
            TreeHandle::open(self.store.clone(), session.keypair().clone(), trackable_did).await?;
        let update = TrackableUpdate {
            timestamp: Utc::now(),
            message: message.to_string(),
            metadata,
            user_did: session.user.did.clone(),
            user_name: session.user.username.clone(),
        };
        debug!(trackable_did, "adding update");
        handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                let (path, value) = place_update(doc, &update);
                Ok(vec![set_data(path, value)])
            })
            .await?;
        Ok(update)
    }

    /// Grant another account write access to a donation by username.
    /// `NotFound` when the username does not resolve. The collaborator's
    /// ownership addresses are unioned in; nothing is revoked.
    pub async fn add_collaborator(
        &self,
        session: &Session,
        trackable_did: &str,
        username: &str,
    ) -> Result<User, StoreError> {
        let account =
            identity::find_account(&self.store, username, &self.config.namespace).await?;
        let collaborator = User {
            username: username.to_string(),
            did: account.did.clone(),
        };
        let addresses = account.ownership.clone();
        let path = collaborator_path(&collaborator.did);

        let mut handle =
            TreeHandle::open(self.store.clone(), session.keypair().clone(), trackable_did).await?;
        handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                let mut ownership = doc.ownership.clone();
                for addr in &addresses {
                    if !ownership.contains(addr) {
                        ownership.push(addr.clone());
                    }
                }
                Ok(vec![
                    set_ownership(ownership),
                    set_data(&path, Value::Bool(true)),
                ])
            })
            .await?;
        info!(trackable_did, collaborator = %collaborator.did, "added collaborator");
        Ok(collaborator)
    }

    /// A driver claims a published donation. Ownership is *replaced* with
    /// exactly the accepting driver plus the drivers registry: the broad
    /// any-driver grant is revoked, the registry keeps re-delegation
    /// rights. The collection entry is claimed afterwards so the index
    /// agrees with the document.
    pub async fn accept_job(
        &self,
        session: &Session,
        actor_did: &str,
        trackable_did: &str,
    ) -> Result<Trackable, StoreError> {
        self.require_actor(session, actor_did)?;
        let drivers_did = self.drivers.lock().await.did().to_string();
        let mut handle =
            TreeHandle::open(self.store.clone(), session.keypair().clone(), trackable_did).await?;
        let user = session.user.clone();

        handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                let status = current_status(doc)?;
                if !status.can_advance_to(TrackableStatus::Accepted) {
                    return Err(StoreError::Unauthorized(format!(
                        "cannot accept a {} donation",
                        status.as_str()
                    )));
                }
                let update = transition_update(&user, "accepted the delivery", TrackableStatus::Accepted, Vec::new());
                let (path, value) = place_update(doc, &update);
                Ok(vec![
                    set_data(path, value),
                    set_data(DRIVER_PATH, Value::text(actor_did)),
                    set_data(STATUS_PATH, Value::text(TrackableStatus::Accepted.as_str())),
                    set_ownership(vec![actor_did.to_string(), drivers_did.clone()]),
                ])
            })
            .await?;

        self.collection
            .lock()
            .await
            .claim_entry(trackable_did, actor_did)
            .await?;
        info!(trackable_did, driver = actor_did, "job accepted");
        Trackable::from_document(handle.document())
    }

    /// The accepting driver reports the box in hand, optionally with a
    /// confirmation photo. Ownership unchanged.
    pub async fn pickup_donation(
        &self,
        session: &Session,
        actor_did: &str,
        trackable_did: &str,
        image_url: Option<&str>,
    ) -> Result<Trackable, StoreError> {
        self.require_actor(session, actor_did)?;
        let mut handle =
            TreeHandle::open(self.store.clone(), session.keypair().clone(), trackable_did).await?;
        let user = session.user.clone();

        handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                require_assigned_driver(doc, actor_did)?;
                let status = current_status(doc)?;
                if !status.can_advance_to(TrackableStatus::PickedUp) {
                    return Err(StoreError::Unauthorized(format!(
                        "cannot pick up a {} donation",
                        status.as_str()
                    )));
                }
                let mut extra = Vec::new();
                if let Some(url) = image_url {
                    extra.push(MetadataEntry::image("confirmationImage", url));
                }
                let update =
                    transition_update(&user, "picked up the donation", TrackableStatus::PickedUp, extra);
                let (path, value) = place_update(doc, &update);
                Ok(vec![
                    set_data(path, value),
                    set_data(STATUS_PATH, Value::text(TrackableStatus::PickedUp.as_str())),
                ])
            })
            .await?;
        info!(trackable_did, driver = actor_did, "donation picked up");
        Trackable::from_document(handle.document())
    }

    /// Terminal transition: the donation is handed to the facility and the
    /// document's ownership moves to the recipient, permanently ending the
    /// driver's write access.
    pub async fn complete_job(
        &self,
        session: &Session,
        actor_did: &str,
        trackable_did: &str,
        recipient_did: &str,
    ) -> Result<Trackable, StoreError> {
        self.require_actor(session, actor_did)?;
        let mut handle =
            TreeHandle::open(self.store.clone(), session.keypair().clone(), trackable_did).await?;
        let user = session.user.clone();

        handle
            .apply_with_refresh(DEFAULT_WRITE_ATTEMPTS, |doc| {
                require_assigned_driver(doc, actor_did)?;
                let status = current_status(doc)?;
                if !status.can_advance_to(TrackableStatus::Delivered) {
                    return Err(StoreError::Unauthorized(format!(
                        "cannot deliver a {} donation",
                        status.as_str()
                    )));
                }
                let extra = vec![MetadataEntry::text("recipient", recipient_did)];
                let update =
                    transition_update(&user, "delivered the donation", TrackableStatus::Delivered, extra);
                let (path, value) = place_update(doc, &update);
                Ok(vec![
                    set_data(path, value),
                    set_data(STATUS_PATH, Value::text(TrackableStatus::Delivered.as_str())),
                    set_ownership(vec![recipient_did.to_string()]),
                ])
            })
            .await?;
        info!(trackable_did, recipient = recipient_did, "job completed");
        Trackable::from_document(handle.document())
    }

    fn require_actor(&self, session: &Session, actor_did: &str) -> Result<(), StoreError> {
        if session.user.did != actor_did {
            return Err(StoreError::Unauthenticated(format!(
                "actor {actor_did} does not match session user {}",
                session.user.did
            )));
        }
        Ok(())
    }
}

fn current_status(doc: &Document) -> Result<TrackableStatus, StoreError> {
    let text = doc
        .resolve_data(STATUS_PATH)
        .and_then(|v| v.as_text())
        .ok_or_else(|| StoreError::InvalidData(format!("{} has no status", doc.did)))?;
    TrackableStatus::parse(text)
}

fn require_assigned_driver(doc: &Document, actor_did: &str) -> Result<(), StoreError> {
    let driver = doc.resolve_data(DRIVER_PATH).and_then(|v| v.as_text());
    if driver != Some(actor_did) {
        return Err(StoreError::Unauthorized(format!(
            "{actor_did} is not the assigned driver"
        )));
    }
    Ok(())
}

/// Updates are keyed by millisecond timestamp; two writes landing in the
/// same millisecond take the next free key so no record is ever overwritten.
fn place_update(doc: &Document, update: &TrackableUpdate) -> (String, Value) {
    let mut ms = update.timestamp_ms();
    while doc.resolve_data(&update_path(ms)).is_some() {
        ms += 1;
    }
    (update_path(ms), update.to_value())
}

fn transition_update(
    user: &User,
    message: &str,
    status: TrackableStatus,
    mut extra: Vec<MetadataEntry>,
) -> TrackableUpdate {
    let mut metadata = vec![MetadataEntry::text("status", status.as_str())];
    metadata.append(&mut extra);
    TrackableUpdate {
        timestamp: Utc::now(),
        message: message.to_string(),
        metadata,
        user_did: user.did.clone(),
        user_name: user.username.clone(),
    }
}
