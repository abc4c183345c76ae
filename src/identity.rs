//! Registration and login: named, password-protected user documents.
//!
//! A username names a document deterministically (so accounts are
//! discoverable), while a second key derived from the password actually owns
//! it. The very first batch on the document transfers ownership to the
//! secure key and caches the username inside the tree.

use std::sync::Arc;

use tracing::debug;

use crate::document::{Document, Value, set_data, set_ownership};
use crate::error::StoreError;
use crate::handle::TreeHandle;
use crate::keys::Keypair;
use crate::store::DocumentStore;

/// Path within the user document where the username is cached.
pub const USERNAME_PATH: &str = "givingchain/username";

/// A registered account, did populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub did: String,
}

/// The explicit actor/credential passed into every lifecycle call. There is
/// no ambient current user; dropping the session is logout.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    keypair: Keypair,
}

impl Session {
    pub fn new(user: User, keypair: Keypair) -> Self {
        Self { user, keypair }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

/// Key from the *insecure* passphrase (the username). Knowing a username is
/// enough to find the account document, never to write it.
fn insecure_username_key(username: &str, namespace: &str) -> Keypair {
    Keypair::derive(username.as_bytes(), namespace.as_bytes())
}

/// Secure key from the username-password pair; its address is what ends up
/// in the account document's ownership set.
fn secure_password_key(username: &str, password: &str) -> Keypair {
    Keypair::derive(password.as_bytes(), username.as_bytes())
}

/// Unauthenticated lookup of the account document for a username.
/// `NotFound` when nobody has registered it.
pub async fn find_account(
    store: &Arc<dyn DocumentStore>,
    username: &str,
    namespace: &str,
) -> Result<Document, StoreError> {
    let did = insecure_username_key(username, namespace).did().to_string();
    store.resolve_latest(&did).await
}

/// Create a named document whose ownership is immediately transferred to the
/// secure (password-derived) key, with the name cached at a fixed path. Used
/// for user accounts and recipient facilities alike. The returned handle
/// signs with the secure key.
pub async fn create_named_tree(
    store: Arc<dyn DocumentStore>,
    name: &str,
    password: &str,
    namespace: &str,
) -> Result<TreeHandle, StoreError> {
    let insecure = insecure_username_key(name, namespace);
    let secure = secure_password_key(name, password);
    debug!(name, namespace, did = %insecure.did(), "creating named tree");

    match store.resolve_latest(insecure.did()).await {
        Ok(_) => return Err(StoreError::AlreadyExists(name.to_string())),
        Err(StoreError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    let mut handle = TreeHandle::find_or_create(store, insecure).await?;
    match handle
        .apply(vec![
            // owning the secure key is owning the username
            set_ownership(vec![secure.address().to_string()]),
            set_data(USERNAME_PATH, Value::text(name)),
        ])
        .await
    {
        Ok(()) => {}
        // a racing registration of the same name got there first
        Err(StoreError::Conflict(_)) => return Err(StoreError::AlreadyExists(name.to_string())),
        Err(err) => return Err(err),
    }
    handle.set_keypair(secure);
    Ok(handle)
}

/// Register a username-password pair. `AlreadyExists` when the deterministic
/// account document already resolves.
pub async fn register(
    store: Arc<dyn DocumentStore>,
    username: &str,
    password: &str,
    namespace: &str,
) -> Result<Session, StoreError> {
    debug!(username, "registering");
    let handle = create_named_tree(store, username, password, namespace).await?;
    let user = User {
        username: username.to_string(),
        did: handle.did().to_string(),
    };
    Ok(Session::new(user, handle.keypair().clone()))
}

/// Verify a username-password pair against the account document's current
/// ownership set. Wrong password and unknown username are indistinguishable
/// to the caller.
pub async fn verify(
    store: &Arc<dyn DocumentStore>,
    username: &str,
    password: &str,
    namespace: &str,
) -> Result<Session, StoreError> {
    let secure = secure_password_key(username, password);
    let doc = match find_account(store, username, namespace).await {
        Ok(doc) => doc,
        Err(StoreError::NotFound(_)) => {
            return Err(StoreError::Unauthenticated(username.to_string()));
        }
        Err(err) => return Err(err),
    };

    if !doc.ownership.iter().any(|addr| addr == secure.address()) {
        return Err(StoreError::Unauthenticated(username.to_string()));
    }

    let username = resolve_username(&doc).unwrap_or_else(|| username.to_string());
    Ok(Session::new(
        User {
            username,
            did: doc.did.clone(),
        },
        secure,
    ))
}

/// The username cached inside an account document, if present.
pub fn resolve_username(doc: &Document) -> Option<String> {
    doc.resolve_data(USERNAME_PATH)
        .and_then(|v| v.as_text())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;

    const NS: &str = "testnamespace";

    fn temp_store() -> (tempfile::TempDir, Arc<dyn DocumentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("identity.db")).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn register_then_login() {
        let (_dir, store) = temp_store();

        let session = register(store.clone(), "alice@example.com", "hunter2", NS)
            .await
            .unwrap();
        assert_eq!(session.user.username, "alice@example.com");

        let verified = verify(&store, "alice@example.com", "hunter2", NS)
            .await
            .unwrap();
        assert_eq!(verified.user.did, session.user.did);
    }

    #[tokio::test]
    async fn duplicate_registration_already_exists() {
        let (_dir, store) = temp_store();

        register(store.clone(), "bob", "pw", NS).await.unwrap();
        let err = register(store, "bob", "other", NS).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn wrong_password_fails_verification() {
        let (_dir, store) = temp_store();

        register(store.clone(), "carol", "right", NS).await.unwrap();
        let err = verify(&store, "carol", "wrong", NS).await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn unknown_username_is_not_found() {
        let (_dir, store) = temp_store();
        let err = find_account(&store, "nobody", NS).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn username_cached_in_document() {
        let (_dir, store) = temp_store();
        let session = register(store.clone(), "dave", "pw", NS).await.unwrap();

        let doc = store.resolve_latest(&session.user.did).await.unwrap();
        assert_eq!(resolve_username(&doc).as_deref(), Some("dave"));
    }
}
