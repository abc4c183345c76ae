//! Key derivation for document identifiers and signing addresses

use bech32::Bech32m;
use uuid7::uuid7;

const ADDRESS_HRP: &str = "gcaddr";
const DID_HRP: &str = "gc";
const DID_PREFIX: &str = "did:gc:";

/// A signing keypair. The did it derives names a document; the address is
/// what appears in a document's ownership set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    secret: [u8; 32],
    address: String,
    did: String,
}

impl Keypair {
    /// Deterministic derivation from a (name, namespace) pair. Same inputs
    /// always yield the same keypair, which is how collections and the
    /// driver/recipient registries are discoverable without prior state.
    pub fn derive(name: &[u8], namespace: &[u8]) -> Self {
        let mut input = Vec::with_capacity(namespace.len() + name.len() + 1);
        input.extend_from_slice(namespace);
        input.push(0);
        input.extend_from_slice(name);
        Self::from_secret(digest32(&input))
    }

    /// A fresh random keypair, for documents whose id must be unguessable.
    pub fn generate() -> Self {
        let mut input = Vec::with_capacity(32);
        input.extend_from_slice(uuid7().as_bytes());
        input.extend_from_slice(uuid7().as_bytes());
        Self::from_secret(digest32(&input))
    }

    fn from_secret(secret: [u8; 32]) -> Self {
        let address = encode_hrp(ADDRESS_HRP, &tagged_digest(b"addr", &secret)[..20]);
        let did = format!(
            "{}{}",
            DID_PREFIX,
            encode_hrp(DID_HRP, &tagged_digest(b"did", &secret)[..20])
        );
        Self {
            secret,
            address,
            did,
        }
    }

    /// Raw secret, for callers that persist a credential across sessions.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Bech32m signer address, the unit of the ownership set.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The did of the document this key creates.
    pub fn did(&self) -> &str {
        &self.did
    }
}

fn tagged_digest(tag: &[u8], secret: &[u8; 32]) -> [u8; 32] {
    let mut input = Vec::with_capacity(tag.len() + 32);
    input.extend_from_slice(tag);
    input.extend_from_slice(secret);
    digest32(&input)
}

fn digest32(input: &[u8]) -> [u8; 32] {
    let hex_digest = sha256::digest(input);
    let bytes = hex::decode(hex_digest).expect("sha256 digest is valid hex");
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out
}

fn encode_hrp(hrp: &str, payload: &[u8]) -> String {
    let hrp = bech32::Hrp::parse(hrp).expect("static hrp parses");
    bech32::encode::<Bech32m>(hrp, payload).expect("bech32 encoding of short payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = Keypair::derive(b"alice", b"testnamespace");
        let b = Keypair::derive(b"alice", b"testnamespace");
        assert_eq!(a, b);
        assert_eq!(a.did(), b.did());
    }

    #[test]
    fn namespace_separates_names() {
        let a = Keypair::derive(b"alice", b"ns-one");
        let b = Keypair::derive(b"alice", b"ns-two");
        assert_ne!(a.did(), b.did());
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn generate_is_unguessable() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.did(), b.did());
    }

    #[test]
    fn did_and_address_are_distinct_encodings() {
        let key = Keypair::derive(b"drivers", b"testnamespace");
        assert!(key.did().starts_with("did:gc:"));
        assert!(key.address().starts_with("gcaddr1"));
        assert!(!key.did().contains(key.address()));
    }
}
