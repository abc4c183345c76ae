//! Core document types: the path-addressed data tree, transactions, and
//! the append-only tip chain.

use std::collections::BTreeMap;

use crate::error::StoreError;

/// A JSON-like value stored in a document's data tree.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Value {
    #[n(0)]
    Bool(#[n(0)] bool),
    #[n(1)]
    Int(#[n(0)] i64),
    #[n(2)]
    Text(#[n(0)] String),
    #[n(3)]
    List(#[n(0)] Vec<Value>),
    #[n(4)]
    Map(#[n(0)] BTreeMap<String, Value>),
}

impl Value {
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

/// The two transaction kinds the document store accepts.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Transaction {
    #[n(0)]
    SetData {
        #[n(0)]
        path: String,
        #[n(1)]
        value: Value,
    },
    #[n(1)]
    SetOwnership {
        #[n(0)]
        addresses: Vec<String>,
    },
}

pub fn set_data(path: impl Into<String>, value: Value) -> Transaction {
    Transaction::SetData {
        path: path.into(),
        value,
    }
}

pub fn set_ownership(addresses: Vec<String>) -> Transaction {
    Transaction::SetOwnership { addresses }
}

/// Key-owned, content-addressed, append-only state container.
///
/// The tip advances on every accepted transaction batch; documents are never
/// deleted. A transaction is accepted only when signed by a key whose address
/// resolves into the current ownership set (the store enforces this).
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Document {
    #[n(0)]
    pub did: String,
    #[n(1)]
    pub tip: String,
    #[n(2)]
    data: Value,
    #[n(3)]
    pub ownership: Vec<String>,
}

impl Document {
    /// A brand-new empty document owned by a single address, at the genesis
    /// tip derived from its did.
    pub fn new_empty(did: impl Into<String>, owner_address: impl Into<String>) -> Self {
        let did = did.into();
        let tip = genesis_tip(&did);
        Self {
            did,
            tip,
            data: Value::empty_map(),
            ownership: vec![owner_address.into()],
        }
    }

    /// Resolve a slash-separated path in the data tree. Absent paths are
    /// `None`, never an error.
    pub fn resolve_data(&self, path: &str) -> Option<&Value> {
        let mut current = &self.data;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Apply an ordered transaction batch, advancing the tip. `SetData`
    /// creates intermediate maps as needed and never deletes; `SetOwnership`
    /// replaces the whole ownership list.
    pub fn apply(&mut self, transactions: &[Transaction]) -> Result<(), StoreError> {
        for tx in transactions {
            match tx {
                Transaction::SetData { path, value } => self.set_path(path, value.clone()),
                Transaction::SetOwnership { addresses } => {
                    self.ownership = addresses.clone();
                }
            }
        }
        self.tip = chained_tip(&self.tip, transactions)?;
        Ok(())
    }

    fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return;
        }
        let mut current = &mut self.data;
        for segment in &segments[..segments.len() - 1] {
            // a scalar in the middle of a path is overwritten by a map
            if current.as_map().is_none() {
                *current = Value::empty_map();
            }
            let Value::Map(entries) = current else {
                unreachable!()
            };
            current = entries
                .entry((*segment).to_string())
                .or_insert_with(Value::empty_map);
        }
        if current.as_map().is_none() {
            *current = Value::empty_map();
        }
        if let Value::Map(entries) = current {
            entries.insert(segments[segments.len() - 1].to_string(), value);
        }
    }
}

/// Tip of a document that has never accepted a transaction.
pub fn genesis_tip(did: &str) -> String {
    sha256::digest(did.as_bytes())
}

/// The next tip: hash of the previous tip chained with the canonical CBOR
/// encoding of the accepted batch.
pub fn chained_tip(prev: &str, transactions: &[Transaction]) -> Result<String, StoreError> {
    let encoded =
        minicbor::to_vec(transactions).map_err(|e| StoreError::Encoding(e.to_string()))?;
    let mut input = prev.as_bytes().to_vec();
    input.extend_from_slice(&encoded);
    Ok(sha256::digest(&input))
}
