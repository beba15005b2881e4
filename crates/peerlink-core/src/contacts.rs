//! Contact records and the storage contract.
//!
//! Storage itself lives outside the protocol core; the core only needs
//! get/put/delete by address id. [`MemoryContactStore`] backs tests and the
//! CLI loopback.

use crate::address::{Address, EMPTY_ID};
use crate::error::{ProtocolError, Result};
use crate::transport::Message;
use async_trait::async_trait;
use dashmap::DashMap;

/// A known peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    /// Peer address; the identity key is the trust anchor for later sessions
    pub address: Address,
    /// Display name
    pub username: String,
    /// Extra data the peer sent during its last negotiation
    pub extra: Message,
}

impl Contact {
    /// Create a contact.
    pub fn new(address: Address, username: impl Into<String>, extra: Message) -> Self {
        Self {
            address,
            username: username.into(),
            extra,
        }
    }

    /// Address id.
    pub fn id(&self) -> &str {
        self.address.id()
    }
}

/// Contact persistence.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Look up a contact by address id.
    async fn get(&self, id: &str) -> Result<Option<Contact>>;

    /// Insert or replace a contact.
    async fn put(&self, contact: Contact) -> Result<()>;

    /// Remove a contact; returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// All stored ids.
    async fn ids(&self) -> Result<Vec<String>>;
}

/// In-memory [`ContactStore`].
#[derive(Debug, Default)]
pub struct MemoryContactStore {
    contacts: DashMap<String, Contact>,
}

impl MemoryContactStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contacts.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn get(&self, id: &str) -> Result<Option<Contact>> {
        Ok(self.contacts.get(id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, contact: Contact) -> Result<()> {
        if contact.id() == EMPTY_ID {
            return Err(ProtocolError::Storage(
                "contact has no identity key".to_string(),
            ));
        }
        self.contacts.insert(contact.id().to_string(), contact);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.contacts.remove(id).is_some())
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self
            .contacts
            .iter()
            .map(|entry| entry.key().clone())
            .collect())
    }
}
