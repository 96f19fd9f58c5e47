//! Go Dispatcher Storage Module
//!
//! Lookup services the dispatcher depends on: accounts and tag ownership,
//! tag pool policy, and the outbound message store. Each is a trait so the
//! real backends live outside this crate; the in-memory versions here keep
//! records in serialized form so every read builds fresh values.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::{Message, Tag};
use crate::routing_table::{RoutingTable, RoutingTableError};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Refusing to save invalid routing table for {account}: {source}")]
    InvalidRoutingTable {
        account: String,
        #[source]
        source: RoutingTableError,
    },
}

/// The slice of an account the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub key: String,
    #[serde(default)]
    pub routing_table: RoutingTable,
    #[serde(default)]
    pub disable_optouts: bool,
}

impl UserAccount {
    pub fn new(key: impl Into<String>, routing_table: RoutingTable) -> Self {
        Self {
            key: key.into(),
            routing_table,
            disable_optouts: false,
        }
    }
}

/// Per-pool policy flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagPoolMetadata {
    /// Transport connector serving tags from this pool
    pub transport_name: Option<String>,
    pub reply_to_unroutable_inbound: bool,
    /// Overrides the dispatcher's default unroutable reply text
    pub unroutable_inbound_reply: Option<String>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, account_key: &str) -> Result<Option<UserAccount>, StorageError>;
    async fn get_tag_owner(&self, tag: &Tag) -> Result<Option<String>, StorageError>;
}

#[async_trait]
pub trait TagPoolStore: Send + Sync {
    /// Unknown pools yield default metadata.
    async fn get_pool_metadata(&self, pool: &str) -> Result<TagPoolMetadata, StorageError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn add_outbound_message(&self, message: &Message) -> Result<(), StorageError>;
    async fn get_outbound_message(&self, message_id: &str) -> Result<Option<Message>, StorageError>;
}

/// In-memory account and tag ownership store
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<String, String>,
    tag_owners: DashMap<Tag, String>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist an account. The routing table must validate first.
    pub fn save_account(&self, account: &UserAccount) -> Result<(), StorageError> {
        account
            .routing_table
            .validate_all_entries()
            .map_err(|source| StorageError::InvalidRoutingTable {
                account: account.key.clone(),
                source,
            })?;
        let record = serde_json::to_string(account)?;
        self.accounts.insert(account.key.clone(), record);
        info!(account = %account.key, entries = account.routing_table.len(), "Saved account");
        Ok(())
    }

    pub fn set_tag_owner(&self, tag: Tag, account_key: impl Into<String>) {
        self.tag_owners.insert(tag, account_key.into());
    }

    pub fn release_tag(&self, tag: &Tag) -> Option<String> {
        self.tag_owners.remove(tag).map(|(_, owner)| owner)
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, account_key: &str) -> Result<Option<UserAccount>, StorageError> {
        let Some(record) = self.accounts.get(account_key).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&record)?))
    }

    async fn get_tag_owner(&self, tag: &Tag) -> Result<Option<String>, StorageError> {
        Ok(self.tag_owners.get(tag).map(|r| r.clone()))
    }
}

/// In-memory tag pool configuration
#[derive(Default)]
pub struct InMemoryTagPoolStore {
    pools: DashMap<String, TagPoolMetadata>,
}

impl InMemoryTagPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pools(pools: HashMap<String, TagPoolMetadata>) -> Self {
        Self {
            pools: pools.into_iter().collect(),
        }
    }

    pub fn set_pool_metadata(&self, pool: impl Into<String>, metadata: TagPoolMetadata) {
        self.pools.insert(pool.into(), metadata);
    }
}

#[async_trait]
impl TagPoolStore for InMemoryTagPoolStore {
    async fn get_pool_metadata(&self, pool: &str) -> Result<TagPoolMetadata, StorageError> {
        Ok(self.pools.get(pool).map(|r| r.clone()).unwrap_or_default())
    }
}

/// In-memory outbound message store
#[derive(Default)]
pub struct InMemoryMessageStore {
    outbound: DashMap<String, String>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn add_outbound_message(&self, message: &Message) -> Result<(), StorageError> {
        let record = serde_json::to_string(message)?;
        self.outbound.insert(message.message_id.clone(), record);
        debug!(message_id = %message.message_id, "Stored outbound message");
        Ok(())
    }

    async fn get_outbound_message(
        &self,
        message_id: &str,
    ) -> Result<Option<Message>, StorageError> {
        let Some(record) = self.outbound.get(message_id).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&record)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::GoConnector;

    fn routed_account() -> UserAccount {
        let tag = GoConnector::transport_tag("pool1", "1234");
        let conv = GoConnector::conversation("app1", "conv1");
        let mut table = RoutingTable::new();
        table.add_entry(tag.clone(), "default", conv.clone(), "default");
        table.add_entry(conv, "default", tag, "default");
        UserAccount::new("acc1", table)
    }

    #[tokio::test]
    async fn test_account_roundtrip() {
        let store = InMemoryAccountStore::new();
        store.save_account(&routed_account()).unwrap();

        let loaded = store.get_account("acc1").await.unwrap();
        assert_eq!(loaded, Some(routed_account()));
        assert_eq!(store.get_account("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_table_is_not_saved() {
        let store = InMemoryAccountStore::new();
        let mut account = routed_account();
        account
            .routing_table
            .remove_entry(&GoConnector::conversation("app1", "conv1"), "default");

        let result = store.save_account(&account);
        assert!(matches!(result, Err(StorageError::InvalidRoutingTable { .. })));
        assert_eq!(store.get_account("acc1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tag_ownership() {
        let store = InMemoryAccountStore::new();
        let tag = Tag::new("pool1", "1234");
        assert_eq!(store.get_tag_owner(&tag).await.unwrap(), None);

        store.set_tag_owner(tag.clone(), "acc1");
        assert_eq!(store.get_tag_owner(&tag).await.unwrap().as_deref(), Some("acc1"));

        assert_eq!(store.release_tag(&tag).as_deref(), Some("acc1"));
        assert_eq!(store.get_tag_owner(&tag).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_pool_has_defaults() {
        let store = InMemoryTagPoolStore::new();
        assert_eq!(
            store.get_pool_metadata("missing").await.unwrap(),
            TagPoolMetadata::default()
        );
    }

    #[tokio::test]
    async fn test_message_store_roundtrip() {
        let store = InMemoryMessageStore::new();
        let mut msg = Message::new("+27831234567", "1234", Some("hi".into()));
        msg.routing_metadata.set_unroutable_reply();
        store.add_outbound_message(&msg).await.unwrap();

        let loaded = store.get_outbound_message(&msg.message_id).await.unwrap().unwrap();
        assert_eq!(loaded, msg);
        assert_eq!(store.outbound_count(), 1);
    }
}
