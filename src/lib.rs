//! Go Dispatcher - Account-Aware Message Routing
//!
//! The routing core of a multi-tenant messaging platform:
//! - Per-account routing tables between transports, conversations and routers
//! - Hop trails on every message so events retrace the outbound path
//! - Optional billing stage and opt-out handling
//! - Auto-replies to unroutable inbound messages
//! - Per-account concurrency limiting

pub mod concurrency;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod metadata;
pub mod observability;
pub mod optout;
pub mod protocol;
pub mod routing_table;
pub mod storage;
pub mod transport;

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use concurrency::{ConcurrencyLimitManager, ConcurrencyLimiter, ConcurrencyLimiterError};
pub use config::{ConfigError, ConnectorRole, DispatcherConfig, WorkerConfig};
pub use connector::{ConnectorDirection, ConnectorError, GoConnector, RoutingEndpoint};
pub use dispatcher::{AccountRoutingTableDispatcher, DispatchError, DispatchOutcome};
pub use metadata::{Hop, RoutingError, RoutingMetadata};
pub use observability::DispatchStats;
pub use protocol::*;
pub use routing_table::{RoutingTable, RoutingTableError};
pub use storage::{
    AccountStore, InMemoryAccountStore, InMemoryMessageStore, InMemoryTagPoolStore, MessageStore,
    StorageError, TagPoolMetadata, TagPoolStore, UserAccount,
};
pub use transport::{ChannelBus, ConnectorBus, MemoryBus, Published, TransportError};

/// Go Dispatcher errors
#[derive(Error, Debug)]
pub enum GoDispatcherError {
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),
    #[error("Routing table error: {0}")]
    RoutingTable(#[from] RoutingTableError),
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyLimiterError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// A dispatcher wired to in-memory collaborators seeded from a
/// [`WorkerConfig`], with dispatches limited per account.
pub struct Worker {
    pub dispatcher: Arc<AccountRoutingTableDispatcher>,
    pub accounts: Arc<InMemoryAccountStore>,
    pub tag_pools: Arc<InMemoryTagPoolStore>,
    pub messages: Arc<InMemoryMessageStore>,
    pub limits: Arc<ConcurrencyLimitManager>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        bus: Arc<dyn ConnectorBus>,
    ) -> Result<Self, GoDispatcherError> {
        let accounts = Arc::new(InMemoryAccountStore::new());
        for account in &config.accounts {
            accounts.save_account(account)?;
        }
        for owner in config.tag_owners {
            accounts.set_tag_owner(owner.tag, owner.account);
        }
        let tag_pools = Arc::new(InMemoryTagPoolStore::from_pools(config.tag_pools));
        let messages = Arc::new(InMemoryMessageStore::new());

        let dispatcher = AccountRoutingTableDispatcher::new(
            config.dispatcher,
            accounts.clone(),
            tag_pools.clone(),
            messages.clone(),
            bus,
        )?;

        info!(
            accounts = config.accounts.len(),
            account_concurrency = config.account_concurrency,
            "Worker ready"
        );

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            accounts,
            tag_pools,
            messages,
            limits: Arc::new(ConcurrencyLimitManager::new(config.account_concurrency)),
        })
    }

    /// Dispatch one envelope once its account has a free slot.
    pub async fn handle(
        &self,
        connector: &str,
        envelope: Envelope,
    ) -> Result<DispatchOutcome, GoDispatcherError> {
        let key = self.limit_key(connector, &envelope).await?;
        let outcome = self
            .limits
            .run(&key, self.dispatcher.dispatch(connector, envelope))
            .await?;
        Ok(outcome)
    }

    /// The account an envelope is limited under. Events without an account
    /// take it from their stored outbound message and inbound messages from
    /// their tag's owner. Envelopes that still resolve to no account are
    /// limited per arriving connector.
    pub async fn limit_key(
        &self,
        connector: &str,
        envelope: &Envelope,
    ) -> Result<String, GoDispatcherError> {
        let helper = envelope.helper_metadata();
        if let Some(account) = &helper.go.user_account {
            return Ok(account.clone());
        }

        let account = match envelope {
            Envelope::Event(event) => self
                .messages
                .get_outbound_message(&event.user_message_id)
                .await?
                .and_then(|message| message.helper_metadata.go.user_account),
            Envelope::Inbound(_) | Envelope::Outbound(_) => match &helper.tag {
                Some(tag) => self.accounts.get_tag_owner(tag).await?,
                None => None,
            },
        };
        Ok(account.unwrap_or_else(|| format!("connector:{connector}")))
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }
}
