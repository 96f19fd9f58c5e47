//! Go Dispatcher Account Routing Module
//!
//! Routes every inbound message, outbound message and event arriving on a
//! connector to its next hop according to the owning account's routing
//! table, recording each traversal in the message's hop trail.
//!
//! Inbound: transport -> [billing] -> conversation, router or opt-out.
//! Outbound: conversation, router or opt-out -> [billing] -> transport.
//! Events retrace the stored outbound message's trail in reverse.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConnectorRole, DispatcherConfig};
use crate::connector::{ConnectorDirection, GoConnector, RoutingEndpoint};
use crate::metadata::{collapse_hops_through, reverse_hops, RoutingError, RoutingMetadata};
use crate::observability::{DispatchMetrics, DispatchStats};
use crate::optout::OptOutMatcher;
use crate::protocol::{
    Envelope, Event, HelperMetadata, Message, OptOutMetadata, SessionEvent, Tag, DEFAULT_ENDPOINT,
};
use crate::storage::{AccountStore, MessageStore, StorageError, TagPoolStore, UserAccount};
use crate::transport::{ConnectorBus, TransportError};

/// Per-message dispatch failures. All of them end with the message dropped.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unroutable message {message_id}: {reason}")]
    Unroutable { message_id: String, reason: String },

    #[error("Message {message_id} arrived on tag {tag} which no account owns")]
    NoTagOwner { message_id: String, tag: Tag },

    #[error("No target found for {kind} {message_id} from {source_endpoint}")]
    NoTarget {
        kind: &'static str,
        message_id: String,
        source_endpoint: RoutingEndpoint,
    },

    #[error("Connector {connector:?} does not receive {kind} traffic")]
    UnexpectedConnector { connector: String, kind: &'static str },

    #[error("Cannot deliver {kind} to {target}")]
    InvalidTarget {
        kind: &'static str,
        target: RoutingEndpoint,
    },

    #[error("No connector configured for {0}")]
    NoConnector(String),

    #[error("Hop trail error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DispatchError {
    /// Drops that are part of normal operation rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            DispatchError::Unroutable { .. }
                | DispatchError::NoTagOwner { .. }
                | DispatchError::NoTarget { .. }
        )
    }
}

/// What happened to one dispatched envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published {
        connector: String,
        target: RoutingEndpoint,
    },
    RepliedUnroutable {
        connector: String,
        reply_id: String,
    },
    /// Event for an unroutable auto-reply that has finished its trip.
    Absorbed,
    Dropped {
        reason: String,
    },
}

/// Account routing table dispatcher
pub struct AccountRoutingTableDispatcher {
    config: DispatcherConfig,
    accounts: Arc<dyn AccountStore>,
    tag_pools: Arc<dyn TagPoolStore>,
    message_store: Arc<dyn MessageStore>,
    bus: Arc<dyn ConnectorBus>,
    optouts: OptOutMatcher,
    metrics: DispatchMetrics,
}

impl AccountRoutingTableDispatcher {
    pub fn new(
        config: DispatcherConfig,
        accounts: Arc<dyn AccountStore>,
        tag_pools: Arc<dyn TagPoolStore>,
        message_store: Arc<dyn MessageStore>,
        bus: Arc<dyn ConnectorBus>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let optouts = OptOutMatcher::new(&config.optouts);
        info!(
            inbound = ?config.receive_inbound_connectors,
            outbound = ?config.receive_outbound_connectors,
            billing = config.billing_enabled(),
            "Initialized account routing table dispatcher"
        );

        Ok(Self {
            config,
            accounts,
            tag_pools,
            message_store,
            bus,
            optouts,
            metrics: DispatchMetrics::new(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStats {
        self.metrics.snapshot()
    }

    /// Dispatch one envelope, logging and dropping it on failure.
    pub async fn dispatch(&self, connector_name: &str, envelope: Envelope) -> DispatchOutcome {
        let kind = envelope.kind();
        let id = envelope.id().to_string();
        let account = envelope.helper_metadata().go.user_account.clone();
        let hops = envelope.routing_metadata().hops().to_vec();

        match self.try_dispatch(connector_name, envelope).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics.dropped.inc();
                let account = account.as_deref().unwrap_or("-");
                match &err {
                    DispatchError::Routing(_) => error!(
                        connector = %connector_name,
                        kind,
                        message_id = %id,
                        account,
                        hops = ?hops,
                        error = %err,
                        "Hop trail corrupted, dropping message"
                    ),
                    e if e.is_expected() => info!(
                        connector = %connector_name,
                        kind,
                        message_id = %id,
                        account,
                        error = %err,
                        "Dropping message"
                    ),
                    _ => error!(
                        connector = %connector_name,
                        kind,
                        message_id = %id,
                        account,
                        error = %err,
                        "Dispatch failed, dropping message"
                    ),
                }
                DispatchOutcome::Dropped {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Dispatch one envelope, returning the failure to the caller.
    pub async fn try_dispatch(
        &self,
        connector_name: &str,
        envelope: Envelope,
    ) -> Result<DispatchOutcome, DispatchError> {
        match envelope {
            Envelope::Inbound(msg) => {
                self.metrics.inbound_received.inc();
                if !self.config.receives_inbound(connector_name) {
                    return Err(unexpected(connector_name, "inbound"));
                }
                self.process_inbound(connector_name, msg).await
            }
            Envelope::Outbound(msg) => {
                self.metrics.outbound_received.inc();
                if !self.config.receives_outbound(connector_name) {
                    return Err(unexpected(connector_name, "outbound"));
                }
                self.process_outbound(connector_name, msg).await
            }
            Envelope::Event(event) => {
                self.metrics.events_received.inc();
                if !self.config.receives_inbound(connector_name) {
                    return Err(unexpected(connector_name, "event"));
                }
                self.process_event(connector_name, event).await
            }
        }
    }

    async fn process_inbound(
        &self,
        connector_name: &str,
        mut msg: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let role = self.config.connector_role(connector_name);
        let account_key = self.resolve_inbound_account(&mut msg).await?;
        let account = self.load_account(&account_key, &msg.message_id).await?;

        if role == ConnectorRole::Transport || msg.helper_metadata.optout.is_none() {
            msg.helper_metadata.optout = Some(if account.disable_optouts {
                OptOutMetadata::default()
            } else {
                self.optouts.check(msg.content.as_deref())
            });
        }

        let source = RoutingEndpoint::new(
            source_connector(&role, &msg.helper_metadata, &msg.message_id)?,
            msg.routing_endpoint.clone(),
        );
        msg.routing_metadata.push_source(source.clone())?;

        let lookup_from = table_source(&role, &msg.routing_metadata, &source, &msg.message_id)?;
        let table_target = account
            .routing_table
            .lookup_target(&lookup_from.connector, &lookup_from.endpoint)
            .cloned();

        // Opt-outs beat the table, unless billing has already rated the message.
        let opted_out = msg.helper_metadata.is_optout()
            && !msg.helper_metadata.billing.is_paid
            && self.config.opt_out_connector.is_some();
        let target = if opted_out {
            Some(RoutingEndpoint::new(GoConnector::OptOut, DEFAULT_ENDPOINT))
        } else {
            table_target
        };

        let Some(target) = target else {
            if role == ConnectorRole::Transport {
                return self.handle_unroutable_inbound(connector_name, msg).await;
            }
            return Err(DispatchError::NoTarget {
                kind: "inbound",
                message_id: msg.message_id,
                source_endpoint: lookup_from,
            });
        };

        debug!(
            message_id = %msg.message_id,
            account = %account_key,
            source = %source,
            target = %target,
            "Routing inbound message"
        );

        if role == ConnectorRole::Transport
            && self.config.billing_enabled()
            && target.connector != GoConnector::OptOut
        {
            return self.publish_to_billing(Envelope::Inbound(msg)).await;
        }

        self.deliver_inbound(msg, target).await
    }

    async fn process_outbound(
        &self,
        connector_name: &str,
        mut msg: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let role = self.config.connector_role(connector_name);
        let source = RoutingEndpoint::new(
            source_connector(&role, &msg.helper_metadata, &msg.message_id)?,
            msg.routing_endpoint.clone(),
        );
        msg.routing_metadata.push_source(source.clone())?;

        let target = if role == ConnectorRole::OptOut {
            // Opt-out replies leave on the tag the opt-out arrived on.
            match &msg.helper_metadata.tag {
                Some(tag) => RoutingEndpoint::new(
                    GoConnector::transport_tag(tag.pool.clone(), tag.name.clone()),
                    DEFAULT_ENDPOINT,
                ),
                None => {
                    return Err(DispatchError::NoTarget {
                        kind: "outbound",
                        message_id: msg.message_id,
                        source_endpoint: source,
                    })
                }
            }
        } else {
            let Some(account_key) = msg.helper_metadata.go.user_account.clone() else {
                return Err(DispatchError::Unroutable {
                    message_id: msg.message_id,
                    reason: "outbound message has no user account".into(),
                });
            };
            let account = self.load_account(&account_key, &msg.message_id).await?;
            let lookup_from = table_source(&role, &msg.routing_metadata, &source, &msg.message_id)?;
            match account
                .routing_table
                .lookup_target(&lookup_from.connector, &lookup_from.endpoint)
            {
                Some(target) => target.clone(),
                None => {
                    return Err(DispatchError::NoTarget {
                        kind: "outbound",
                        message_id: msg.message_id,
                        source_endpoint: lookup_from,
                    })
                }
            }
        };

        debug!(
            message_id = %msg.message_id,
            source = %source,
            target = %target,
            "Routing outbound message"
        );

        let billable = !matches!(role, ConnectorRole::OptOut | ConnectorRole::BillingOutbound);
        if billable && self.config.billing_enabled() && target.connector.is_transport_tag() {
            return self.publish_to_billing(Envelope::Outbound(msg)).await;
        }

        self.deliver_outbound(msg, target).await
    }

    async fn process_event(
        &self,
        connector_name: &str,
        mut event: Event,
    ) -> Result<DispatchOutcome, DispatchError> {
        let role = self.config.connector_role(connector_name);
        match role {
            ConnectorRole::Transport => self.attach_outbound_trail(&mut event).await?,
            ConnectorRole::RouterOutbound { .. } => {}
            _ => return Err(unexpected(connector_name, "event")),
        }

        let source = RoutingEndpoint::new(
            source_connector(&role, &event.helper_metadata, &event.event_id)?,
            event.routing_endpoint.clone(),
        );
        let expected = event
            .routing_metadata
            .outbound_hops()
            .and_then(|hops| hops.get(event.routing_metadata.hops().len()))
            .map(|hop| hop.source());
        if let Some(expected) = expected.filter(|expected| **expected != source) {
            warn!(
                event_id = %event.event_id,
                source = %source,
                expected = %expected,
                "Event arrived from an unexpected hop"
            );
        }
        event.routing_metadata.push_source(source.clone())?;

        match event.routing_metadata.next_hop().cloned() {
            Some(target) => self.deliver_event(event, target).await,
            None if event.routing_metadata.unroutable_event_done() => {
                self.metrics.events_absorbed.inc();
                debug!(
                    event_id = %event.event_id,
                    user_message_id = %event.user_message_id,
                    "Absorbed event for unroutable reply"
                );
                Ok(DispatchOutcome::Absorbed)
            }
            None => Err(DispatchError::NoTarget {
                kind: "event",
                message_id: event.event_id,
                source_endpoint: source,
            }),
        }
    }

    /// Copy what an event from a transport needs from the stored outbound
    /// message: its reversed trail, tag, account and unroutable marking.
    async fn attach_outbound_trail(&self, event: &mut Event) -> Result<(), DispatchError> {
        let Some(outbound) = self
            .message_store
            .get_outbound_message(&event.user_message_id)
            .await?
        else {
            return Err(DispatchError::Unroutable {
                message_id: event.event_id.clone(),
                reason: format!("no stored outbound message {}", event.user_message_id),
            });
        };

        let forward =
            collapse_hops_through(outbound.routing_metadata.hops(), &GoConnector::Billing);
        event.routing_metadata.set_hops(Vec::new());
        event.routing_metadata.set_outbound_hops(reverse_hops(&forward));
        if outbound.routing_metadata.get_unroutable_reply() {
            event.routing_metadata.set_unroutable_reply();
        }
        if event.helper_metadata.tag.is_none() {
            event.helper_metadata.tag = outbound.helper_metadata.tag.clone();
        }
        if event.helper_metadata.go.user_account.is_none() {
            event.helper_metadata.go.user_account =
                outbound.helper_metadata.go.user_account.clone();
        }
        event.routing_endpoint = outbound.routing_endpoint;
        Ok(())
    }

    async fn resolve_inbound_account(&self, msg: &mut Message) -> Result<String, DispatchError> {
        if let Some(account_key) = &msg.helper_metadata.go.user_account {
            return Ok(account_key.clone());
        }
        let Some(tag) = msg.helper_metadata.tag.clone() else {
            return Err(DispatchError::Unroutable {
                message_id: msg.message_id.clone(),
                reason: "no user account or tag".into(),
            });
        };
        match self.accounts.get_tag_owner(&tag).await? {
            Some(owner) => {
                msg.helper_metadata.go.user_account = Some(owner.clone());
                Ok(owner)
            }
            None => Err(DispatchError::NoTagOwner {
                message_id: msg.message_id.clone(),
                tag,
            }),
        }
    }

    async fn load_account(
        &self,
        account_key: &str,
        message_id: &str,
    ) -> Result<UserAccount, DispatchError> {
        self.accounts
            .get_account(account_key)
            .await?
            .ok_or_else(|| DispatchError::Unroutable {
                message_id: message_id.to_string(),
                reason: format!("unknown account {account_key:?}"),
            })
    }

    async fn handle_unroutable_inbound(
        &self,
        connector_name: &str,
        msg: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(tag) = msg.helper_metadata.tag.clone() else {
            return Err(DispatchError::Unroutable {
                message_id: msg.message_id,
                reason: "no route and no tag".into(),
            });
        };
        let pool = self.tag_pools.get_pool_metadata(&tag.pool).await?;
        if !pool.reply_to_unroutable_inbound {
            return Err(DispatchError::Unroutable {
                message_id: msg.message_id,
                reason: format!("no route for tag {tag}"),
            });
        }
        if matches!(msg.session_event, Some(SessionEvent::Resume | SessionEvent::Close)) {
            return Err(DispatchError::Unroutable {
                message_id: msg.message_id,
                reason: format!("no route for tag {tag}, not replying mid-session"),
            });
        }

        let content = pool
            .unroutable_inbound_reply
            .unwrap_or_else(|| self.config.default_unroutable_inbound_reply.clone());
        let mut reply = msg.reply(content);
        reply.routing_metadata.set_unroutable_reply();

        // Always stored so the reply's events can be recognised later.
        self.message_store.add_outbound_message(&reply).await?;
        self.metrics.persisted.inc();

        let reply_id = reply.message_id.clone();
        self.publish(connector_name, Envelope::Outbound(reply)).await?;
        self.metrics.unroutable_replies.inc();
        info!(
            connector = %connector_name,
            message_id = %msg.message_id,
            reply_id = %reply_id,
            tag = %tag,
            "Replied to unroutable inbound message"
        );

        Ok(DispatchOutcome::RepliedUnroutable {
            connector: connector_name.to_string(),
            reply_id,
        })
    }

    async fn publish_to_billing(
        &self,
        envelope: Envelope,
    ) -> Result<DispatchOutcome, DispatchError> {
        let target = RoutingEndpoint::new(GoConnector::Billing, DEFAULT_ENDPOINT);
        let (connector, envelope) = match envelope {
            Envelope::Inbound(mut msg) => {
                close_hop(&mut msg.routing_metadata, &mut msg.routing_endpoint, &target)?;
                (self.config.billing_inbound_connector.clone(), Envelope::Inbound(msg))
            }
            Envelope::Outbound(mut msg) => {
                close_hop(&mut msg.routing_metadata, &mut msg.routing_endpoint, &target)?;
                (self.config.billing_outbound_connector.clone(), Envelope::Outbound(msg))
            }
            Envelope::Event(_) => {
                return Err(DispatchError::InvalidTarget { kind: "event", target });
            }
        };
        let connector = connector.ok_or_else(|| DispatchError::NoConnector("billing".into()))?;
        self.publish(&connector, envelope).await?;
        Ok(DispatchOutcome::Published { connector, target })
    }

    async fn deliver_inbound(
        &self,
        mut msg: Message,
        target: RoutingEndpoint,
    ) -> Result<DispatchOutcome, DispatchError> {
        let connector = match &target.connector {
            GoConnector::Conversation {
                conversation_type,
                conversation_key,
            } => {
                msg.helper_metadata.set_conversation(conversation_type, conversation_key);
                mapped(
                    &self.config.application_connector_mapping,
                    conversation_type,
                    "conversation type",
                )?
            }
            GoConnector::Router {
                router_type,
                router_key,
                direction: ConnectorDirection::Inbound,
            } => {
                msg.helper_metadata.set_router(router_type, router_key);
                mapped(&self.config.router_inbound_connector_mapping, router_type, "router type")?
            }
            GoConnector::OptOut => self
                .config
                .opt_out_connector
                .clone()
                .ok_or_else(|| DispatchError::NoConnector("opt-out".into()))?,
            _ => return Err(DispatchError::InvalidTarget { kind: "inbound", target }),
        };

        close_hop(&mut msg.routing_metadata, &mut msg.routing_endpoint, &target)?;
        self.publish(&connector, Envelope::Inbound(msg)).await?;
        Ok(DispatchOutcome::Published { connector, target })
    }

    async fn deliver_outbound(
        &self,
        mut msg: Message,
        target: RoutingEndpoint,
    ) -> Result<DispatchOutcome, DispatchError> {
        match &target.connector {
            GoConnector::Router {
                router_type,
                router_key,
                direction: ConnectorDirection::Outbound,
            } => {
                let connector = mapped(
                    &self.config.router_outbound_connector_mapping,
                    router_type,
                    "router type",
                )?;
                msg.helper_metadata.set_router(router_type, router_key);
                close_hop(&mut msg.routing_metadata, &mut msg.routing_endpoint, &target)?;
                self.publish(&connector, Envelope::Outbound(msg)).await?;
                Ok(DispatchOutcome::Published { connector, target })
            }
            GoConnector::TransportTag { pool, tagname } => {
                let metadata = self.tag_pools.get_pool_metadata(pool).await?;
                let connector = metadata.transport_name.ok_or_else(|| {
                    DispatchError::NoConnector(format!("transport for pool {pool:?}"))
                })?;
                msg.helper_metadata.tag = Some(Tag::new(pool.clone(), tagname.clone()));
                close_hop(&mut msg.routing_metadata, &mut msg.routing_endpoint, &target)?;

                if self.config.store_messages_to_transports {
                    self.message_store.add_outbound_message(&msg).await?;
                    self.metrics.persisted.inc();
                }
                self.publish(&connector, Envelope::Outbound(msg)).await?;
                Ok(DispatchOutcome::Published { connector, target })
            }
            _ => Err(DispatchError::InvalidTarget { kind: "outbound", target }),
        }
    }

    async fn deliver_event(
        &self,
        mut event: Event,
        target: RoutingEndpoint,
    ) -> Result<DispatchOutcome, DispatchError> {
        let connector = match &target.connector {
            GoConnector::Conversation {
                conversation_type,
                conversation_key,
            } => {
                event.helper_metadata.set_conversation(conversation_type, conversation_key);
                mapped(
                    &self.config.application_connector_mapping,
                    conversation_type,
                    "conversation type",
                )?
            }
            GoConnector::Router {
                router_type,
                router_key,
                direction: ConnectorDirection::Inbound,
            } => {
                event.helper_metadata.set_router(router_type, router_key);
                mapped(&self.config.router_inbound_connector_mapping, router_type, "router type")?
            }
            GoConnector::OptOut => self
                .config
                .opt_out_connector
                .clone()
                .ok_or_else(|| DispatchError::NoConnector("opt-out".into()))?,
            _ => return Err(DispatchError::InvalidTarget { kind: "event", target }),
        };

        close_hop(&mut event.routing_metadata, &mut event.routing_endpoint, &target)?;
        self.publish(&connector, Envelope::Event(event)).await?;
        Ok(DispatchOutcome::Published { connector, target })
    }

    async fn publish(&self, connector: &str, envelope: Envelope) -> Result<(), DispatchError> {
        debug!(connector = %connector, kind = envelope.kind(), id = %envelope.id(), "Publishing");
        self.bus.publish(connector, envelope).await?;
        self.metrics.published.inc();
        Ok(())
    }
}

fn unexpected(connector_name: &str, kind: &'static str) -> DispatchError {
    DispatchError::UnexpectedConnector {
        connector: connector_name.to_string(),
        kind,
    }
}

fn mapped(
    mapping: &HashMap<String, String>,
    key: &str,
    what: &str,
) -> Result<String, DispatchError> {
    mapping
        .get(key)
        .cloned()
        .ok_or_else(|| DispatchError::NoConnector(format!("{what} {key:?}")))
}

fn close_hop(
    routing_metadata: &mut RoutingMetadata,
    routing_endpoint: &mut String,
    target: &RoutingEndpoint,
) -> Result<(), RoutingError> {
    routing_metadata.push_destination(target.clone())?;
    *routing_endpoint = target.endpoint.clone();
    Ok(())
}

/// The connector a message arriving on a connector with `role` comes from.
fn source_connector(
    role: &ConnectorRole,
    helper_metadata: &HelperMetadata,
    message_id: &str,
) -> Result<GoConnector, DispatchError> {
    let missing = |what: &str| DispatchError::Unroutable {
        message_id: message_id.to_string(),
        reason: format!("missing {what}"),
    };
    let go = &helper_metadata.go;

    match role {
        ConnectorRole::Transport => {
            let tag = helper_metadata.tag.as_ref().ok_or_else(|| missing("tag"))?;
            Ok(GoConnector::transport_tag(tag.pool.clone(), tag.name.clone()))
        }
        ConnectorRole::Application { conversation_type } => {
            let key = go.conversation_key.clone().ok_or_else(|| missing("conversation key"))?;
            let ctype = go.conversation_type.clone().unwrap_or_else(|| conversation_type.clone());
            Ok(GoConnector::conversation(ctype, key))
        }
        ConnectorRole::RouterInbound { router_type }
        | ConnectorRole::RouterOutbound { router_type } => {
            let key = go.router_key.clone().ok_or_else(|| missing("router key"))?;
            let rtype = go.router_type.clone().unwrap_or_else(|| router_type.clone());
            let direction = match role {
                ConnectorRole::RouterInbound { .. } => ConnectorDirection::Inbound,
                _ => ConnectorDirection::Outbound,
            };
            Ok(GoConnector::router(rtype, key, direction))
        }
        ConnectorRole::OptOut => Ok(GoConnector::OptOut),
        ConnectorRole::BillingInbound | ConnectorRole::BillingOutbound => Ok(GoConnector::Billing),
    }
}

/// The routing table key for a message. Messages back from billing are
/// routed as if they came from wherever they were before billing.
fn table_source(
    role: &ConnectorRole,
    routing_metadata: &RoutingMetadata,
    source: &RoutingEndpoint,
    message_id: &str,
) -> Result<RoutingEndpoint, DispatchError> {
    match role {
        ConnectorRole::BillingInbound | ConnectorRole::BillingOutbound => routing_metadata
            .previous_source()
            .cloned()
            .ok_or_else(|| DispatchError::Unroutable {
                message_id: message_id.to_string(),
                reason: "returned from billing without a hop into billing".into(),
            }),
        _ => Ok(source.clone()),
    }
}
