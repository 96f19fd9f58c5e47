//! Go Dispatcher Protocol Module
//!
//! Typed message envelope: user messages, events, and the helper metadata
//! the dispatcher reads and writes on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::RoutingMetadata;

/// Endpoint name used when a message does not carry one.
pub const DEFAULT_ENDPOINT: &str = "default";

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn new_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// A tag leased from a tag pool, serialized as `[pool, tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Tag {
    pub pool: String,
    pub name: String,
}

impl Tag {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }
}

impl From<(String, String)> for Tag {
    fn from((pool, name): (String, String)) -> Self {
        Self { pool, name }
    }
}

impl From<Tag> for (String, String) {
    fn from(tag: Tag) -> Self {
        (tag.pool, tag.name)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pool, self.name)
    }
}

/// Session state carried by session-based transports (USSD and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEvent {
    New,
    Resume,
    Close,
}

/// `helper_metadata.go`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_key: Option<String>,
}

/// `helper_metadata.optout`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptOutMetadata {
    pub optout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optout_keyword: Option<String>,
}

/// `helper_metadata.billing`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingMetadata {
    #[serde(default)]
    pub is_paid: bool,
}

/// Side-channel metadata written by the dispatcher and its neighbours.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperMetadata {
    #[serde(default)]
    pub go: GoMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optout: Option<OptOutMetadata>,
    #[serde(default)]
    pub billing: BillingMetadata,
}

impl HelperMetadata {
    pub fn is_optout(&self) -> bool {
        self.optout.as_ref().map(|o| o.optout).unwrap_or(false)
    }

    pub fn set_conversation(&mut self, conversation_type: &str, conversation_key: &str) {
        self.go.conversation_type = Some(conversation_type.to_string());
        self.go.conversation_key = Some(conversation_key.to_string());
    }

    pub fn set_router(&mut self, router_type: &str, router_key: &str) {
        self.go.router_type = Some(router_type.to_string());
        self.go.router_key = Some(router_key.to_string());
    }
}

/// A user message travelling inbound (towards applications) or outbound
/// (towards transports).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "new_id")]
    pub message_id: String,
    pub to_addr: String,
    pub from_addr: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub session_event: Option<SessionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default = "default_endpoint")]
    pub routing_endpoint: String,
    #[serde(default)]
    pub helper_metadata: HelperMetadata,
    #[serde(default)]
    pub routing_metadata: RoutingMetadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        to_addr: impl Into<String>,
        from_addr: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Self {
            message_id: new_id(),
            to_addr: to_addr.into(),
            from_addr: from_addr.into(),
            content,
            session_event: None,
            in_reply_to: None,
            routing_endpoint: default_endpoint(),
            helper_metadata: HelperMetadata::default(),
            routing_metadata: RoutingMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    /// Build a reply addressed back to the sender.
    ///
    /// Tag and account are carried over; routing metadata starts empty.
    /// Replies to session messages close the session.
    pub fn reply(&self, content: impl Into<String>) -> Self {
        let mut helper_metadata = HelperMetadata::default();
        helper_metadata.tag = self.helper_metadata.tag.clone();
        helper_metadata.go.user_account = self.helper_metadata.go.user_account.clone();

        Self {
            message_id: new_id(),
            to_addr: self.from_addr.clone(),
            from_addr: self.to_addr.clone(),
            content: Some(content.into()),
            session_event: self.session_event.map(|_| SessionEvent::Close),
            in_reply_to: Some(self.message_id.clone()),
            routing_endpoint: self.routing_endpoint.clone(),
            helper_metadata,
            routing_metadata: RoutingMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.helper_metadata.tag = Some(tag);
        self
    }

    pub fn with_account(mut self, account_key: impl Into<String>) -> Self {
        self.helper_metadata.go.user_account = Some(account_key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ack,
    Nack,
    DeliveryReport,
}

/// An ack, nack or delivery report about a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "new_id")]
    pub event_id: String,
    pub event_type: EventType,
    pub user_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nack_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<String>,
    #[serde(default = "default_endpoint")]
    pub routing_endpoint: String,
    #[serde(default)]
    pub helper_metadata: HelperMetadata,
    #[serde(default)]
    pub routing_metadata: RoutingMetadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn ack(user_message_id: impl Into<String>) -> Self {
        Self::new(EventType::Ack, user_message_id)
    }

    pub fn nack(user_message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::Nack, user_message_id);
        event.nack_reason = Some(reason.into());
        event
    }

    pub fn delivery_report(user_message_id: impl Into<String>, status: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::DeliveryReport, user_message_id);
        event.delivery_status = Some(status.into());
        event
    }

    fn new(event_type: EventType, user_message_id: impl Into<String>) -> Self {
        Self {
            event_id: new_id(),
            event_type,
            user_message_id: user_message_id.into(),
            nack_reason: None,
            delivery_status: None,
            routing_endpoint: default_endpoint(),
            helper_metadata: HelperMetadata::default(),
            routing_metadata: RoutingMetadata::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything that travels over a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum Envelope {
    Inbound(Message),
    Outbound(Message),
    Event(Event),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Inbound(_) => "inbound",
            Envelope::Outbound(_) => "outbound",
            Envelope::Event(_) => "event",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Envelope::Inbound(msg) | Envelope::Outbound(msg) => &msg.message_id,
            Envelope::Event(event) => &event.event_id,
        }
    }

    pub fn routing_metadata(&self) -> &RoutingMetadata {
        match self {
            Envelope::Inbound(msg) | Envelope::Outbound(msg) => &msg.routing_metadata,
            Envelope::Event(event) => &event.routing_metadata,
        }
    }

    pub fn helper_metadata(&self) -> &HelperMetadata {
        match self {
            Envelope::Inbound(msg) | Envelope::Outbound(msg) => &msg.helper_metadata,
            Envelope::Event(event) => &event.helper_metadata,
        }
    }
}
