//! Go Dispatcher Connector Module
//!
//! Typed names for the logical endpoints that messages flow between:
//! conversations, the two sides of a router, transport tags, the opt-out
//! handler and the billing stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connector parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Unknown connector type in {0:?}")]
    UnknownType(String),

    #[error("Malformed connector {connector:?}: {reason}")]
    Malformed { connector: String, reason: String },
}

/// Which side of the dispatcher a connector sits on.
///
/// A route always joins an outbound-side connector to an inbound-side one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectorDirection {
    Inbound,
    Outbound,
}

impl ConnectorDirection {
    fn as_str(&self) -> &'static str {
        match self {
            ConnectorDirection::Inbound => "INBOUND",
            ConnectorDirection::Outbound => "OUTBOUND",
        }
    }
}

/// A logical routing endpoint owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GoConnector {
    Conversation {
        conversation_type: String,
        conversation_key: String,
    },
    Router {
        router_type: String,
        router_key: String,
        direction: ConnectorDirection,
    },
    TransportTag {
        pool: String,
        tagname: String,
    },
    OptOut,
    Billing,
}

impl GoConnector {
    pub const CONVERSATION: &'static str = "CONVERSATION";
    pub const ROUTER: &'static str = "ROUTER";
    pub const TRANSPORT_TAG: &'static str = "TRANSPORT_TAG";
    pub const OPT_OUT: &'static str = "OPT_OUT";
    pub const BILLING: &'static str = "BILLING";

    pub fn conversation(
        conversation_type: impl Into<String>,
        conversation_key: impl Into<String>,
    ) -> Self {
        GoConnector::Conversation {
            conversation_type: conversation_type.into(),
            conversation_key: conversation_key.into(),
        }
    }

    pub fn router(
        router_type: impl Into<String>,
        router_key: impl Into<String>,
        direction: ConnectorDirection,
    ) -> Self {
        GoConnector::Router {
            router_type: router_type.into(),
            router_key: router_key.into(),
            direction,
        }
    }

    pub fn transport_tag(pool: impl Into<String>, tagname: impl Into<String>) -> Self {
        GoConnector::TransportTag {
            pool: pool.into(),
            tagname: tagname.into(),
        }
    }

    /// Parse the `TYPE:part:part` string form.
    pub fn parse(s: &str) -> Result<Self, ConnectorError> {
        let parts: Vec<&str> = s.split(':').collect();
        let malformed = |reason: &str| ConnectorError::Malformed {
            connector: s.to_string(),
            reason: reason.to_string(),
        };

        match parts[0] {
            Self::CONVERSATION => match parts.as_slice() {
                [_, ctype, ckey] if !ctype.is_empty() && !ckey.is_empty() => {
                    Ok(Self::conversation(*ctype, *ckey))
                }
                _ => Err(malformed("expected CONVERSATION:<type>:<key>")),
            },
            Self::ROUTER => match parts.as_slice() {
                [_, rtype, rkey, side] if !rtype.is_empty() && !rkey.is_empty() => {
                    let direction = match *side {
                        "INBOUND" => ConnectorDirection::Inbound,
                        "OUTBOUND" => ConnectorDirection::Outbound,
                        _ => return Err(malformed("router side must be INBOUND or OUTBOUND")),
                    };
                    Ok(Self::router(*rtype, *rkey, direction))
                }
                _ => Err(malformed("expected ROUTER:<type>:<key>:<side>")),
            },
            Self::TRANSPORT_TAG => match parts.as_slice() {
                [_, pool, tag] if !pool.is_empty() && !tag.is_empty() => {
                    Ok(Self::transport_tag(*pool, *tag))
                }
                _ => Err(malformed("expected TRANSPORT_TAG:<pool>:<tag>")),
            },
            Self::OPT_OUT if parts.len() == 1 => Ok(GoConnector::OptOut),
            Self::BILLING if parts.len() == 1 => Ok(GoConnector::Billing),
            Self::OPT_OUT | Self::BILLING => Err(malformed("takes no arguments")),
            _ => Err(ConnectorError::UnknownType(s.to_string())),
        }
    }

    /// The side this connector sits on, `None` for billing which is
    /// spliced in by the dispatcher and never appears in a routing table.
    pub fn direction(&self) -> Option<ConnectorDirection> {
        match self {
            GoConnector::Conversation { .. } | GoConnector::OptOut => {
                Some(ConnectorDirection::Inbound)
            }
            GoConnector::TransportTag { .. } => Some(ConnectorDirection::Outbound),
            GoConnector::Router { direction, .. } => Some(*direction),
            GoConnector::Billing => None,
        }
    }

    pub fn is_transport_tag(&self) -> bool {
        matches!(self, GoConnector::TransportTag { .. })
    }
}

impl fmt::Display for GoConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoConnector::Conversation { conversation_type, conversation_key } => {
                write!(f, "{}:{}:{}", Self::CONVERSATION, conversation_type, conversation_key)
            }
            GoConnector::Router { router_type, router_key, direction } => write!(
                f,
                "{}:{}:{}:{}",
                Self::ROUTER,
                router_type,
                router_key,
                direction.as_str()
            ),
            GoConnector::TransportTag { pool, tagname } => {
                write!(f, "{}:{}:{}", Self::TRANSPORT_TAG, pool, tagname)
            }
            GoConnector::OptOut => f.write_str(Self::OPT_OUT),
            GoConnector::Billing => f.write_str(Self::BILLING),
        }
    }
}

impl FromStr for GoConnector {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GoConnector {
    type Error = ConnectorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GoConnector> for String {
    fn from(connector: GoConnector) -> Self {
        connector.to_string()
    }
}

/// A named endpoint on a connector, e.g. `default` on a conversation.
///
/// Serialized as a two element `[connector, endpoint]` array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(GoConnector, String)", into = "(GoConnector, String)")]
pub struct RoutingEndpoint {
    pub connector: GoConnector,
    pub endpoint: String,
}

impl RoutingEndpoint {
    pub fn new(connector: GoConnector, endpoint: impl Into<String>) -> Self {
        Self {
            connector,
            endpoint: endpoint.into(),
        }
    }
}

impl From<(GoConnector, String)> for RoutingEndpoint {
    fn from((connector, endpoint): (GoConnector, String)) -> Self {
        Self { connector, endpoint }
    }
}

impl From<RoutingEndpoint> for (GoConnector, String) {
    fn from(value: RoutingEndpoint) -> Self {
        (value.connector, value.endpoint)
    }
}

impl fmt::Display for RoutingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connector, self.endpoint)
    }
}
