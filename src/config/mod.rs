//! Go Dispatcher Configuration Module
//!
//! Dispatcher options and the worker configuration file that wraps them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Tag;
use crate::storage::{TagPoolMetadata, UserAccount};

pub const DEFAULT_UNROUTABLE_INBOUND_REPLY: &str = "Your message could not be routed.";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Opt-out keyword policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptOutConfig {
    pub keywords: Vec<String>,
    pub case_sensitive: bool,
}

/// What a connector name means to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorRole {
    Transport,
    Application { conversation_type: String },
    RouterInbound { router_type: String },
    RouterOutbound { router_type: String },
    OptOut,
    BillingInbound,
    BillingOutbound,
}

/// Account routing table dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Connectors to consume inbound messages and events from
    pub receive_inbound_connectors: Vec<String>,
    /// Connectors to consume outbound messages from
    pub receive_outbound_connectors: Vec<String>,
    /// Conversation type to application connector
    pub application_connector_mapping: HashMap<String, String>,
    /// Router type to the connector facing its inbound side
    pub router_inbound_connector_mapping: HashMap<String, String>,
    /// Router type to the connector facing its outbound side
    pub router_outbound_connector_mapping: HashMap<String, String>,
    pub opt_out_connector: Option<String>,
    pub billing_inbound_connector: Option<String>,
    pub billing_outbound_connector: Option<String>,
    pub default_unroutable_inbound_reply: String,
    /// Persist outbound messages before handing them to a transport
    pub store_messages_to_transports: bool,
    pub optouts: OptOutConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            receive_inbound_connectors: Vec::new(),
            receive_outbound_connectors: Vec::new(),
            application_connector_mapping: HashMap::new(),
            router_inbound_connector_mapping: HashMap::new(),
            router_outbound_connector_mapping: HashMap::new(),
            opt_out_connector: None,
            billing_inbound_connector: None,
            billing_outbound_connector: None,
            default_unroutable_inbound_reply: DEFAULT_UNROUTABLE_INBOUND_REPLY.into(),
            store_messages_to_transports: true,
            optouts: OptOutConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn billing_enabled(&self) -> bool {
        self.billing_inbound_connector.is_some() && self.billing_outbound_connector.is_some()
    }

    pub fn receives_inbound(&self, connector_name: &str) -> bool {
        self.receive_inbound_connectors.iter().any(|c| c == connector_name)
    }

    pub fn receives_outbound(&self, connector_name: &str) -> bool {
        self.receive_outbound_connectors.iter().any(|c| c == connector_name)
    }

    /// Classify a connector name. Anything not otherwise mapped is a transport.
    pub fn connector_role(&self, connector_name: &str) -> ConnectorRole {
        let is = |c: &Option<String>| c.as_deref() == Some(connector_name);
        let reverse = |mapping: &HashMap<String, String>| {
            mapping
                .iter()
                .find(|(_, name)| name.as_str() == connector_name)
                .map(|(key, _)| key.clone())
        };

        if is(&self.billing_inbound_connector) {
            ConnectorRole::BillingInbound
        } else if is(&self.billing_outbound_connector) {
            ConnectorRole::BillingOutbound
        } else if is(&self.opt_out_connector) {
            ConnectorRole::OptOut
        } else if let Some(conversation_type) = reverse(&self.application_connector_mapping) {
            ConnectorRole::Application { conversation_type }
        } else if let Some(router_type) = reverse(&self.router_inbound_connector_mapping) {
            ConnectorRole::RouterInbound { router_type }
        } else if let Some(router_type) = reverse(&self.router_outbound_connector_mapping) {
            ConnectorRole::RouterOutbound { router_type }
        } else {
            ConnectorRole::Transport
        }
    }

    /// Check that every mapped connector is consumed in the direction its
    /// traffic comes back on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.billing_inbound_connector.is_some() != self.billing_outbound_connector.is_some() {
            return Err(ConfigError::Invalid(
                "billing_inbound_connector and billing_outbound_connector must be set together"
                    .into(),
            ));
        }

        let outbound_side = self
            .application_connector_mapping
            .values()
            .chain(self.router_inbound_connector_mapping.values())
            .chain(self.opt_out_connector.iter())
            .chain(self.billing_outbound_connector.iter());
        for name in outbound_side {
            if !self.receives_outbound(name) {
                return Err(ConfigError::Invalid(format!(
                    "connector {name:?} must be listed in receive_outbound_connectors"
                )));
            }
        }

        let inbound_side = self
            .router_outbound_connector_mapping
            .values()
            .chain(self.billing_inbound_connector.iter());
        for name in inbound_side {
            if !self.receives_inbound(name) {
                return Err(ConfigError::Invalid(format!(
                    "connector {name:?} must be listed in receive_inbound_connectors"
                )));
            }
        }

        Ok(())
    }
}

/// One tag ownership record for seeding the account store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOwner {
    pub tag: Tag,
    pub account: String,
}

/// Worker configuration file: dispatcher options plus seed data for the
/// in-memory collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub dispatcher: DispatcherConfig,
    /// Messages per account dispatched at once; negative is unlimited
    pub account_concurrency: i64,
    pub accounts: Vec<UserAccount>,
    pub tag_owners: Vec<TagOwner>,
    pub tag_pools: HashMap<String, TagPoolMetadata>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            account_concurrency: -1,
            accounts: Vec::new(),
            tag_owners: Vec::new(),
            tag_pools: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = serde_json::from_str(json)?;
        config.dispatcher.validate()?;
        if config.account_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "account_concurrency of 0 would never dispatch anything".into(),
            ));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> DispatcherConfig {
        DispatcherConfig {
            receive_inbound_connectors: vec!["sphex".into(), "router_ro".into()],
            receive_outbound_connectors: vec!["app1".into(), "router_ri".into(), "optout".into()],
            application_connector_mapping: HashMap::from([("app1".into(), "app1".into())]),
            router_inbound_connector_mapping: HashMap::from([(
                "keyword".into(),
                "router_ri".into(),
            )]),
            router_outbound_connector_mapping: HashMap::from([(
                "keyword".into(),
                "router_ro".into(),
            )]),
            opt_out_connector: Some("optout".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_connector_roles() {
        let config = sample();
        assert_eq!(config.connector_role("sphex"), ConnectorRole::Transport);
        assert_eq!(
            config.connector_role("app1"),
            ConnectorRole::Application { conversation_type: "app1".into() }
        );
        assert_eq!(
            config.connector_role("router_ri"),
            ConnectorRole::RouterInbound { router_type: "keyword".into() }
        );
        assert_eq!(
            config.connector_role("router_ro"),
            ConnectorRole::RouterOutbound { router_type: "keyword".into() }
        );
        assert_eq!(config.connector_role("optout"), ConnectorRole::OptOut);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_half_billing() {
        let config = DispatcherConfig {
            billing_inbound_connector: Some("billing_in".into()),
            ..sample()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_unconsumed_connector() {
        let mut config = sample();
        config.receive_outbound_connectors.retain(|c| c != "app1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_worker_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "dispatcher": {{
                    "receive_inbound_connectors": ["sphex"],
                    "receive_outbound_connectors": ["app1"],
                    "application_connector_mapping": {{"app1": "app1"}},
                    "optouts": {{"keywords": ["stop"]}}
                }},
                "tag_owners": [{{"tag": ["pool1", "1234"], "account": "acc1"}}],
                "tag_pools": {{"pool1": {{"transport_name": "sphex"}}}}
            }}"#
        )
        .unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert!(config.dispatcher.store_messages_to_transports);
        assert_eq!(
            config.dispatcher.default_unroutable_inbound_reply,
            DEFAULT_UNROUTABLE_INBOUND_REPLY
        );
        assert_eq!(config.dispatcher.optouts.keywords, vec!["stop".to_string()]);
        assert_eq!(config.account_concurrency, -1);
        assert_eq!(config.tag_owners[0].tag, Tag::new("pool1", "1234"));
        assert_eq!(
            config.tag_pools["pool1"].transport_name.as_deref(),
            Some("sphex")
        );
    }

    #[test]
    fn test_zero_account_concurrency_rejected() {
        let result = WorkerConfig::from_json(r#"{"account_concurrency": 0}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            WorkerConfig::load("/nonexistent/go-dispatcher.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
