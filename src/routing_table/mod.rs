//! Go Dispatcher Routing Table Module
//!
//! Per-account mapping from a source `(connector, endpoint)` pair to a
//! destination pair. Persisted as
//! `{src_connector: {src_endpoint: [dst_connector, dst_endpoint]}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::connector::{GoConnector, RoutingEndpoint};

/// Routing table validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingTableError {
    #[error(
        "Billing connector may not appear in a routing table: {source_endpoint} -> {destination}"
    )]
    BillingEntry {
        source_endpoint: RoutingEndpoint,
        destination: RoutingEndpoint,
    },

    #[error("Connectors on entry {source_endpoint} -> {destination} are both on the same side")]
    SameDirection {
        source_endpoint: RoutingEndpoint,
        destination: RoutingEndpoint,
    },

    #[error("Entry {source_endpoint} -> {destination} has no matching return route")]
    MissingReverse {
        source_endpoint: RoutingEndpoint,
        destination: RoutingEndpoint,
    },
}

/// Account routing table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    entries: BTreeMap<GoConnector, BTreeMap<String, RoutingEndpoint>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a forward mapping, replacing any existing target for the source.
    pub fn add_entry(
        &mut self,
        src_conn: GoConnector,
        src_endpoint: impl Into<String>,
        dst_conn: GoConnector,
        dst_endpoint: impl Into<String>,
    ) {
        let src_endpoint = src_endpoint.into();
        let target = RoutingEndpoint::new(dst_conn, dst_endpoint);
        let endpoints = self.entries.entry(src_conn.clone()).or_default();
        if let Some(previous) = endpoints.insert(src_endpoint.clone(), target.clone()) {
            if previous != target {
                warn!(
                    source = %src_conn,
                    endpoint = %src_endpoint,
                    old_target = %previous,
                    new_target = %target,
                    "Replacing routing table entry"
                );
            }
        }
    }

    /// Remove the entry for a single source, returning its old target.
    pub fn remove_entry(
        &mut self,
        src_conn: &GoConnector,
        src_endpoint: &str,
    ) -> Option<RoutingEndpoint> {
        let endpoints = self.entries.get_mut(src_conn)?;
        let removed = endpoints.remove(src_endpoint);
        if endpoints.is_empty() {
            self.entries.remove(src_conn);
        }
        removed
    }

    /// Remove every entry whose source or destination is `(conn, endpoint)`.
    pub fn remove_endpoint(&mut self, conn: &GoConnector, endpoint: &str) {
        self.retain(|source, target| {
            !(source.connector == *conn && source.endpoint == endpoint)
                && !(target.connector == *conn && target.endpoint == endpoint)
        });
    }

    /// Remove every entry touching `conn` on either side.
    pub fn remove_connector(&mut self, conn: &GoConnector) {
        self.retain(|source, target| source.connector != *conn && target.connector != *conn);
    }

    pub fn lookup_target(
        &self,
        src_conn: &GoConnector,
        src_endpoint: &str,
    ) -> Option<&RoutingEndpoint> {
        self.entries.get(src_conn)?.get(src_endpoint)
    }

    /// Reverse lookup. When several sources share a destination the first
    /// in connector order wins.
    pub fn lookup_source(
        &self,
        dst_conn: &GoConnector,
        dst_endpoint: &str,
    ) -> Option<RoutingEndpoint> {
        self.entries().find_map(|(source, target)| {
            (target.connector == *dst_conn && target.endpoint == dst_endpoint).then_some(source)
        })
    }

    /// All `(src_endpoint, target)` pairs leaving `src_conn`.
    pub fn lookup_targets(&self, src_conn: &GoConnector) -> Vec<(String, RoutingEndpoint)> {
        self.entries
            .get(src_conn)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .map(|(endpoint, target)| (endpoint.clone(), target.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All `(source, dst_endpoint)` pairs arriving at `dst_conn`.
    pub fn lookup_sources(&self, dst_conn: &GoConnector) -> Vec<(RoutingEndpoint, String)> {
        self.entries()
            .filter(|(_, target)| target.connector == *dst_conn)
            .map(|(source, target)| (source, target.endpoint))
            .collect()
    }

    /// Iterate over `(source, target)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (RoutingEndpoint, RoutingEndpoint)> + '_ {
        self.entries.iter().flat_map(|(conn, endpoints)| {
            endpoints.iter().map(move |(endpoint, target)| {
                (
                    RoutingEndpoint::new(conn.clone(), endpoint.clone()),
                    target.clone(),
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check a single entry against the table it lives in.
    pub fn validate_entry(
        &self,
        source: &RoutingEndpoint,
        destination: &RoutingEndpoint,
    ) -> Result<(), RoutingTableError> {
        let directions = (
            source.connector.direction(),
            destination.connector.direction(),
        );
        let (src_dir, dst_dir) = match directions {
            (Some(src), Some(dst)) => (src, dst),
            _ => {
                return Err(RoutingTableError::BillingEntry {
                    source_endpoint: source.clone(),
                    destination: destination.clone(),
                })
            }
        };
        if src_dir == dst_dir {
            return Err(RoutingTableError::SameDirection {
                source_endpoint: source.clone(),
                destination: destination.clone(),
            });
        }

        // Opt-out replies are routed by tag, so opt-out entries are one way.
        if source.connector == GoConnector::OptOut || destination.connector == GoConnector::OptOut {
            return Ok(());
        }

        match self.lookup_target(&destination.connector, &destination.endpoint) {
            Some(back) if back == source => Ok(()),
            _ => Err(RoutingTableError::MissingReverse {
                source_endpoint: source.clone(),
                destination: destination.clone(),
            }),
        }
    }

    /// Must succeed before a modified table is persisted.
    pub fn validate_all_entries(&self) -> Result<(), RoutingTableError> {
        for (source, destination) in self.entries() {
            self.validate_entry(&source, &destination)?;
        }
        Ok(())
    }

    fn retain(&mut self, mut keep: impl FnMut(&RoutingEndpoint, &RoutingEndpoint) -> bool) {
        for (conn, endpoints) in self.entries.iter_mut() {
            endpoints.retain(|endpoint, target| {
                keep(&RoutingEndpoint::new(conn.clone(), endpoint.clone()), &*target)
            });
        }
        self.entries.retain(|_, endpoints| !endpoints.is_empty());
    }
}
