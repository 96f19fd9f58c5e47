//! Go Dispatcher Routing Metadata Module
//!
//! The hop trail carried in every message's `routing_metadata`. Each
//! dispatcher pass opens a hop with its source and closes it with the
//! destination it publishes to. Events carry the reversed trail of the
//! message they refer to in `go_outbound_hops` and walk it backwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::{GoConnector, RoutingEndpoint};

/// Hop trail invariant violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Cannot push source {pushed}: hop from {open} has no destination yet")]
    SourceAlreadyOpen {
        open: RoutingEndpoint,
        pushed: RoutingEndpoint,
    },

    #[error("Cannot push destination {pushed}: last hop already ends at {existing}")]
    DestinationAlreadySet {
        existing: RoutingEndpoint,
        pushed: RoutingEndpoint,
    },

    #[error("Cannot push destination {0}: no hop has been opened")]
    NoOpenHop(RoutingEndpoint),
}

/// One traversal of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "(RoutingEndpoint, Option<RoutingEndpoint>)",
    into = "(RoutingEndpoint, Option<RoutingEndpoint>)"
)]
pub enum Hop {
    Open {
        source: RoutingEndpoint,
    },
    Closed {
        source: RoutingEndpoint,
        destination: RoutingEndpoint,
    },
}

impl Hop {
    pub fn closed(source: RoutingEndpoint, destination: RoutingEndpoint) -> Self {
        Hop::Closed { source, destination }
    }

    pub fn source(&self) -> &RoutingEndpoint {
        match self {
            Hop::Open { source } | Hop::Closed { source, .. } => source,
        }
    }

    pub fn destination(&self) -> Option<&RoutingEndpoint> {
        match self {
            Hop::Open { .. } => None,
            Hop::Closed { destination, .. } => Some(destination),
        }
    }

    /// Swap source and destination. Open hops have nothing to swap.
    pub fn reversed(&self) -> Option<Hop> {
        match self {
            Hop::Open { .. } => None,
            Hop::Closed {
                source,
                destination,
            } => Some(Hop::closed(destination.clone(), source.clone())),
        }
    }
}

impl From<(RoutingEndpoint, Option<RoutingEndpoint>)> for Hop {
    fn from((source, destination): (RoutingEndpoint, Option<RoutingEndpoint>)) -> Self {
        match destination {
            Some(destination) => Hop::Closed { source, destination },
            None => Hop::Open { source },
        }
    }
}

impl From<Hop> for (RoutingEndpoint, Option<RoutingEndpoint>) {
    fn from(hop: Hop) -> Self {
        match hop {
            Hop::Open { source } => (source, None),
            Hop::Closed { source, destination } => (source, Some(destination)),
        }
    }
}

/// Reverse a forward trail so an event can retrace it.
pub fn reverse_hops(hops: &[Hop]) -> Vec<Hop> {
    hops.iter().rev().filter_map(Hop::reversed).collect()
}

/// Splice out hops through `via`: `X -> via, via -> Y` becomes `X -> Y`.
pub fn collapse_hops_through(hops: &[Hop], via: &GoConnector) -> Vec<Hop> {
    let mut collapsed: Vec<Hop> = Vec::with_capacity(hops.len());
    for hop in hops {
        if hop.source().connector == *via {
            if let Some(Hop::Closed { destination, .. }) = collapsed.last_mut() {
                if destination.connector == *via {
                    if let Some(onward) = hop.destination() {
                        *destination = onward.clone();
                        continue;
                    }
                }
            }
        }
        collapsed.push(hop.clone());
    }
    collapsed
}

/// `routing_metadata` of a message or event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    #[serde(rename = "go_hops", default, skip_serializing_if = "Vec::is_empty")]
    hops: Vec<Hop>,
    #[serde(rename = "go_outbound_hops", default, skip_serializing_if = "Option::is_none")]
    outbound_hops: Option<Vec<Hop>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_reply_to_unroutable: bool,
}

impl RoutingMetadata {
    /// Forward trail, empty when nothing has been recorded.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn set_hops(&mut self, hops: Vec<Hop>) {
        self.hops = hops;
    }

    /// Reverse trail carried on events, `None` when never recorded.
    pub fn outbound_hops(&self) -> Option<&[Hop]> {
        self.outbound_hops.as_deref()
    }

    pub fn set_outbound_hops(&mut self, hops: Vec<Hop>) {
        self.outbound_hops = Some(hops);
    }

    pub fn push_hop(&mut self, source: RoutingEndpoint, destination: RoutingEndpoint) {
        self.hops.push(Hop::closed(source, destination));
    }

    pub fn push_source(&mut self, source: RoutingEndpoint) -> Result<(), RoutingError> {
        if let Some(Hop::Open { source: open }) = self.hops.last() {
            return Err(RoutingError::SourceAlreadyOpen {
                open: open.clone(),
                pushed: source,
            });
        }
        self.hops.push(Hop::Open { source });
        Ok(())
    }

    pub fn push_destination(&mut self, destination: RoutingEndpoint) -> Result<(), RoutingError> {
        match self.hops.pop() {
            None => Err(RoutingError::NoOpenHop(destination)),
            Some(closed @ Hop::Closed { .. }) => {
                let existing = closed.destination().cloned();
                self.hops.push(closed);
                Err(RoutingError::DestinationAlreadySet {
                    existing: existing.unwrap_or_else(|| destination.clone()),
                    pushed: destination,
                })
            }
            Some(Hop::Open { source }) => {
                self.hops.push(Hop::Closed { source, destination });
                Ok(())
            }
        }
    }

    /// Source of the closed hop before the open one, i.e. where the message
    /// was before its previous dispatcher pass.
    pub fn previous_source(&self) -> Option<&RoutingEndpoint> {
        let closed = match self.hops.last() {
            Some(Hop::Open { .. }) => self.hops.len().checked_sub(2)?,
            _ => self.hops.len().checked_sub(1)?,
        };
        Some(self.hops[closed].source())
    }

    /// Index into `outbound_hops` of the hop being decided now.
    fn retrace_position(&self) -> usize {
        match self.hops.last() {
            Some(Hop::Open { .. }) => self.hops.len() - 1,
            _ => self.hops.len(),
        }
    }

    /// Where an event should go next, or `None` once it has retraced every
    /// recorded outbound hop.
    pub fn next_hop(&self) -> Option<&RoutingEndpoint> {
        let outbound = self.outbound_hops.as_ref()?;
        outbound.get(self.retrace_position())?.destination()
    }

    /// Endpoint a router should emit an event on for its next hop.
    pub fn next_router_endpoint(&self) -> Option<&str> {
        let outbound = self.outbound_hops.as_ref()?;
        outbound
            .get(self.retrace_position())
            .map(|hop| hop.source().endpoint.as_str())
    }

    pub fn set_unroutable_reply(&mut self) {
        self.is_reply_to_unroutable = true;
    }

    pub fn get_unroutable_reply(&self) -> bool {
        self.is_reply_to_unroutable
    }

    /// True when an event about an unroutable auto-reply has walked its
    /// whole trail and should be absorbed here.
    pub fn unroutable_event_done(&self) -> bool {
        if !self.is_reply_to_unroutable {
            return false;
        }
        let Some(outbound) = self.outbound_hops.as_ref() else {
            return false;
        };
        outbound
            .iter()
            .enumerate()
            .all(|(i, hop)| self.hops.get(i) == Some(hop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorDirection;

    fn ep(connector: GoConnector) -> RoutingEndpoint {
        RoutingEndpoint::new(connector, "default")
    }

    fn conv() -> RoutingEndpoint {
        ep(GoConnector::conversation("app1", "conv1"))
    }

    fn router_out() -> RoutingEndpoint {
        RoutingEndpoint::new(
            GoConnector::router("keyword", "r1", ConnectorDirection::Outbound),
            "kw",
        )
    }

    fn router_in() -> RoutingEndpoint {
        ep(GoConnector::router("keyword", "r1", ConnectorDirection::Inbound))
    }

    fn tag() -> RoutingEndpoint {
        ep(GoConnector::transport_tag("pool1", "1234"))
    }

    #[test]
    fn test_absent_trails() {
        let meta = RoutingMetadata::default();
        assert!(meta.hops().is_empty());
        assert_eq!(meta.outbound_hops(), None);
        assert_eq!(meta.next_hop(), None);
        assert!(!meta.get_unroutable_reply());
    }

    #[test]
    fn test_push_source_then_destination() {
        let mut meta = RoutingMetadata::default();
        meta.push_source(tag()).unwrap();
        meta.push_destination(conv()).unwrap();
        assert_eq!(meta.hops(), &[Hop::closed(tag(), conv())]);
    }

    #[test]
    fn test_cannot_open_two_hops() {
        let mut meta = RoutingMetadata::default();
        meta.push_source(tag()).unwrap();
        assert!(matches!(
            meta.push_source(conv()),
            Err(RoutingError::SourceAlreadyOpen { .. })
        ));
        meta.push_destination(conv()).unwrap();
        assert!(meta.push_source(conv()).is_ok());
    }

    #[test]
    fn test_cannot_close_twice() {
        let mut meta = RoutingMetadata::default();
        assert!(matches!(meta.push_destination(conv()), Err(RoutingError::NoOpenHop(_))));

        meta.push_hop(tag(), conv());
        assert!(matches!(
            meta.push_destination(router_in()),
            Err(RoutingError::DestinationAlreadySet { .. })
        ));
        assert_eq!(meta.hops(), &[Hop::closed(tag(), conv())]);
    }

    #[test]
    fn test_wire_shape() {
        let mut meta = RoutingMetadata::default();
        meta.push_hop(tag(), conv());
        meta.push_source(conv()).unwrap();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "go_hops": [
                    [
                        ["TRANSPORT_TAG:pool1:1234", "default"],
                        ["CONVERSATION:app1:conv1", "default"]
                    ],
                    [["CONVERSATION:app1:conv1", "default"], null],
                ]
            })
        );
        let restored: RoutingMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(restored, meta);
    }

    #[test]
    fn test_event_retraces_outbound_trail() {
        let forward = vec![Hop::closed(conv(), router_out()), Hop::closed(router_in(), tag())];
        let outbound = reverse_hops(&forward);
        assert_eq!(
            outbound,
            vec![Hop::closed(tag(), router_in()), Hop::closed(router_out(), conv())]
        );

        let mut meta = RoutingMetadata::default();
        meta.set_outbound_hops(outbound.clone());

        while meta.hops().len() < outbound.len() {
            let expected = &outbound[meta.hops().len()];
            meta.push_source(expected.source().clone()).unwrap();
            let next = meta.next_hop().cloned().expect("hop left to retrace");
            assert_eq!(Some(&next), expected.destination());
            meta.push_destination(next).unwrap();
        }

        assert_eq!(meta.next_hop(), None);
        assert_eq!(meta.hops(), outbound.as_slice());
    }

    #[test]
    fn test_next_router_endpoint() {
        let mut meta = RoutingMetadata::default();
        meta.set_outbound_hops(vec![
            Hop::closed(tag(), router_in()),
            Hop::closed(router_out(), conv()),
        ]);
        meta.push_hop(tag(), router_in());
        assert_eq!(meta.next_router_endpoint(), Some("kw"));

        meta.push_hop(router_out(), conv());
        assert_eq!(meta.next_router_endpoint(), None);
    }

    #[test]
    fn test_collapse_billing_hops() {
        let billing = ep(GoConnector::Billing);
        let forward = vec![Hop::closed(conv(), billing.clone()), Hop::closed(billing, tag())];
        assert_eq!(
            collapse_hops_through(&forward, &GoConnector::Billing),
            vec![Hop::closed(conv(), tag())]
        );
    }

    #[test]
    fn test_unroutable_event_done() {
        let mut meta = RoutingMetadata::default();
        meta.push_source(tag()).unwrap();
        assert!(!meta.unroutable_event_done());

        meta.set_unroutable_reply();
        assert!(!meta.unroutable_event_done(), "outbound hops missing");

        meta.set_outbound_hops(Vec::new());
        assert!(meta.unroutable_event_done());

        meta.set_outbound_hops(vec![Hop::closed(tag(), conv())]);
        assert!(!meta.unroutable_event_done(), "trail not yet retraced");

        meta.push_destination(conv()).unwrap();
        assert!(meta.unroutable_event_done());
    }
}
