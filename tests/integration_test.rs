//! Integration tests for the account routing table dispatcher

use std::collections::HashMap;
use std::sync::Arc;

use go_dispatcher::config::DEFAULT_UNROUTABLE_INBOUND_REPLY;
use go_dispatcher::config::OptOutConfig;
use go_dispatcher::{
    AccountRoutingTableDispatcher, ConnectorDirection, DispatchError, DispatchOutcome,
    DispatcherConfig, Envelope, Event, GoConnector, Hop, InMemoryAccountStore,
    InMemoryMessageStore, InMemoryTagPoolStore, MemoryBus, Message, MessageStore,
    OptOutMetadata, Published, RoutingEndpoint, RoutingTable, SessionEvent, Tag,
    TagPoolMetadata, UserAccount, Worker, WorkerConfig,
};
use serde_json::json;

struct Harness {
    dispatcher: AccountRoutingTableDispatcher,
    bus: Arc<MemoryBus>,
    accounts: Arc<InMemoryAccountStore>,
    pools: Arc<InMemoryTagPoolStore>,
    messages: Arc<InMemoryMessageStore>,
}

impl Harness {
    fn new(config: DispatcherConfig, table: RoutingTable) -> Self {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.save_account(&UserAccount::new("acc1", table)).unwrap();
        accounts.set_tag_owner(tag(), "acc1");

        let pools = Arc::new(InMemoryTagPoolStore::new());
        pools.set_pool_metadata(
            "pool1",
            TagPoolMetadata {
                transport_name: Some("sphex".into()),
                ..Default::default()
            },
        );

        let messages = Arc::new(InMemoryMessageStore::new());
        let bus = Arc::new(MemoryBus::new());
        let dispatcher = AccountRoutingTableDispatcher::new(
            config,
            accounts.clone(),
            pools.clone(),
            messages.clone(),
            bus.clone(),
        )
        .unwrap();

        Self {
            dispatcher,
            bus,
            accounts,
            pools,
            messages,
        }
    }

    /// Dispatch and return the single envelope that was published.
    async fn dispatch_one(&self, connector: &str, envelope: Envelope) -> Published {
        let outcome = self.dispatcher.dispatch(connector, envelope).await;
        assert!(
            !matches!(outcome, DispatchOutcome::Dropped { .. }),
            "unexpected drop: {outcome:?}"
        );
        let mut published = self.bus.take();
        assert_eq!(published.len(), 1, "expected one publish, got {published:?}");
        published.remove(0)
    }
}

fn tag() -> Tag {
    Tag::new("pool1", "1234")
}

fn tag_conn() -> GoConnector {
    GoConnector::transport_tag("pool1", "1234")
}

fn conv_conn() -> GoConnector {
    GoConnector::conversation("app1", "conv1")
}

fn endpoint(connector: GoConnector, endpoint: &str) -> RoutingEndpoint {
    RoutingEndpoint::new(connector, endpoint)
}

fn base_config() -> DispatcherConfig {
    DispatcherConfig {
        receive_inbound_connectors: vec!["sphex".into(), "router_ro".into()],
        receive_outbound_connectors: vec!["app1".into(), "router_ri".into(), "optout".into()],
        application_connector_mapping: HashMap::from([("app1".into(), "app1".into())]),
        router_inbound_connector_mapping: HashMap::from([("keyword".into(), "router_ri".into())]),
        router_outbound_connector_mapping: HashMap::from([("keyword".into(), "router_ro".into())]),
        opt_out_connector: Some("optout".into()),
        optouts: OptOutConfig {
            keywords: vec!["stop".into(), "unsubscribe".into()],
            case_sensitive: false,
        },
        ..Default::default()
    }
}

fn billing_config() -> DispatcherConfig {
    let mut config = base_config();
    config.billing_inbound_connector = Some("billing_in".into());
    config.billing_outbound_connector = Some("billing_out".into());
    config.receive_inbound_connectors.push("billing_in".into());
    config.receive_outbound_connectors.push("billing_out".into());
    config
}

fn conversation_table() -> RoutingTable {
    let mut table = RoutingTable::new();
    table.add_entry(tag_conn(), "default", conv_conn(), "default");
    table.add_entry(conv_conn(), "default", tag_conn(), "default");
    table
}

fn router_table() -> RoutingTable {
    let router_in = GoConnector::router("keyword", "r1", ConnectorDirection::Inbound);
    let router_out = GoConnector::router("keyword", "r1", ConnectorDirection::Outbound);
    let mut table = RoutingTable::new();
    table.add_entry(tag_conn(), "default", router_in.clone(), "default");
    table.add_entry(router_in, "default", tag_conn(), "default");
    table.add_entry(router_out.clone(), "kw1", conv_conn(), "default");
    table.add_entry(conv_conn(), "default", router_out, "kw1");
    table
}

fn inbound(content: &str) -> Message {
    Message::new("1234", "+27831234567", Some(content.into())).with_tag(tag())
}

fn from_conversation(content: &str) -> Message {
    let mut msg = Message::new("+27831234567", "1234", Some(content.into())).with_account("acc1");
    msg.helper_metadata.set_conversation("app1", "conv1");
    msg
}

fn into_message(published: Published) -> Message {
    match published.envelope {
        Envelope::Inbound(msg) | Envelope::Outbound(msg) => msg,
        other => panic!("expected a message, got {other:?}"),
    }
}

fn into_event(published: Published) -> Event {
    match published.envelope {
        Envelope::Event(event) => event,
        other => panic!("expected an event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_inbound_to_conversation() {
    let h = Harness::new(base_config(), conversation_table());

    let published = h.dispatch_one("sphex", Envelope::Inbound(inbound("hello"))).await;
    assert_eq!(published.connector, "app1");
    let msg = into_message(published);

    assert_eq!(msg.helper_metadata.go.user_account.as_deref(), Some("acc1"));
    assert_eq!(msg.helper_metadata.go.conversation_type.as_deref(), Some("app1"));
    assert_eq!(msg.helper_metadata.go.conversation_key.as_deref(), Some("conv1"));
    assert_eq!(msg.helper_metadata.optout, Some(OptOutMetadata::default()));
    assert_eq!(
        serde_json::to_value(msg.routing_metadata.hops()).unwrap(),
        json!([[["TRANSPORT_TAG:pool1:1234", "default"], ["CONVERSATION:app1:conv1", "default"]]])
    );
}

#[tokio::test]
async fn test_opt_out_overrides_table() {
    let h = Harness::new(base_config(), conversation_table());

    let published = h.dispatch_one("sphex", Envelope::Inbound(inbound("  STOP "))).await;
    assert_eq!(published.connector, "optout");
    let msg = into_message(published);

    assert_eq!(
        msg.helper_metadata.optout,
        Some(OptOutMetadata {
            optout: true,
            optout_keyword: Some("stop".into()),
        })
    );
    assert_eq!(
        msg.routing_metadata.hops(),
        &[Hop::closed(
            endpoint(tag_conn(), "default"),
            endpoint(GoConnector::OptOut, "default")
        )]
    );
}

#[tokio::test]
async fn test_opt_out_reply_goes_to_tag() {
    let h = Harness::new(base_config(), conversation_table());

    let opted_out = into_message(h.dispatch_one("sphex", Envelope::Inbound(inbound("stop"))).await);
    let reply = opted_out.reply("You have been unsubscribed.");

    let published = h.dispatch_one("optout", Envelope::Outbound(reply.clone())).await;
    assert_eq!(published.connector, "sphex");
    let out = into_message(published);
    assert_eq!(out.helper_metadata.tag, Some(tag()));
    assert_eq!(
        out.routing_metadata.hops(),
        &[Hop::closed(
            endpoint(GoConnector::OptOut, "default"),
            endpoint(tag_conn(), "default")
        )]
    );
    assert!(h.messages.get_outbound_message(&reply.message_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unroutable_inbound_gets_default_reply() {
    let h = Harness::new(base_config(), RoutingTable::new());
    h.pools.set_pool_metadata(
        "pool1",
        TagPoolMetadata {
            transport_name: Some("sphex".into()),
            reply_to_unroutable_inbound: true,
            unroutable_inbound_reply: None,
        },
    );

    let original = inbound("hello");
    let outcome = h
        .dispatcher
        .dispatch("sphex", Envelope::Inbound(original.clone()))
        .await;
    let DispatchOutcome::RepliedUnroutable { connector, reply_id } = outcome.clone() else {
        panic!("expected an unroutable reply, got {outcome:?}");
    };
    assert_eq!(connector, "sphex");

    let published = h.bus.take();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].connector, "sphex");
    let reply = into_message(published[0].clone());
    assert_eq!(reply.message_id, reply_id);
    assert_eq!(reply.content.as_deref(), Some(DEFAULT_UNROUTABLE_INBOUND_REPLY));
    assert_eq!(reply.to_addr, original.from_addr);
    assert_eq!(reply.in_reply_to.as_deref(), Some(original.message_id.as_str()));
    assert!(reply.routing_metadata.get_unroutable_reply());
    assert!(reply.routing_metadata.hops().is_empty());

    let stored = h.messages.get_outbound_message(&reply_id).await.unwrap();
    assert_eq!(stored, Some(reply));
    assert_eq!(h.dispatcher.stats().unroutable_replies, 1);
}

#[tokio::test]
async fn test_unroutable_reply_uses_pool_text_and_absorbs_events() {
    let mut config = base_config();
    config.store_messages_to_transports = false;
    let h = Harness::new(config, RoutingTable::new());
    h.pools.set_pool_metadata(
        "pool1",
        TagPoolMetadata {
            transport_name: Some("sphex".into()),
            reply_to_unroutable_inbound: true,
            unroutable_inbound_reply: Some("Nothing here yet.".into()),
        },
    );

    let reply = into_message(h.dispatch_one("sphex", Envelope::Inbound(inbound("hello"))).await);
    assert_eq!(reply.content.as_deref(), Some("Nothing here yet."));
    assert_eq!(h.messages.outbound_count(), 1);

    let mut ack = Event::ack(reply.message_id.clone());
    ack.routing_endpoint = reply.routing_endpoint.clone();
    let outcome = h.dispatcher.dispatch("sphex", Envelope::Event(ack)).await;
    assert_eq!(outcome, DispatchOutcome::Absorbed);
    assert!(h.bus.is_empty());
    assert_eq!(h.dispatcher.stats().events_absorbed, 1);
}

#[tokio::test]
async fn test_unroutable_without_pool_reply_is_dropped() {
    let h = Harness::new(base_config(), RoutingTable::new());

    let result = h
        .dispatcher
        .try_dispatch("sphex", Envelope::Inbound(inbound("hello")))
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, DispatchError::Unroutable { .. }));
    assert!(err.is_expected());
    assert!(h.bus.is_empty());
    assert_eq!(h.messages.outbound_count(), 0);
}

#[tokio::test]
async fn test_unroutable_mid_session_gets_no_reply() {
    let h = Harness::new(base_config(), RoutingTable::new());
    h.pools.set_pool_metadata(
        "pool1",
        TagPoolMetadata {
            reply_to_unroutable_inbound: true,
            ..Default::default()
        },
    );

    let mut msg = inbound("1");
    msg.session_event = Some(SessionEvent::Resume);
    let outcome = h.dispatcher.dispatch("sphex", Envelope::Inbound(msg)).await;
    assert!(matches!(outcome, DispatchOutcome::Dropped { .. }));
    assert!(h.bus.is_empty());

    let mut msg = inbound("hi");
    msg.session_event = Some(SessionEvent::New);
    let outcome = h.dispatcher.dispatch("sphex", Envelope::Inbound(msg)).await;
    assert!(matches!(outcome, DispatchOutcome::RepliedUnroutable { .. }));
    let reply = into_message(h.bus.take().remove(0));
    assert_eq!(reply.session_event, Some(SessionEvent::Close));
}

#[tokio::test]
async fn test_message_without_account_or_tag() {
    let h = Harness::new(base_config(), conversation_table());

    let msg = Message::new("1234", "+27831234567", Some("hi".into()));
    let result = h.dispatcher.try_dispatch("sphex", Envelope::Inbound(msg)).await;
    assert!(matches!(result, Err(DispatchError::Unroutable { .. })));
    assert!(h.bus.is_empty());
}

#[tokio::test]
async fn test_unowned_tag() {
    let h = Harness::new(base_config(), conversation_table());
    h.accounts.release_tag(&tag());

    let result = h
        .dispatcher
        .try_dispatch("sphex", Envelope::Inbound(inbound("hi")))
        .await;
    assert!(matches!(result, Err(DispatchError::NoTagOwner { .. })));

    let outcome = h.dispatcher.dispatch("sphex", Envelope::Inbound(inbound("hi"))).await;
    assert!(matches!(outcome, DispatchOutcome::Dropped { .. }));
    assert_eq!(h.dispatcher.stats().dropped, 1);
}

#[tokio::test]
async fn test_outbound_is_persisted_before_transport() {
    let h = Harness::new(base_config(), conversation_table());

    let msg = from_conversation("reply");
    let published = h.dispatch_one("app1", Envelope::Outbound(msg.clone())).await;
    assert_eq!(published.connector, "sphex");
    let out = into_message(published);
    assert_eq!(out.helper_metadata.tag, Some(tag()));

    let stored = h.messages.get_outbound_message(&msg.message_id).await.unwrap();
    assert_eq!(stored, Some(out));
}

#[tokio::test]
async fn test_outbound_persistence_can_be_disabled() {
    let mut config = base_config();
    config.store_messages_to_transports = false;
    let h = Harness::new(config, conversation_table());

    let published = h
        .dispatch_one("app1", Envelope::Outbound(from_conversation("reply")))
        .await;
    assert_eq!(published.connector, "sphex");
    assert_eq!(h.messages.outbound_count(), 0);
}

#[tokio::test]
async fn test_outbound_on_inbound_connector_rejected() {
    let h = Harness::new(base_config(), conversation_table());

    let result = h
        .dispatcher
        .try_dispatch("sphex", Envelope::Outbound(from_conversation("reply")))
        .await;
    assert!(matches!(result, Err(DispatchError::UnexpectedConnector { .. })));
}

#[tokio::test]
async fn test_event_retraces_router_path() {
    let h = Harness::new(base_config(), router_table());
    let router_in = endpoint(
        GoConnector::router("keyword", "r1", ConnectorDirection::Inbound),
        "default",
    );
    let router_out = endpoint(
        GoConnector::router("keyword", "r1", ConnectorDirection::Outbound),
        "kw1",
    );
    let conv = endpoint(conv_conn(), "default");
    let tag_ep = endpoint(tag_conn(), "default");

    // Conversation -> router outbound side
    let msg = from_conversation("reply");
    let published = h.dispatch_one("app1", Envelope::Outbound(msg.clone())).await;
    assert_eq!(published.connector, "router_ro");
    let mut at_router = into_message(published);
    assert_eq!(at_router.routing_endpoint, "kw1");
    assert_eq!(at_router.helper_metadata.go.router_key.as_deref(), Some("r1"));

    // Router re-emits from its inbound side -> transport
    at_router.routing_endpoint = "default".into();
    let published = h.dispatch_one("router_ri", Envelope::Outbound(at_router)).await;
    assert_eq!(published.connector, "sphex");
    let sent = into_message(published);
    assert_eq!(
        sent.routing_metadata.hops(),
        &[
            Hop::closed(conv.clone(), router_out.clone()),
            Hop::closed(router_in.clone(), tag_ep.clone()),
        ]
    );

    // Transport acks -> router inbound side
    let mut ack = Event::ack(msg.message_id.clone());
    ack.routing_endpoint = "default".into();
    let published = h.dispatch_one("sphex", Envelope::Event(ack)).await;
    assert_eq!(published.connector, "router_ri");
    let mut at_router = into_event(published);
    assert_eq!(
        at_router.routing_metadata.outbound_hops(),
        Some(
            &[
                Hop::closed(tag_ep.clone(), router_in.clone()),
                Hop::closed(router_out.clone(), conv.clone()),
            ][..]
        )
    );
    assert_eq!(at_router.routing_metadata.next_router_endpoint(), Some("kw1"));

    // Router forwards the event from its outbound side -> conversation
    at_router.routing_endpoint = "kw1".into();
    let published = h.dispatch_one("router_ro", Envelope::Event(at_router)).await;
    assert_eq!(published.connector, "app1");
    let delivered = into_event(published);
    assert_eq!(delivered.routing_metadata.next_hop(), None);
    assert_eq!(
        delivered.routing_metadata.hops(),
        &[Hop::closed(tag_ep, router_in), Hop::closed(router_out, conv)]
    );
    assert_eq!(delivered.helper_metadata.go.conversation_key.as_deref(), Some("conv1"));
    assert!(h.bus.is_empty());
}

#[tokio::test]
async fn test_event_without_stored_message_is_unroutable() {
    let h = Harness::new(base_config(), conversation_table());

    let result = h
        .dispatcher
        .try_dispatch(
            "sphex",
            Envelope::Event(Event::delivery_report("missing", "delivered")),
        )
        .await;
    assert!(matches!(result, Err(DispatchError::Unroutable { .. })));
}

#[tokio::test]
async fn test_billing_round_trip() {
    let h = Harness::new(billing_config(), conversation_table());
    let billing = endpoint(GoConnector::Billing, "default");
    let tag_ep = endpoint(tag_conn(), "default");
    let conv = endpoint(conv_conn(), "default");

    // Inbound goes to billing first
    let published = h.dispatch_one("sphex", Envelope::Inbound(inbound("hello"))).await;
    assert_eq!(published.connector, "billing_in");
    let mut rated = into_message(published);
    rated.helper_metadata.billing.is_paid = true;

    let published = h.dispatch_one("billing_in", Envelope::Inbound(rated)).await;
    assert_eq!(published.connector, "app1");
    let delivered = into_message(published);
    assert_eq!(
        delivered.routing_metadata.hops(),
        &[
            Hop::closed(tag_ep.clone(), billing.clone()),
            Hop::closed(billing.clone(), conv.clone()),
        ]
    );

    // Outbound goes to billing before the transport
    let msg = from_conversation("reply");
    let published = h.dispatch_one("app1", Envelope::Outbound(msg.clone())).await;
    assert_eq!(published.connector, "billing_out");
    assert_eq!(h.messages.outbound_count(), 0);

    let published = h
        .dispatch_one("billing_out", published.envelope)
        .await;
    assert_eq!(published.connector, "sphex");
    assert_eq!(h.messages.outbound_count(), 1);

    // Events skip billing on the way back
    let published = h
        .dispatch_one("sphex", Envelope::Event(Event::ack(msg.message_id.clone())))
        .await;
    assert_eq!(published.connector, "app1");
    let event = into_event(published);
    assert_eq!(
        event.routing_metadata.outbound_hops(),
        Some(&[Hop::closed(tag_ep, conv)][..])
    );
}

#[tokio::test]
async fn test_opt_out_bypasses_billing() {
    let h = Harness::new(billing_config(), conversation_table());

    let published = h.dispatch_one("sphex", Envelope::Inbound(inbound("stop"))).await;
    assert_eq!(published.connector, "optout");
}

#[tokio::test]
async fn test_paid_opt_out_keeps_table_target() {
    let h = Harness::new(billing_config(), conversation_table());

    let mut msg = inbound("stop");
    msg.helper_metadata.billing.is_paid = true;
    msg.routing_metadata.push_hop(
        endpoint(tag_conn(), "default"),
        endpoint(GoConnector::Billing, "default"),
    );

    let published = h.dispatch_one("billing_in", Envelope::Inbound(msg)).await;
    assert_eq!(published.connector, "app1");
    let delivered = into_message(published);
    assert_eq!(
        delivered.helper_metadata.optout,
        Some(OptOutMetadata {
            optout: true,
            optout_keyword: Some("stop".into()),
        })
    );
}

fn worker_config() -> WorkerConfig {
    WorkerConfig::from_json(
        r#"{
            "dispatcher": {
                "receive_inbound_connectors": ["sphex"],
                "receive_outbound_connectors": ["app1"],
                "application_connector_mapping": {"app1": "app1"}
            },
            "account_concurrency": 2,
            "accounts": [{
                "key": "acc1",
                "routing_table": {
                    "TRANSPORT_TAG:pool1:1234": {"default": ["CONVERSATION:app1:conv1", "default"]},
                    "CONVERSATION:app1:conv1": {"default": ["TRANSPORT_TAG:pool1:1234", "default"]}
                }
            }],
            "tag_owners": [{"tag": ["pool1", "1234"], "account": "acc1"}],
            "tag_pools": {"pool1": {"transport_name": "sphex"}}
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_worker_from_config() {
    let bus = Arc::new(MemoryBus::new());
    let worker = Worker::new(worker_config(), bus.clone()).unwrap();

    let outcome = worker
        .handle("sphex", Envelope::Inbound(inbound("hello")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Published {
            connector: "app1".into(),
            target: endpoint(conv_conn(), "default"),
        }
    );
    assert_eq!(bus.len(), 1);
    assert_eq!(worker.stats().inbound_received, 1);
    assert_eq!(worker.limits.tracked_keys(), 0);
}

#[tokio::test]
async fn test_worker_limits_by_resolved_account() {
    let bus = Arc::new(MemoryBus::new());
    let worker = Worker::new(worker_config(), bus).unwrap();

    let tagged = Envelope::Inbound(inbound("hello"));
    assert_eq!(worker.limit_key("sphex", &tagged).await.unwrap(), "acc1");

    let untagged = Envelope::Inbound(Message::new("1234", "+27831234567", None));
    assert_eq!(
        worker.limit_key("sphex", &untagged).await.unwrap(),
        "connector:sphex"
    );

    let report = Event::delivery_report("msg-1", "delivered");
    assert_eq!(
        worker
            .limit_key("sphex", &Envelope::Event(report.clone()))
            .await
            .unwrap(),
        "connector:sphex"
    );

    let mut sent = from_conversation("hi");
    sent.message_id = "msg-1".into();
    worker.messages.add_outbound_message(&sent).await.unwrap();
    assert_eq!(
        worker
            .limit_key("sphex", &Envelope::Event(report))
            .await
            .unwrap(),
        "acc1"
    );
}
