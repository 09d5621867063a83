//! Integration tests for shared contexts

use cosync::context::{ContextConfig, ContextEngine, ContextHandle, ContextInfo, RequestCall};
use cosync::error::{ErrorKind, SyncError};
use cosync::protocol::{ContextDescriptor, RequestDescriptor};
use cosync::transport::MemoryTransport;
use cosync::types::{ClientId, ConnectionId};
use cosync::ServerEvent;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn setup() -> (Arc<MemoryTransport>, ContextEngine) {
    let transport = Arc::new(MemoryTransport::new());
    let engine = ContextEngine::new(transport.clone());
    (transport, engine)
}

fn connect(transport: &MemoryTransport, name: &str) -> ConnectionId {
    let connection = ConnectionId::new(name);
    transport.attach(&connection);
    connection
}

fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

fn identity_config(name: &str) -> ContextConfig {
    ContextConfig::new(name, |credential: Value| async move {
        match credential.as_str() {
            Some(id) => Ok(ClientId::new(id)),
            None => anyhow::bail!("bad token"),
        }
    })
}

fn echo_config() -> ContextConfig {
    identity_config("echo").request("echo", |call: RequestCall| async move {
        Ok(call.params.unwrap_or(Value::Null))
    })
}

/// `room` context backed by a shared counter, with a clients status
fn counter_room(counter: Arc<AtomicUsize>) -> ContextConfig {
    let for_data = Arc::clone(&counter);
    identity_config("room")
        .data(move |_info: ContextInfo| {
            let counter = Arc::clone(&for_data);
            async move { Ok(json!({ "count": counter.load(Ordering::SeqCst) })) }
        })
        .status(|_info: ContextInfo, clients: Vec<ClientId>| async move {
            Ok(json!({ "clients": clients }))
        })
        .request("increment", move |_call: RequestCall| {
            let counter = Arc::clone(&counter);
            async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .request("noop", |_call: RequestCall| async move {
            Ok(json!("unchanged"))
        })
        .request("fail", |_call: RequestCall| async move {
            anyhow::bail!("request exploded")
        })
}

fn request(name: &str, params: Option<Value>) -> RequestDescriptor {
    RequestDescriptor {
        name: name.to_string(),
        params,
    }
}

#[tokio::test]
async fn test_echo_join_and_request() {
    let (transport, engine) = setup();
    engine.add_config(echo_config()).await.unwrap();
    let c1 = connect(&transport, "c1");
    let descriptor = ContextDescriptor::new("echo", None);

    let joined = engine.join(&c1, json!("u1"), descriptor.clone()).await;
    assert!(joined.success);
    assert_eq!(joined.id, Some(descriptor.id()));
    assert_eq!(joined.name.as_deref(), Some("echo"));
    assert_eq!(names(&transport.drain(&c1)), vec!["data", "status"]);

    let reply = engine
        .request(&c1, &descriptor.id(), request("echo", Some(json!("hi"))))
        .await;
    assert!(reply.success);
    assert_eq!(reply.message, Some(json!("hi")));
    // Null snapshots did not change, so nothing else was pushed
    assert!(transport.drain(&c1).is_empty());
}

#[tokio::test]
async fn test_empty_params_and_absent_params_are_separate_contexts() {
    let (transport, engine) = setup();
    engine.add_config(identity_config("room")).await.unwrap();
    let a = connect(&transport, "a");
    let b = connect(&transport, "b");

    let with_empty = ContextDescriptor::new("room", Some(json!({})));
    let without = ContextDescriptor::new("room", None);
    assert!(
        engine
            .join(&a, json!("u1"), with_empty.clone())
            .await
            .success
    );
    assert!(engine.join(&b, json!("u2"), without.clone()).await.success);

    assert_ne!(with_empty.id(), without.id());
    assert_eq!(engine.context_count(), 2);
    assert_eq!(engine.member_count(&with_empty.id()), 1);
    assert_eq!(engine.member_count(&without.id()), 1);
    assert!(engine.is_member(&with_empty.id(), &a));
    assert!(!engine.is_member(&with_empty.id(), &b));
}

#[tokio::test]
async fn test_unauthorized_join_leaves_no_member() {
    let (transport, engine) = setup();
    engine.add_config(echo_config()).await.unwrap();
    let c1 = connect(&transport, "c1");
    let descriptor = ContextDescriptor::new("echo", None);

    let reply = engine.join(&c1, json!(null), descriptor.clone()).await;
    assert!(!reply.success);
    assert_eq!(reply.kind, Some(ErrorKind::Unauthorized));
    assert_eq!(reply.message_str(), Some("bad token"));
    assert_eq!(engine.member_count(&descriptor.id()), 0);
    assert!(transport.drain(&c1).is_empty());
}

#[tokio::test]
async fn test_join_unknown_config_is_unknown_target() {
    let (transport, engine) = setup();
    let c1 = connect(&transport, "c1");
    let reply = engine
        .join(&c1, json!("u1"), ContextDescriptor::new("nowhere", None))
        .await;
    assert_eq!(reply.kind, Some(ErrorKind::UnknownTarget));
    assert_eq!(engine.context_count(), 0);
}

#[tokio::test]
async fn test_request_broadcasts_before_reply() {
    let (transport, engine) = setup();
    let counter = Arc::new(AtomicUsize::new(0));
    engine.add_config(counter_room(counter)).await.unwrap();
    let a = connect(&transport, "a");
    let b = connect(&transport, "b");
    let descriptor = ContextDescriptor::new("room", None);
    let id = descriptor.id();

    engine.join(&a, json!("u1"), descriptor.clone()).await;
    engine.join(&b, json!("u2"), descriptor.clone()).await;
    transport.drain(&a);
    transport.drain(&b);

    let reply = engine.request(&a, &id, request("increment", None)).await;
    assert!(reply.success);
    assert_eq!(reply.message, Some(json!(1)));

    // Both members already hold the new data when the reply is available
    for connection in [&a, &b] {
        let events = transport.drain(connection);
        assert_eq!(
            events,
            vec![ServerEvent::Data {
                id: id.clone(),
                data: json!({"count": 1}),
            }]
        );
    }
}

#[tokio::test]
async fn test_unchanged_state_is_not_rebroadcast() {
    let (transport, engine) = setup();
    engine
        .add_config(counter_room(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    let a = connect(&transport, "a");
    let descriptor = ContextDescriptor::new("room", None);
    engine.join(&a, json!("u1"), descriptor.clone()).await;
    transport.drain(&a);

    let reply = engine
        .request(&a, &descriptor.id(), request("noop", None))
        .await;
    assert!(reply.success);
    assert!(transport.drain(&a).is_empty());
}

#[tokio::test]
async fn test_join_diffs_status_to_every_member() {
    let (transport, engine) = setup();
    engine
        .add_config(counter_room(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    let a = connect(&transport, "a");
    let b = connect(&transport, "b");
    let descriptor = ContextDescriptor::new("room", None);
    let id = descriptor.id();

    engine.join(&a, json!("u1"), descriptor.clone()).await;
    transport.drain(&a);
    engine.join(&b, json!("u2"), descriptor.clone()).await;

    let clients = ServerEvent::Status {
        id: id.clone(),
        status: json!({"clients": ["u1", "u2"]}),
    };
    // Existing member sees the new client list but no data
    assert_eq!(transport.drain(&a), vec![clients.clone()]);
    // Newcomer gets exactly one of each
    let b_events = transport.drain(&b);
    assert_eq!(names(&b_events), vec!["data", "status"]);
    assert_eq!(b_events[1], clients);

    // A second connection of a known client changes nothing for others
    let b2 = connect(&transport, "b2");
    engine.join(&b2, json!("u2"), descriptor.clone()).await;
    assert!(transport.drain(&a).is_empty());
    assert!(transport.drain(&b).is_empty());
    assert_eq!(names(&transport.drain(&b2)), vec!["data", "status"]);
}

#[tokio::test]
async fn test_rejoin_under_new_identity_leaves_old_client() {
    let (transport, engine) = setup();
    let departures = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&departures);
    let config = counter_room(Arc::new(AtomicUsize::new(0))).on_leave(
        move |_info: ContextInfo, client: ClientId| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(client);
                Ok(())
            }
        },
    );
    engine.add_config(config).await.unwrap();
    let watcher = connect(&transport, "watcher");
    let switcher = connect(&transport, "switcher");
    let descriptor = ContextDescriptor::new("room", None);
    let id = descriptor.id();

    engine.join(&watcher, json!("w"), descriptor.clone()).await;
    engine
        .join(&switcher, json!("u1"), descriptor.clone())
        .await;
    transport.drain(&watcher);
    transport.drain(&switcher);

    assert!(
        engine
            .join(&switcher, json!("u2"), descriptor.clone())
            .await
            .success
    );

    assert_eq!(*departures.lock(), vec![ClientId::new("u1")]);
    assert_eq!(
        engine.clients(&id),
        vec![ClientId::new("u2"), ClientId::new("w")]
    );
    assert_eq!(engine.member_count(&id), 2);
    assert_eq!(
        transport.drain(&watcher),
        vec![
            ServerEvent::Status {
                id: id.clone(),
                status: json!({"clients": ["w"]}),
            },
            ServerEvent::Status {
                id: id.clone(),
                status: json!({"clients": ["u2", "w"]}),
            },
        ]
    );
    // Forgotten cache: the switched connection gets a fresh snapshot
    assert_eq!(names(&transport.drain(&switcher)), vec!["data", "status"]);
    assert_eq!(engine.memberships_of(&switcher), vec![id]);
}

#[tokio::test]
async fn test_request_failures_are_typed() {
    let (transport, engine) = setup();
    engine
        .add_config(counter_room(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    let member = connect(&transport, "member");
    let outsider = connect(&transport, "outsider");
    let descriptor = ContextDescriptor::new("room", None);
    let id = descriptor.id();
    engine.join(&member, json!("u1"), descriptor.clone()).await;
    transport.drain(&member);

    let unknown_context = engine
        .request(
            &member,
            &ContextDescriptor::new("room", Some(json!(1))).id(),
            request("noop", None),
        )
        .await;
    assert_eq!(unknown_context.kind, Some(ErrorKind::UnknownTarget));
    assert!(unknown_context.id.is_some());

    let unknown_request = engine.request(&member, &id, request("dance", None)).await;
    assert_eq!(unknown_request.kind, Some(ErrorKind::UnknownRequest));
    assert_eq!(unknown_request.id, Some(id.clone()));

    let not_member = engine.request(&outsider, &id, request("noop", None)).await;
    assert_eq!(not_member.kind, Some(ErrorKind::NotAMember));

    let failed = engine.request(&member, &id, request("fail", None)).await;
    assert_eq!(failed.kind, Some(ErrorKind::HandlerError));
    assert_eq!(failed.message_str(), Some("request exploded"));
    assert!(transport.drain(&member).is_empty());
}

#[tokio::test]
async fn test_leave_is_idempotent_and_unknown_context_fails() {
    let (transport, engine) = setup();
    engine.add_config(echo_config()).await.unwrap();
    let c1 = connect(&transport, "c1");
    let descriptor = ContextDescriptor::new("echo", None);
    let id = descriptor.id();
    engine.join(&c1, json!("u1"), descriptor).await;

    assert!(engine.leave(&c1, &id).await.success);
    assert!(engine.leave(&c1, &id).await.success);
    assert_eq!(engine.member_count(&id), 0);
    assert_eq!(transport.group_size(&(&id).into()), 0);

    let other = ContextDescriptor::new("echo", Some(json!("x"))).id();
    assert_eq!(
        engine.leave(&c1, &other).await.kind,
        Some(ErrorKind::UnknownTarget)
    );
}

#[tokio::test]
async fn test_on_leave_runs_after_last_connection_of_client() {
    let (transport, engine) = setup();
    let departures = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&departures);
    let config = counter_room(Arc::new(AtomicUsize::new(0))).on_leave(
        move |_info: ContextInfo, client: ClientId| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(client);
                Ok(())
            }
        },
    );
    engine.add_config(config).await.unwrap();

    let tab_one = connect(&transport, "tab1");
    let tab_two = connect(&transport, "tab2");
    let friend = connect(&transport, "friend");
    let descriptor = ContextDescriptor::new("room", None);
    let id = descriptor.id();
    engine.join(&tab_one, json!("u1"), descriptor.clone()).await;
    engine.join(&tab_two, json!("u1"), descriptor.clone()).await;
    engine.join(&friend, json!("u2"), descriptor.clone()).await;
    assert_eq!(engine.member_count(&id), 3);
    assert_eq!(engine.client_count(&id), 2);
    transport.drain(&friend);

    engine.leave(&tab_one, &id).await;
    assert!(departures.lock().is_empty());
    assert!(transport.drain(&friend).is_empty());

    engine.leave(&tab_two, &id).await;
    assert_eq!(*departures.lock(), vec![ClientId::new("u1")]);
    assert_eq!(
        transport.drain(&friend),
        vec![ServerEvent::Status {
            id: id.clone(),
            status: json!({"clients": ["u2"]}),
        }]
    );
    assert_eq!(engine.clients(&id), vec![ClientId::new("u2")]);
}

#[tokio::test]
async fn test_can_join_limits_distinct_clients() {
    let (transport, engine) = setup();
    let config =
        identity_config("duel").can_join(|client: ClientId, clients: Vec<ClientId>| async move {
            if clients.len() >= 2 && !clients.contains(&client) {
                anyhow::bail!("room is full");
            }
            Ok(())
        });
    engine.add_config(config).await.unwrap();
    let descriptor = ContextDescriptor::new("duel", None);

    for (connection, client) in [("a", "u1"), ("b", "u2"), ("a2", "u1")] {
        let connection = connect(&transport, connection);
        assert!(
            engine
                .join(&connection, json!(client), descriptor.clone())
                .await
                .success
        );
    }
    let late = connect(&transport, "c");
    let reply = engine.join(&late, json!("u3"), descriptor.clone()).await;
    assert_eq!(reply.kind, Some(ErrorKind::AdmissionDenied));
    assert_eq!(reply.message_str(), Some("room is full"));
    assert_eq!(engine.client_count(&descriptor.id()), 2);
}

#[tokio::test]
async fn test_invalid_params_retain_nothing() {
    let (transport, engine) = setup();
    let config = identity_config("board").is_valid(|params: Option<Value>| async move {
        match params
            .as_ref()
            .and_then(|p| p.get("size"))
            .and_then(Value::as_u64)
        {
            Some(size) if size <= 19 => Ok(()),
            _ => anyhow::bail!("size must be at most 19"),
        }
    });
    engine.add_config(config).await.unwrap();
    let c1 = connect(&transport, "c1");

    let reply = engine
        .join(
            &c1,
            json!("u1"),
            ContextDescriptor::new("board", Some(json!({"size": 40}))),
        )
        .await;
    assert_eq!(reply.kind, Some(ErrorKind::InvalidParams));
    assert_eq!(engine.context_count(), 0);

    let reply = engine
        .join(
            &c1,
            json!("u1"),
            ContextDescriptor::new("board", Some(json!({"size": 9}))),
        )
        .await;
    assert!(reply.success);
}

#[tokio::test]
async fn test_init_failure_is_handler_error() {
    let (transport, engine) = setup();
    let config = identity_config("broken")
        .init(|_handle: ContextHandle| async move { anyhow::bail!("cannot load state") });
    engine.add_config(config).await.unwrap();
    let c1 = connect(&transport, "c1");

    let reply = engine
        .join(&c1, json!("u1"), ContextDescriptor::new("broken", None))
        .await;
    assert_eq!(reply.kind, Some(ErrorKind::HandlerError));
    assert_eq!(reply.message_str(), Some("cannot load state"));
    assert_eq!(engine.context_count(), 0);
}

#[tokio::test]
async fn test_init_handle_refreshes_and_closes_from_outside() {
    let (transport, engine) = setup();
    let handles: Arc<Mutex<Vec<ContextHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let value = Arc::new(AtomicUsize::new(0));
    let slot = Arc::clone(&handles);
    let source = Arc::clone(&value);
    let config = identity_config("ticker")
        .init(move |handle: ContextHandle| {
            let slot = Arc::clone(&slot);
            async move {
                slot.lock().push(handle);
                Ok(())
            }
        })
        .data(move |_info: ContextInfo| {
            let source = Arc::clone(&source);
            async move { Ok(json!(source.load(Ordering::SeqCst))) }
        });
    engine.add_config(config).await.unwrap();
    let c1 = connect(&transport, "c1");
    let descriptor = ContextDescriptor::new("ticker", None);
    engine.join(&c1, json!("u1"), descriptor.clone()).await;
    transport.drain(&c1);

    let handle = handles.lock()[0].clone();
    assert_eq!(handle.id(), &descriptor.id());
    assert_eq!(handle.info().name, "ticker");

    value.store(7, Ordering::SeqCst);
    handle.refresh();
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    engine.refresh(&descriptor.id()).await.unwrap();
    assert_eq!(
        transport.drain(&c1),
        vec![ServerEvent::Data {
            id: descriptor.id(),
            data: json!(7),
        }]
    );

    handle.close();
    for _ in 0..16 {
        if !engine.is_live(&descriptor.id()) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(engine.refresh(&descriptor.id()).await.is_err());
    assert_eq!(names(&transport.drain(&c1)), vec!["close"]);
    assert_eq!(engine.context_count(), 0);
}

#[tokio::test]
async fn test_joined_hook_failure_does_not_fail_join() {
    let (transport, engine) = setup();
    let config = echo_config().joined(
        |_info: ContextInfo, _connection: ConnectionId, _client: ClientId| async move {
            anyhow::bail!("welcome message failed")
        },
    );
    engine.add_config(config).await.unwrap();
    let c1 = connect(&transport, "c1");
    let reply = engine
        .join(&c1, json!("u1"), ContextDescriptor::new("echo", None))
        .await;
    assert!(reply.success);
}

#[tokio::test]
async fn test_data_failure_skips_channel() {
    let (transport, engine) = setup();
    let config = identity_config("shaky")
        .data(|_info: ContextInfo| async move { anyhow::bail!("snapshot unavailable") });
    engine.add_config(config).await.unwrap();
    let c1 = connect(&transport, "c1");
    let reply = engine
        .join(&c1, json!("u1"), ContextDescriptor::new("shaky", None))
        .await;
    assert!(reply.success);
    assert_eq!(names(&transport.drain(&c1)), vec!["status"]);
}

#[tokio::test]
async fn test_remove_config_closes_live_contexts() {
    let (transport, engine) = setup();
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    let config = echo_config().on_close(move |_info: ContextInfo| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    engine.add_config(config).await.unwrap();
    let a = connect(&transport, "a");
    let b = connect(&transport, "b");
    let first = ContextDescriptor::new("echo", None);
    let second = ContextDescriptor::new("echo", Some(json!({"topic": "x"})));
    engine.join(&a, json!("u1"), first.clone()).await;
    engine.join(&b, json!("u2"), second.clone()).await;
    transport.drain(&a);
    transport.drain(&b);

    assert_eq!(engine.remove_config("echo").await, 2);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    assert!(!engine.has_config("echo"));
    assert_eq!(engine.context_count(), 0);
    assert!(engine.memberships_of(&a).is_empty());

    let a_events = transport.drain(&a);
    assert_eq!(
        a_events,
        vec![ServerEvent::Close {
            name: "echo".to_string(),
            params: None,
            id: first.id(),
        }]
    );
    assert_eq!(names(&transport.drain(&b)), vec!["close"]);
    assert_eq!(engine.remove_config("echo").await, 0);
}

#[tokio::test]
async fn test_replacing_config_closes_old_contexts() {
    let (transport, engine) = setup();
    engine.add_config(echo_config()).await.unwrap();
    let a = connect(&transport, "a");
    let descriptor = ContextDescriptor::new("echo", None);
    engine.join(&a, json!("u1"), descriptor.clone()).await;
    transport.drain(&a);

    engine.add_config(echo_config()).await.unwrap();
    assert_eq!(names(&transport.drain(&a)), vec!["close"]);
    assert!(!engine.is_live(&descriptor.id()));
    assert_eq!(engine.config_names(), vec!["echo".to_string()]);
}

#[tokio::test]
async fn test_empty_config_name_is_rejected() {
    let (_transport, engine) = setup();
    let err = engine.add_config(identity_config("  ")).await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test]
async fn test_disconnect_leaves_every_context() {
    let (transport, engine) = setup();
    engine
        .add_config(counter_room(Arc::new(AtomicUsize::new(0))))
        .await
        .unwrap();
    engine.add_config(echo_config()).await.unwrap();
    let a = connect(&transport, "a");
    let b = connect(&transport, "b");
    let room = ContextDescriptor::new("room", None);
    let echo = ContextDescriptor::new("echo", None);
    engine.join(&a, json!("u1"), room.clone()).await;
    engine.join(&a, json!("u1"), echo.clone()).await;
    engine.join(&b, json!("u2"), room.clone()).await;
    transport.drain(&b);

    let mut left = engine.disconnect(&a).await;
    left.sort();
    let mut expected = vec![room.id(), echo.id()];
    expected.sort();
    assert_eq!(left, expected);
    assert!(engine.memberships_of(&a).is_empty());
    assert_eq!(engine.member_count(&room.id()), 1);
    assert_eq!(engine.member_count(&echo.id()), 0);
    assert_eq!(names(&transport.drain(&b)), vec!["status"]);
}

#[tokio::test]
async fn test_evict_if_empty_only_closes_empty_contexts() {
    let (transport, engine) = setup();
    engine.add_config(echo_config()).await.unwrap();
    let a = connect(&transport, "a");
    let descriptor = ContextDescriptor::new("echo", None);
    let id = descriptor.id();
    engine.join(&a, json!("u1"), descriptor).await;

    assert!(!engine.evict_if_empty(&id).await);
    engine.leave(&a, &id).await;
    assert!(engine.evict_if_empty(&id).await);
    assert!(engine.context_ids().is_empty());
    assert!(!engine.evict_if_empty(&id).await);
}

/// Tracks how many handlers are inside their critical section at once
#[derive(Default)]
struct Overlap {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Overlap {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_on_one_context_are_serialized() {
    let (transport, engine) = setup();
    let counter = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(Overlap::default());
    let for_data = Arc::clone(&counter);
    let for_request = Arc::clone(&overlap);
    let for_bump = Arc::clone(&counter);
    let config = identity_config("tally")
        .data(move |_info: ContextInfo| {
            let counter = Arc::clone(&for_data);
            async move { Ok(json!(counter.load(Ordering::SeqCst))) }
        })
        .request("bump", move |_call: RequestCall| {
            let counter = Arc::clone(&for_bump);
            let overlap = Arc::clone(&for_request);
            async move {
                overlap.enter();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
                overlap.exit();
                Ok(json!(value))
            }
        });
    engine.add_config(config).await.unwrap();
    let descriptor = ContextDescriptor::new("tally", None);
    let id = descriptor.id();
    let owner = connect(&transport, "owner");
    engine.join(&owner, json!("u0"), descriptor.clone()).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        {
            let engine = engine.clone();
            let transport = Arc::clone(&transport);
            let id = id.clone();
            let owner = owner.clone();
            tasks.push(tokio::spawn(async move {
                let reply = engine.request(&owner, &id, request("bump", None)).await;
                // The broadcast for this request is already in the log
                let expected = ServerEvent::Data {
                    id: id.clone(),
                    data: reply.message.clone().unwrap_or(Value::Null),
                };
                let seen = transport
                    .delivery_log()
                    .iter()
                    .any(|(connection, event)| connection == &owner && event == &expected);
                (reply.success, seen)
            }));
        }

        let engine = engine.clone();
        let transport = Arc::clone(&transport);
        let descriptor = descriptor.clone();
        tasks.push(tokio::spawn(async move {
            let joiner = connect(&transport, &format!("joiner{}", i));
            let reply = engine
                .join(&joiner, json!(format!("u{}", i + 1)), descriptor)
                .await;
            let events = transport.inbox(&joiner);
            (reply.success, names(&events[..2]) == vec!["data", "status"])
        }));
    }
    for task in tasks {
        let (success, ordered) = task.await.unwrap();
        assert!(success);
        assert!(ordered);
    }

    assert_eq!(overlap.max.load(Ordering::SeqCst), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    assert_eq!(engine.member_count(&id), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_contexts_do_not_block_each_other() {
    let (transport, engine) = setup();
    let gate = Arc::new(tokio::sync::Notify::new());
    let waiter = Arc::clone(&gate);
    let config = identity_config("gate")
        .request("wait", move |_call: RequestCall| {
            let waiter = Arc::clone(&waiter);
            async move {
                waiter.notified().await;
                Ok(json!("released"))
            }
        })
        .request(
            "ping",
            |_call: RequestCall| async move { Ok(json!("pong")) },
        );
    engine.add_config(config).await.unwrap();

    let a = connect(&transport, "a");
    let blocked = ContextDescriptor::new("gate", Some(json!("blocked")));
    let free = ContextDescriptor::new("gate", Some(json!("free")));
    engine.join(&a, json!("u1"), blocked.clone()).await;
    engine.join(&a, json!("u1"), free.clone()).await;

    let held = {
        let engine = engine.clone();
        let a = a.clone();
        let id = blocked.id();
        tokio::spawn(async move { engine.request(&a, &id, request("wait", None)).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let other = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        engine.request(&a, &free.id(), request("ping", None)),
    )
    .await
    .expect("request on another context must not wait");
    assert_eq!(other.message, Some(json!("pong")));
    assert!(!held.is_finished());

    gate.notify_one();
    let released = held.await.unwrap();
    assert_eq!(released.message, Some(json!("released")));
}
