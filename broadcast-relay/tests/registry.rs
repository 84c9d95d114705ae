//! Membership and fan-out behaviour of the registry and dispatcher, driven
//! directly without any sockets.

use std::{collections::BTreeSet, sync::Arc, thread};

use broadcast_relay::{
    BroadcastPolicy, ConnectionId, Dispatcher, Frame, Message, Outbox, Registry, RelayError,
    RelayStats, SlowConsumerPolicy, message::prefix_formatter,
};

fn relay(
    max_connections: usize,
    capacity: usize,
    exclude_originator: bool,
) -> (Arc<Registry>, Dispatcher) {
    let registry = Arc::new(Registry::new(max_connections, capacity).expect("registry"));
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        BroadcastPolicy {
            exclude_originator,
            slow_consumer: SlowConsumerPolicy::Drop,
        },
        prefix_formatter("Server broadcast: "),
        Arc::new(RelayStats::new()),
    );
    (registry, dispatcher)
}

fn drain(outbox: &mut Outbox) -> Vec<String> {
    let mut received = Vec::new();
    while let Some(frame) = outbox.try_recv() {
        received.push(frame.as_text().expect("text frame").to_string());
    }
    received
}

#[test]
fn snapshot_tracks_admit_and_evict_sequences() {
    let registry = Registry::new(64, 4).expect("registry");
    let mut expected = BTreeSet::new();
    let mut outboxes = Vec::new();

    // Deterministic interleaving of admissions and evictions.
    for step in 0..40u64 {
        if step % 3 == 2 {
            let victim: Option<ConnectionId> = expected.iter().nth((step as usize) % 5).copied();
            if let Some(id) = victim {
                assert!(registry.evict(id));
                expected.remove(&id);
            }
        } else {
            let outbox = registry.admit().expect("below the limit");
            expected.insert(outbox.id());
            outboxes.push(outbox);
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot, expected.iter().copied().collect::<Vec<_>>());
        assert_eq!(registry.len(), expected.len());
    }
}

#[test]
fn concurrent_admits_and_evicts_never_leak_members() {
    let registry = Arc::new(Registry::new(1_000, 2).expect("registry"));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut kept = Vec::new();
                for n in 0..50 {
                    let outbox = registry.admit().expect("room for everyone");
                    if n % 2 == 0 {
                        registry.evict(outbox.id());
                    } else {
                        kept.push(outbox.id());
                    }
                }
                kept
            })
        })
        .collect();

    let mut survivors: Vec<ConnectionId> = handles
        .into_iter()
        .flat_map(|handle| handle.join().expect("worker thread"))
        .collect();
    survivors.sort();

    assert_eq!(registry.snapshot(), survivors);
    assert_eq!(survivors.len(), 8 * 25);
}

#[test]
fn evict_is_idempotent() {
    let registry = Registry::new(4, 4).expect("registry");
    let a = registry.admit().expect("admit a");
    let b = registry.admit().expect("admit b");

    assert!(registry.evict(a.id()));
    let after_first = registry.snapshot();
    assert!(!registry.evict(a.id()));
    assert_eq!(registry.snapshot(), after_first);
    assert_eq!(after_first, vec![b.id()]);

    assert!(!registry.evict(ConnectionId::new(9_999)));
}

#[test]
fn messages_from_one_sender_arrive_in_order() {
    let (registry, dispatcher) = relay(8, 16, true);
    let sender = registry.admit().expect("admit sender");
    let mut first = registry.admit().expect("admit recipient");
    let mut second = registry.admit().expect("admit recipient");

    for n in 0..10 {
        dispatcher.on_message(&Message::text(sender.id(), format!("m{n}")));
    }

    let expected: Vec<String> = (0..10).map(|n| format!("Server broadcast: m{n}")).collect();
    assert_eq!(drain(&mut first), expected);
    assert_eq!(drain(&mut second), expected);
}

#[test]
fn every_open_member_gets_exactly_one_copy() {
    let (registry, dispatcher) = relay(8, 4, false);
    let mut outboxes: Vec<Outbox> = (0..5).map(|_| registry.admit().expect("admit")).collect();
    let sender = outboxes[2].id();

    let report = dispatcher.on_message(&Message::text(sender, "ping"));
    assert_eq!(report.recipients, 5);
    assert_eq!(report.delivered, 5);
    assert!(report.is_complete());

    for outbox in &mut outboxes {
        assert_eq!(drain(outbox), vec!["Server broadcast: ping".to_string()]);
    }
}

#[test]
fn scenario_hello_reaches_everyone_else() {
    for exclude_originator in [true, false] {
        let (registry, dispatcher) = relay(8, 4, exclude_originator);
        let mut c1 = registry.admit().expect("admit c1");
        let mut c2 = registry.admit().expect("admit c2");
        let mut c3 = registry.admit().expect("admit c3");

        dispatcher.on_message(&Message::text(c1.id(), "hello"));

        let hello = vec!["Server broadcast: hello".to_string()];
        assert_eq!(drain(&mut c2), hello);
        assert_eq!(drain(&mut c3), hello);
        if exclude_originator {
            assert!(drain(&mut c1).is_empty());
        } else {
            assert_eq!(drain(&mut c1), hello);
        }
    }
}

#[test]
fn scenario_lone_sender_with_exclusion_reaches_nobody() {
    let (registry, dispatcher) = relay(8, 4, true);
    let mut c1 = registry.admit().expect("admit c1");
    let c2 = registry.admit().expect("admit c2");
    registry.evict(c2.id());

    let report = dispatcher.on_message(&Message::text(c1.id(), "x"));
    assert_eq!(report.recipients, 0);
    assert_eq!(report.delivered, 0);
    assert!(drain(&mut c1).is_empty());
}

#[test]
fn scenario_slow_consumer_fills_up_without_affecting_sender() {
    let (registry, dispatcher) = relay(8, 1, false);
    let slow = registry.admit().expect("admit c1");
    let mut c2 = registry.admit().expect("admit c2");

    let first = dispatcher.on_message(&Message::text(c2.id(), "one"));
    assert!(first.is_complete());
    assert_eq!(slow.len(), 1);
    // c2 drains its own echo, as a live client would.
    assert_eq!(drain(&mut c2), vec!["Server broadcast: one".to_string()]);

    let second = dispatcher.on_message(&Message::text(c2.id(), "two"));
    assert_eq!(second.failed_recipients(), vec![slow.id()]);
    assert!(matches!(second.failures[0].error, RelayError::QueueFull(id) if id == slow.id()));
    assert_eq!(second.delivered, 1);
    assert_eq!(drain(&mut c2), vec!["Server broadcast: two".to_string()]);

    assert!(registry.contains(slow.id()));
    assert_eq!(slow.len(), 1);
}

#[test]
fn scenario_admission_limit_is_enforced() {
    let registry = Registry::new(3, 4).expect("registry");
    let _members: Vec<Outbox> = (0..3).map(|_| registry.admit().expect("below limit")).collect();

    let result = registry.admit();
    assert!(matches!(result, Err(RelayError::ResourceExhausted { limit: 3 })));
    assert_eq!(registry.len(), 3);
}

#[test]
fn send_reports_missing_connection() {
    let registry = Registry::new(2, 2).expect("registry");
    let result = registry.send(ConnectionId::new(5), Frame::text("nobody"));
    assert!(matches!(result, Err(RelayError::NotFound(id)) if id == ConnectionId::new(5)));
}
