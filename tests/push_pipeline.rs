//! Push pipeline tests driving a client connection by hand: the test plays
//! the I/O task, deciding when chunks are flushed and acknowledged.

mod common;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{Map, Value};
use telemetry_web::connection::{ConnEvent, Connection};
use telemetry_web::server::WebServer;

fn connect(server: &WebServer) -> Connection {
    let mut conn = Connection::new();
    let handler = server.create_websocket_handler(&conn).unwrap();
    conn.attach(Box::new(handler)).unwrap();
    conn
}

/// Flush and acknowledge everything pending; returns the decoded messages.
fn drain(conn: &mut Connection) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut current = Vec::new();
    conn.dispatch(ConnEvent::Poll);
    while let Some(chunk) = conn.take_outbound() {
        current.extend_from_slice(&chunk.data);
        if chunk.fin {
            messages.push(serde_json::from_slice(&std::mem::take(&mut current)).unwrap());
        }
        conn.dispatch(ConnEvent::Sent(chunk.data.len()));
    }
    messages
}

/// Apply metric messages to a client-side view.
fn apply(view: &mut Map<String, Value>, messages: &[Value]) {
    for msg in messages {
        if let Some(metrics) = msg["metrics"].as_object() {
            for (k, v) in metrics {
                view.insert(k.clone(), v.clone());
            }
        }
    }
}

#[test]
fn stalled_client_overflows_then_converges() {
    let mut config = common::test_config();
    config.websocket.queue_capacity = 8;
    let server = common::test_server(config);
    server.metrics().set("v.b.soc", 0);
    server.metrics().set("v.e.locked", false);

    let mut conn = connect(&server);
    // The initial snapshot goes in flight and is never acknowledged.
    conn.dispatch(ConnEvent::Poll);
    let stalled = conn.take_outbound().expect("snapshot chunk");

    for i in 1..=50 {
        server.metrics().set("v.b.soc", i);
        assert_eq!(server.broadcast_metrics(false), 1);
    }
    let actor = server.clients().get(conn.id()).unwrap();
    assert_eq!(actor.overflow_count(), 42);
    assert_eq!(actor.queued(), 8);

    // Transport resumes.
    let mut view = Map::new();
    apply(
        &mut view,
        &[serde_json::from_slice(&stalled.data).unwrap()],
    );
    conn.dispatch(ConnEvent::Sent(stalled.data.len()));
    let messages = drain(&mut conn);
    apply(&mut view, &messages);

    assert_eq!(view, server.metrics().snapshot());
    let last = messages.last().expect("a resync after overflow");
    assert_eq!(last["metrics"].as_object().unwrap().len(), 2);
    assert_eq!(actor.queued(), 0);
    assert!(!actor.is_busy());
}

#[test]
fn transmitted_jobs_respect_accounting() {
    let mut config = common::test_config();
    config.websocket.queue_capacity = 4;
    let server = common::test_server(config);
    let mut rng = StdRng::seed_from_u64(7);

    for _round in 0..20 {
        let mut conn = connect(&server);
        drain(&mut conn);
        let actor = server.clients().get(conn.id()).unwrap();

        let mut attempts = 0usize;
        let mut transmitted = 0usize;
        for step in 0..200 {
            if rng.gen_bool(0.7) {
                attempts += 1;
                server.broadcast_event(&format!("step.{step}"));
            } else {
                transmitted += drain(&mut conn).len();
            }
        }
        transmitted += drain(&mut conn).len();

        let overflow = actor.overflow_count();
        assert!(transmitted <= attempts, "{transmitted} sent for {attempts} attempts");
        assert!(
            overflow + transmitted >= attempts,
            "{overflow} overflows + {transmitted} sent < {attempts} attempts"
        );
    }
}

#[test]
fn slow_client_does_not_hold_back_others() {
    let mut config = common::test_config();
    config.websocket.queue_capacity = 2;
    let server = common::test_server(config);
    server.metrics().set("v.b.soc", 80);

    let mut fast = connect(&server);
    let mut slow = connect(&server);
    drain(&mut fast);
    drain(&mut slow);

    for i in 0..10 {
        server.broadcast_event(&format!("e{i}"));
        let msgs = drain(&mut fast);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["event"], format!("e{i}"));
    }

    let slow_actor = server.clients().get(slow.id()).unwrap();
    assert_eq!(slow_actor.overflow_count(), 8);
    assert_eq!(server.clients().get(fast.id()).unwrap().overflow_count(), 0);

    // The slow client still gets what fit, then a resync.
    let msgs = drain(&mut slow);
    assert_eq!(msgs[0]["event"], "e0");
    assert_eq!(msgs[1]["event"], "e1");
    assert_eq!(msgs.len(), 3);
    assert_eq!(msgs[2]["metrics"]["v.b.soc"], 80);
}

#[test]
fn closing_connection_unregisters_client() {
    let server = common::test_server(common::test_config());
    let mut conn = connect(&server);
    assert_eq!(server.client_count(), 1);
    conn.close();
    assert_eq!(server.client_count(), 0);
    assert_eq!(server.broadcast_event("after.close"), 0);
}
