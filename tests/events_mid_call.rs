// SPDX-License-Identifier: BSD-3-Clause

mod support;

use std::sync::mpsc;
use std::time::Duration;

use virtrpc::procedure::control_procedure;
use virtrpc::{xdr, Event, REMOTE_PROGRAM};

const PROC_LONG_RUNNING: i32 = 9401;
const EVENT_ID_LIFECYCLE: i32 = 0;

fn lifecycle_body(object: &[u8], event: i32, detail: i32) -> Vec<u8> {
    let mut body = Vec::new();
    xdr::write_bytes(&mut body, object).expect("encode object");
    xdr::write_i32(&mut body, event).expect("encode event code");
    xdr::write_i32(&mut body, detail).expect("encode detail code");
    body
}

/// Scenario S3: events arriving as MESSAGE frames while a call is outstanding are queued
/// in arrival order and only handed to the registered callback once the embedder calls
/// `flush_events`, never synchronously from inside the dispatcher loop.
#[test]
fn events_delivered_mid_call_are_queued_then_flushed_in_order() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let (tx, rx) = mpsc::channel::<Event>();
    let client_conn = conn.clone();
    let client = std::thread::spawn(move || -> virtrpc::Result<()> {
        client_conn.register_event(
            EVENT_ID_LIFECYCLE,
            None,
            Box::new(move |event: &Event| {
                let _ = tx.send(event.clone());
            }),
        )?;
        client_conn.call(REMOTE_PROGRAM, PROC_LONG_RUNNING, Vec::new(), true, false, false)?;
        client_conn.flush_events();
        Ok(())
    });

    let register_call = session.recv();
    assert_eq!(register_call.header.procedure, control_procedure::CONNECT_DOMAIN_EVENT_REGISTER_ANY);
    session.reply_ok(&register_call.header, &[]);

    let long_call = session.recv();
    assert_eq!(long_call.header.procedure, PROC_LONG_RUNNING);

    // Two lifecycle events pushed as MESSAGE frames before the call's own reply.
    session.send_message(REMOTE_PROGRAM.program, REMOTE_PROGRAM.version, control_procedure::EVENT_LIFECYCLE, &lifecycle_body(b"domain-x", 1, 0));
    session.send_message(REMOTE_PROGRAM.program, REMOTE_PROGRAM.version, control_procedure::EVENT_LIFECYCLE, &lifecycle_body(b"domain-x", 2, 1));

    // Nothing should be delivered to the callback yet: the call is still in flight and
    // flush_events has not run.
    assert!(rx.try_recv().is_err(), "events must not be dispatched before flush_events runs");

    session.reply_ok(&long_call.header, &[]);

    client.join().expect("client thread panicked").expect("client sequence failed");

    let first = rx.recv_timeout(Duration::from_secs(5)).expect("expected first queued event");
    let second = rx.recv_timeout(Duration::from_secs(5)).expect("expected second queued event");

    match first {
        Event::Lifecycle { object, event, detail } => {
            assert_eq!(object, b"domain-x");
            assert_eq!(event, 1);
            assert_eq!(detail, 0);
        }
        other => panic!("expected Lifecycle, got {other:?}"),
    }
    match second {
        Event::Lifecycle { object, event, detail } => {
            assert_eq!(object, b"domain-x");
            assert_eq!(event, 2);
            assert_eq!(detail, 1);
        }
        other => panic!("expected Lifecycle, got {other:?}"),
    }
    assert!(rx.try_recv().is_err(), "no extra events expected");
}
