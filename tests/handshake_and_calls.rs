// SPDX-License-Identifier: BSD-3-Clause

mod support;

use virtrpc::{Error, ErrorRecord, ProgramVersion, REMOTE_PROGRAM};

const TEST_PROC_ECHO: i32 = 9001;
const TEST_PROC_MISSING: i32 = 9002;
const RPC_ERROR_UNKNOWN_PROCEDURE: i32 = 7;

fn test_program() -> ProgramVersion {
    REMOTE_PROGRAM
}

/// P6 (round-trip framing) plus a basic request/reply round trip once the connection
/// is open: the server echoes the argument bytes back as the result.
#[test]
fn call_round_trips_through_a_real_socket() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let client = std::thread::spawn(move || {
        conn.call(test_program(), TEST_PROC_ECHO, b"hello".to_vec(), true, false, false)
    });

    let call = session.recv();
    assert_eq!(call.header.procedure, TEST_PROC_ECHO);
    assert_eq!(call.body, b"hello");
    session.reply_ok(&call.header, &call.body);

    let result = client.join().expect("client thread panicked").expect("call failed");
    assert_eq!(result, b"hello");
}

/// P7: a synthetic server's error record is reproduced verbatim, field for field.
#[test]
fn error_record_is_preserved_with_full_fidelity() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let client = std::thread::spawn(move || {
        conn.call(test_program(), TEST_PROC_ECHO, Vec::new(), true, false, false)
    });

    let call = session.recv();
    let record = ErrorRecord {
        domain: 42,
        code: 99,
        level: 2,
        str1: Some("disk full".to_string()),
        str2: None,
        str3: None,
        int1: 7,
        int2: 0,
        message: Some("operation failed".to_string()),
    };
    session.reply_error(&call.header, &record);

    let err = client.join().expect("client thread panicked").unwrap_err();
    match err {
        Error::Rpc(got) => assert_eq!(got, record),
        other => panic!("expected Error::Rpc, got {other:?}"),
    }
}

/// P8: a "no such procedure" reply on a quiet-missing call surfaces as the UNSUPPORTED
/// sentinel rather than a hard RPC error (§7, §8 scenario S5).
#[test]
fn quiet_missing_call_yields_unsupported_sentinel() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let client = std::thread::spawn(move || {
        conn.call(test_program(), TEST_PROC_MISSING, Vec::new(), true, true, false)
    });

    let call = session.recv();
    let record = ErrorRecord {
        domain: 0,
        code: RPC_ERROR_UNKNOWN_PROCEDURE,
        level: 1,
        str1: None,
        str2: None,
        str3: None,
        int1: 0,
        int2: 0,
        message: Some("unknown procedure".to_string()),
    };
    session.reply_error(&call.header, &record);

    let err = client.join().expect("client thread panicked").unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "expected Unsupported, got {err:?}");
}

/// S5 (without quiet-missing): the same "unknown procedure" reply is a hard RPC error
/// when the caller did not ask for quiet-missing treatment.
#[test]
fn missing_procedure_without_quiet_missing_is_a_hard_error() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let client = std::thread::spawn(move || {
        conn.call(test_program(), TEST_PROC_MISSING, Vec::new(), true, false, false)
    });

    let call = session.recv();
    let record = ErrorRecord {
        domain: 0,
        code: RPC_ERROR_UNKNOWN_PROCEDURE,
        level: 1,
        str1: None,
        str2: None,
        str3: None,
        int1: 0,
        int2: 0,
        message: Some("unknown procedure".to_string()),
    };
    session.reply_error(&call.header, &record);

    let err = client.join().expect("client thread panicked").unwrap_err();
    match err {
        Error::Rpc(got) => assert_eq!(got.code, RPC_ERROR_UNKNOWN_PROCEDURE),
        other => panic!("expected Error::Rpc, got {other:?}"),
    }
}

/// A call with `want_reply=false` (used for keepalive and stream `send`) never blocks on
/// a reply: the call site returns as soon as the bytes are fully written.
#[test]
fn want_reply_false_completes_without_a_server_reply() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let client = std::thread::spawn(move || {
        conn.call(test_program(), TEST_PROC_ECHO, b"fire-and-forget".to_vec(), false, false, false)
    });

    let result = client.join().expect("client thread panicked").expect("call failed");
    assert!(result.is_empty());

    let call = session.recv();
    assert_eq!(call.body, b"fire-and-forget");
}
