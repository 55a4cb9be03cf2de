// SPDX-License-Identifier: BSD-3-Clause

mod support;

use virtrpc::{Error, REMOTE_PROGRAM};

/// Scenario S4: when the peer closes mid-call, every outstanding caller is cancelled with
/// the same sticky "connection lost" error, and the connection refuses further calls
/// afterward without another round trip (§5 Cancellation).
#[test]
fn peer_close_cancels_every_outstanding_call_and_sticks() {
    let server = support::Server::start();
    let (conn, session) = support::open_connection(&server);

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let conn = conn.clone();
            std::thread::spawn(move || conn.call(REMOTE_PROGRAM, 9500 + i, vec![i as u8], true, false, false))
        })
        .collect();

    // Block until all three CALL frames actually reached the wire before severing the
    // connection, so every caller is genuinely outstanding.
    for _ in 0..3 {
        session.recv();
    }
    session.shutdown();

    for h in handles {
        let err = h.join().expect("client thread panicked").expect_err("call must fail once the peer closes");
        assert!(matches!(err, Error::Transport(_)), "expected Error::Transport, got {err:?}");
    }

    // The closed state is sticky: a subsequent call fails immediately, without needing a
    // live peer to answer it.
    let err = conn
        .call(REMOTE_PROGRAM, 9999, Vec::new(), true, false, false)
        .expect_err("calls after peer close must fail immediately");
    assert!(matches!(err, Error::Transport(_)), "expected Error::Transport, got {err:?}");
}
