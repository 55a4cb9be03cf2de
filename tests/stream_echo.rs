// SPDX-License-Identifier: BSD-3-Clause

mod support;

use virtrpc::frame::Status;
use virtrpc::REMOTE_PROGRAM;

const PROC_STREAM: i32 = 9301;

/// Scenario S2 / property P5: bytes delivered by `Stream::receive` equal, in order, the
/// concatenation of CONTINUE payloads observed on the wire, independent of the read
/// sizes the caller happens to use.
#[test]
fn stream_receive_reassembles_echoed_chunks_in_order() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let client = std::thread::spawn(move || -> virtrpc::Result<Vec<u8>> {
        let stream = conn.open_stream(REMOTE_PROGRAM, PROC_STREAM)?;
        stream.send(b"abc")?;
        stream.send(b"de")?;
        stream.send(b"fghij")?;
        stream.finish()?;

        let mut collected = Vec::new();
        for size in [3usize, 4, 3] {
            let mut buf = vec![0u8; size];
            let n = stream.receive(&mut buf, false)?.unwrap_or(0);
            collected.extend_from_slice(&buf[..n]);
        }
        Ok(collected)
    });

    let chunk1 = session.recv();
    assert_eq!(chunk1.header.message_type, virtrpc::frame::MessageType::Stream);
    session.send_stream(&chunk1.header, Status::Continue, &chunk1.body);

    let chunk2 = session.recv();
    session.send_stream(&chunk2.header, Status::Continue, &chunk2.body);

    let chunk3 = session.recv();
    session.send_stream(&chunk3.header, Status::Continue, &chunk3.body);

    let finish = session.recv();
    assert_eq!(finish.header.status, Status::Ok);
    session.send_stream(&finish.header, Status::Ok, &[]);

    let collected = client.join().expect("client thread panicked").expect("stream operations failed");
    assert_eq!(collected, b"abcdefghij");
}

/// An async stream error delivered while no call is waiting on the stream is stored on
/// the stream and raised on the caller's next operation (§4.6, §7).
#[test]
fn async_stream_error_is_raised_on_next_operation() {
    let server = support::Server::start();
    let (conn, mut session) = support::open_connection(&server);

    let stream = conn.open_stream(REMOTE_PROGRAM, PROC_STREAM).expect("open stream");

    // `send` only waits for transmission, not a reply, so this completes without any
    // concurrent reader; learn the stream's wire serial the same way the synthetic server
    // would, from the CONTINUE frame it actually sends.
    stream.send(b"x").expect("warm-up send failed");
    let opening = session.recv();
    session.send_stream(&opening.header, Status::Continue, &opening.body);

    let record = virtrpc::ErrorRecord {
        domain: 1,
        code: 2,
        level: 3,
        str1: None,
        str2: None,
        str3: None,
        int1: 0,
        int2: 0,
        message: Some("device detached".to_string()),
    };
    let mut body = Vec::new();
    virtrpc::xdr::write_error_record(&mut body, &record).expect("encode error record");

    // A STREAM/Error frame carrying the stream's own serial, delivered with no Call
    // waiting on it: a spontaneous, asynchronous stream error rather than the reply to a
    // pending finish/abort.
    session.send_stream(&opening.header, Status::Error, &body);

    // The only way to drive the dispatcher (and thus read/process that frame) through the
    // public API is another blocking operation on the connection; a second stream's send
    // becomes dispatcher and, because any registered stream keeps the read side armed,
    // its single event-loop pass both writes its own frame and reads the error pushed
    // above before returning.
    let nudge = conn.open_stream(REMOTE_PROGRAM, PROC_STREAM + 1).expect("open unrelated stream");
    nudge.send(b"nudge").expect("nudge send failed");
    let nudge_call = session.recv();
    session.send_stream(&nudge_call.header, Status::Continue, b"nudge");

    let mut buf = [0u8; 8];
    let err = stream.receive(&mut buf, true).expect_err("stored async error must surface");
    match err {
        virtrpc::Error::Rpc(got) => assert_eq!(got, record),
        other => panic!("expected Error::Rpc, got {other:?}"),
    }
}
