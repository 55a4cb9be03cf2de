// SPDX-License-Identifier: BSD-3-Clause

//! A synthetic peer speaking the raw frame protocol over a real local socket, standing
//! in for the daemon side of the wire. Mirrors `rpc_protocol::pipe`'s role in that
//! crate's own tests, but over `std::os::unix::net::UnixStream` so the client side can
//! connect through the crate's public `TransportSpec::Unix`.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use virtrpc::frame::{self, FrameHeader, MessageType, Status};
use virtrpc::{xdr, ErrorRecord};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One frame read off the wire and handed to the test driving the synthetic server.
pub struct Inbound {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

/// Listens on a fresh local-socket path and accepts exactly one connection.
pub struct Server {
    pub path: PathBuf,
    accept_rx: Receiver<UnixStream>,
}

impl Server {
    pub fn start() -> Server {
        let path = unique_socket_path();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind synthetic server socket");
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = tx.send(stream);
            }
        });
        Server { path, accept_rx: rx }
    }

    /// Blocks until the client side connects, then hands back a scriptable session.
    pub fn accept(&self) -> Session {
        let stream = self
            .accept_rx
            .recv_timeout(RECV_TIMEOUT)
            .expect("client did not connect within timeout");
        let reader = stream.try_clone().expect("clone socket for reader thread");
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || read_frames(reader, tx));
        Session { stream, inbound_rx: rx }
    }
}

/// One accepted connection: a place to read inbound frames and script replies.
pub struct Session {
    stream: UnixStream,
    inbound_rx: Receiver<Inbound>,
}

impl Session {
    pub fn recv(&self) -> Inbound {
        self.inbound_rx.recv_timeout(RECV_TIMEOUT).expect("expected a frame from the client")
    }

    pub fn try_recv(&self, wait: Duration) -> Option<Inbound> {
        self.inbound_rx.recv_timeout(wait).ok()
    }

    /// Answers the handshake's auth-list query with an empty list, so `Connection::open`
    /// completes without driving a SASL or polkit round trip.
    pub fn answer_empty_auth_list(&mut self) {
        let auth_list = self.recv();
        let mut body = Vec::new();
        xdr::write_u32(&mut body, 0).expect("encode empty auth method count");
        self.reply_ok(&auth_list.header, &body);
    }

    pub fn reply_ok(&mut self, request: &FrameHeader, body: &[u8]) {
        self.send_frame(request.program, request.version, request.procedure, MessageType::Reply, request.serial, Status::Ok, body);
    }

    pub fn reply_error(&mut self, request: &FrameHeader, record: &ErrorRecord) {
        let mut body = Vec::new();
        xdr::write_error_record(&mut body, record).expect("encode error record");
        self.send_frame(request.program, request.version, request.procedure, MessageType::Reply, request.serial, Status::Error, &body);
    }

    pub fn send_message(&mut self, program: u32, version: u32, procedure: i32, body: &[u8]) {
        self.send_frame(program, version, procedure, MessageType::Message, 0, Status::Ok, body);
    }

    pub fn send_stream(&mut self, request: &FrameHeader, status: Status, body: &[u8]) {
        self.send_frame(request.program, request.version, request.procedure, MessageType::Stream, request.serial, status, body);
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn send_frame(&mut self, program: u32, version: u32, procedure: i32, message_type: MessageType, serial: u32, status: Status, body: &[u8]) {
        let header = FrameHeader { program, version, procedure, message_type, serial, status };
        let out = frame::encode_frame(&header, body).expect("encode frame");
        self.stream.write_all(&out).expect("write frame to client");
    }
}

fn read_frames(mut stream: UnixStream, tx: Sender<Inbound>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).is_err() {
            return;
        }
        let declared = match frame::decode_length_prefix(&len_buf) {
            Ok(v) => v as usize,
            Err(_) => return,
        };
        let mut rest = vec![0u8; declared - 4];
        if stream.read_exact(&mut rest).is_err() {
            return;
        }
        let (header, body) = match frame::decode_frame(&rest) {
            Ok((h, b)) => (h, b.to_vec()),
            Err(_) => return,
        };
        if tx.send(Inbound { header, body }).is_err() {
            return;
        }
    }
}

fn unique_socket_path() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("virtrpc-test-{}-{}.sock", std::process::id(), n))
}

/// Opens a client connection against `server`, answering the handshake's auth-list
/// query first. Returns the open connection and the session to keep scripting against.
pub fn open_connection(server: &Server) -> (std::sync::Arc<virtrpc::Connection>, Session) {
    let path = server.path.to_str().expect("socket path is valid UTF-8").to_string();
    let spec = virtrpc::ConnectSpec {
        transport: virtrpc::TransportSpec::Unix { path, auto_start: false },
        remote_name: None,
        preferred_auth: None,
        no_tty: true,
        debug: false,
    };
    let auth_options = virtrpc::auth::AuthOptions {
        preferred_method: None,
        credential: virtrpc::auth::Credential::default(),
        prompt: None,
        no_tty: true,
    };

    let client = std::thread::spawn(move || {
        virtrpc::open(spec, auth_options, std::sync::Arc::new(virtrpc::NullEventLoop))
    });

    let mut session = server.accept();
    session.answer_empty_auth_list();

    let conn = client.join().expect("client thread panicked").expect("connection handshake failed");
    (conn, session)
}
