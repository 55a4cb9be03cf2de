// SPDX-License-Identifier: BSD-3-Clause

//! The multiplexer (§4.5) — the heart of the system. One connection mutex guards the
//! wait queue, the stream registry, and the event bridge; at most one caller thread is
//! ever the *dispatcher*, performing I/O on behalf of every other sleeping caller
//! ("pass the buck", §4.5 rationale).

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read as nix_read, write as nix_write};

use crate::auth::{AuthChannel as AuthChannelTrait, AuthOptions, Authenticator};
use crate::call::{CallMode, CallSlot};
use crate::config::{AutoSpawnBackoff, ConnectSpec, EnvConfig, TransportSpec};
use crate::error::{Error, Result};
use crate::event::{CloseCallback, CloseReason, Event, EventBridge, EventCallback, ObjectHandle};
use crate::eventloop::{EventLoop, IoEvents};
use crate::frame::{self, FrameHeader, MessageType, Status, MAX_FRAME};
use crate::procedure::{control_procedure, ProgramVersion, REMOTE_PROGRAM};
use crate::security::SecurityWrapper;
use crate::stream::{Stream, StreamCallbackState, StreamState};
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::{TlsCredentials, TlsTransport};
use crate::transport::tunnel::TunnelTransport;
use crate::transport::unix::UnixTransport;
use crate::transport::Transport;
use crate::xdr;

/// Everything touched under the single connection mutex (§4.5, §5).
struct ConnectionInner {
    transport: Box<dyn Transport>,
    security: Option<SecurityWrapper>,
    next_serial: u32,
    next_queue_id: u64,
    wait_queue: VecDeque<CallSlot>,
    streams: Vec<StreamState>,
    events: EventBridge,
    keepalive_last_seen: Option<std::time::Instant>,
    /// Set once the transport has died; every later call fails immediately with this
    /// (§5: "subsequent attempts on the connection return the sticky error").
    closed: Option<Error>,
    /// Frame-assembly buffer (§4.5 read sub-machine).
    read_buf: Vec<u8>,
    read_filled: usize,
    /// Plaintext already decoded by the security wrapper but not yet consumed by frame
    /// assembly (§4.3, §4.5).
    decoded_backlog: VecDeque<u8>,
}

pub struct Connection {
    inner: Mutex<ConnectionInner>,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    event_loop: Arc<dyn EventLoop>,
}

impl Connection {
    fn new(transport: Box<dyn Transport>, event_loop: Arc<dyn EventLoop>) -> Result<Self> {
        let (wake_read, wake_write) = pipe()?;
        crate::transport::set_nonblocking(wake_read.as_raw_fd())?;
        crate::transport::set_nonblocking(wake_write.as_raw_fd())?;

        Ok(Connection {
            inner: Mutex::new(ConnectionInner {
                transport,
                security: None,
                next_serial: 1,
                next_queue_id: 1,
                wait_queue: VecDeque::new(),
                streams: Vec::new(),
                events: EventBridge::default(),
                keepalive_last_seen: None,
                closed: None,
                read_buf: vec![0u8; MAX_FRAME],
                read_filled: 0,
                decoded_backlog: VecDeque::new(),
            }),
            wake_read,
            wake_write,
            event_loop,
        })
    }

    /// Establishes a transport per `spec`, then drives authentication to completion
    /// (§4.4). On success, a challenge/response negotiation's security context is
    /// installed beneath any existing TLS layer (§4.3).
    pub fn open(
        spec: ConnectSpec,
        auth_options: AuthOptions,
        event_loop: Arc<dyn EventLoop>,
    ) -> Result<Arc<Connection>> {
        let env = EnvConfig::from_env();
        let transport = build_transport(&spec, &env)?;
        let conn = Arc::new(Connection::new(transport, event_loop)?);

        let negotiated = {
            let channel = ConnAuthChannel { conn: conn.as_ref() };
            Authenticator::negotiate(&channel, auth_options)?
        };
        if let Some(wrapper) = negotiated {
            conn.inner.lock().expect("connection mutex poisoned").security = Some(wrapper);
        }

        Ok(conn)
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.lock().expect("connection mutex poisoned").transport.is_encrypted()
    }

    pub fn cipher_key_bits(&self) -> Option<u32> {
        self.inner.lock().expect("connection mutex poisoned").transport.cipher_key_bits()
    }

    /// Explicit close (§4.7 `CloseReason::Requested`): cancels every outstanding call
    /// and stream, then tears down the transport.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        if guard.closed.is_some() {
            return;
        }
        self.cancel_all(&mut guard, Error::protocol("connection closed by caller"), CloseReason::Requested);
        let _ = guard.transport.close();
    }

    /// Lets an embedder that tracks its own liveness timer declare the peer unresponsive
    /// (§2.2 keepalive). The core does not enforce this on its own (§9 resolved open
    /// question: no per-call timeout).
    pub fn notify_keepalive_timeout(&self) {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        if guard.closed.is_some() {
            return;
        }
        self.cancel_all(&mut guard, Error::protocol("keepalive timeout"), CloseReason::Keepalive);
        let _ = guard.transport.close();
    }

    /// Sends one keepalive MESSAGE frame (§2.2). The server is expected to answer with a
    /// MESSAGE frame of the same procedure, consumed directly by [`Connection::handle_message`]
    /// rather than reaching the event bridge.
    pub fn send_keepalive(&self) -> Result<()> {
        let header = FrameHeader {
            program: REMOTE_PROGRAM.program,
            version: REMOTE_PROGRAM.version,
            procedure: control_procedure::KEEPALIVE,
            message_type: MessageType::Message,
            serial: 0,
            status: Status::Ok,
        };
        let out = frame::encode_frame(&header, &[])?;
        self.submit(out, REMOTE_PROGRAM, control_procedure::KEEPALIVE, 0, false, false, false, None, CallMode::WaitTx)
            .map(|_| ())
    }

    /// Issues a blocking RPC and returns its XDR-encoded result body (§4.5 "Issuing a
    /// call").
    pub fn call(
        &self,
        program_version: ProgramVersion,
        procedure: i32,
        args: Vec<u8>,
        want_reply: bool,
        quiet_missing: bool,
        priority: bool,
    ) -> Result<Vec<u8>> {
        let (serial, out) = {
            let mut guard = self.inner.lock().expect("connection mutex poisoned");
            if let Some(e) = &guard.closed {
                return Err(e.clone());
            }
            let serial = guard.next_serial;
            guard.next_serial = guard.next_serial.wrapping_add(1);
            let header = FrameHeader {
                program: program_version.program,
                version: program_version.version,
                procedure,
                message_type: MessageType::Call,
                serial,
                status: Status::Ok,
            };
            let out = frame::encode_frame(&header, &args)?;
            (serial, out)
        };
        self.submit(
            out,
            program_version,
            procedure,
            serial,
            want_reply,
            quiet_missing,
            priority,
            None,
            CallMode::WaitTx,
        )
    }

    /// Registers a fresh stream bound to `procedure` and allocates its serial (§4.6).
    pub fn open_stream(self: &Arc<Self>, program_version: ProgramVersion, procedure: i32) -> Result<Stream> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        if let Some(e) = &guard.closed {
            return Err(e.clone());
        }
        let serial = guard.next_serial;
        guard.next_serial = guard.next_serial.wrapping_add(1);
        guard.streams.push(StreamState::new(serial, program_version, procedure));
        drop(guard);
        Ok(Stream::new(Arc::clone(self), serial))
    }

    fn stream_identity(&self, serial: u32) -> Result<(ProgramVersion, i32)> {
        let guard = self.inner.lock().expect("connection mutex poisoned");
        if let Some(e) = &guard.closed {
            return Err(e.clone());
        }
        guard
            .streams
            .iter()
            .find(|s| s.serial == serial)
            .map(|s| (s.program_version, s.procedure))
            .ok_or_else(|| Error::protocol("stream no longer registered"))
    }

    pub(crate) fn stream_send(&self, serial: u32, bytes: &[u8]) -> Result<()> {
        let (pv, procedure) = self.stream_identity(serial)?;
        let header = FrameHeader {
            program: pv.program,
            version: pv.version,
            procedure,
            message_type: MessageType::Stream,
            serial,
            status: Status::Continue,
        };
        let out = frame::encode_frame(&header, bytes)?;
        self.submit(out, pv, procedure, serial, false, false, false, Some(serial), CallMode::WaitTx)
            .map(|_| ())
    }

    pub(crate) fn stream_finish(&self, serial: u32) -> Result<()> {
        self.stream_terminate(serial, Status::Ok, &[])
    }

    pub(crate) fn stream_abort(&self, serial: u32) -> Result<()> {
        self.stream_terminate(serial, Status::Error, &[])
    }

    fn stream_terminate(&self, serial: u32, status: Status, body: &[u8]) -> Result<()> {
        let (pv, procedure) = self.stream_identity(serial)?;
        let header = FrameHeader {
            program: pv.program,
            version: pv.version,
            procedure,
            message_type: MessageType::Stream,
            serial,
            status,
        };
        let out = frame::encode_frame(&header, body)?;
        self.submit(out, pv, procedure, serial, true, false, false, Some(serial), CallMode::WaitTx)
            .map(|_| ())
    }

    /// Non-blocking when the inbound buffer is already non-empty; otherwise submits a
    /// pseudo-call satisfied by the read sub-machine (§4.6).
    pub(crate) fn stream_receive(&self, serial: u32, buf: &mut [u8], non_blocking: bool) -> Result<Option<usize>> {
        {
            let mut guard = self.inner.lock().expect("connection mutex poisoned");
            if let Some(e) = &guard.closed {
                return Err(e.clone());
            }
            let idx = guard
                .streams
                .iter()
                .position(|s| s.serial == serial)
                .ok_or_else(|| Error::protocol("stream no longer registered"))?;
            guard.streams[idx].check_error()?;
            if !guard.streams[idx].inbound.is_empty() {
                return Ok(Some(drain_inbound(&mut guard.streams[idx], buf)));
            }
            if guard.streams[idx].finished {
                return Ok(Some(0));
            }
            if non_blocking {
                return Ok(None);
            }
        }

        let (pv, procedure) = self.stream_identity(serial)?;
        self.submit(Vec::new(), pv, procedure, serial, true, false, false, Some(serial), CallMode::WaitRx)?;

        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        let idx = guard
            .streams
            .iter()
            .position(|s| s.serial == serial)
            .ok_or_else(|| Error::protocol("stream no longer registered"))?;
        guard.streams[idx].check_error()?;
        Ok(Some(drain_inbound(&mut guard.streams[idx], buf)))
    }

    pub(crate) fn stream_add_callback(
        &self,
        serial: u32,
        events: IoEvents,
        callback: Box<dyn FnMut(IoEvents) + Send>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        let idx = guard
            .streams
            .iter()
            .position(|s| s.serial == serial)
            .ok_or_else(|| Error::protocol("stream no longer registered"))?;
        if guard.streams[idx].callback.is_some() {
            return Err(Error::InvalidArgument("stream already has a callback registered".into()));
        }
        let timer = self.event_loop.add_timer(None, Box::new(|| {}));
        guard.streams[idx].callback = Some(StreamCallbackState { events, callback, timer });
        self.rearm_stream_timer(&mut guard, idx);
        Ok(())
    }

    pub(crate) fn stream_update_callback(&self, serial: u32, events: IoEvents) -> Result<()> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        let idx = guard
            .streams
            .iter()
            .position(|s| s.serial == serial)
            .ok_or_else(|| Error::protocol("stream no longer registered"))?;
        match guard.streams[idx].callback.as_mut() {
            Some(cb) => cb.events = events,
            None => return Err(Error::InvalidArgument("no callback registered on this stream".into())),
        }
        self.rearm_stream_timer(&mut guard, idx);
        Ok(())
    }

    pub(crate) fn stream_remove_callback(&self, serial: u32) -> Result<()> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        let idx = guard
            .streams
            .iter()
            .position(|s| s.serial == serial)
            .ok_or_else(|| Error::protocol("stream no longer registered"))?;
        if let Some(cb) = guard.streams[idx].callback.take() {
            self.event_loop.remove_timer(cb.timer);
        }
        Ok(())
    }

    fn rearm_stream_timer(&self, guard: &mut MutexGuard<'_, ConnectionInner>, idx: usize) {
        let wants = guard.streams[idx].wants_timer();
        if let Some(cb) = &guard.streams[idx].callback {
            self.event_loop.update_timer(cb.timer, if wants { Some(50) } else { None });
        }
    }

    pub(crate) fn release_stream(&self, serial: u32) {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        if let Some(idx) = guard.streams.iter().position(|s| s.serial == serial) {
            if let Some(cb) = guard.streams[idx].callback.take() {
                self.event_loop.remove_timer(cb.timer);
            }
            guard.streams.remove(idx);
        }
    }

    /// Registers a user callback for `event_id`, issuing the server-side "enable" RPC on
    /// first registration (§4.7).
    pub fn register_event(
        &self,
        event_id: i32,
        object: Option<ObjectHandle>,
        callback: EventCallback,
    ) -> Result<()> {
        let first = {
            let mut guard = self.inner.lock().expect("connection mutex poisoned");
            guard.events.register(event_id, object, callback)
        };
        if first {
            let mut args = Vec::new();
            xdr::write_i32(&mut args, event_id)?;
            self.call(
                REMOTE_PROGRAM,
                control_procedure::CONNECT_DOMAIN_EVENT_REGISTER_ANY,
                args,
                true,
                false,
                false,
            )?;
        }
        Ok(())
    }

    /// Deregisters every callback for `event_id`, issuing the "disable" RPC (§4.7).
    pub fn deregister_event(&self, event_id: i32) -> Result<()> {
        let existed = {
            let mut guard = self.inner.lock().expect("connection mutex poisoned");
            guard.events.deregister(event_id)
        };
        if existed {
            let mut args = Vec::new();
            xdr::write_i32(&mut args, event_id)?;
            self.call(
                REMOTE_PROGRAM,
                control_procedure::CONNECT_DOMAIN_EVENT_DEREGISTER_ANY,
                args,
                true,
                false,
                false,
            )?;
        }
        Ok(())
    }

    /// Installs the connection's single close callback (§4.7, §2.2); fails if one is
    /// already registered.
    pub fn add_close_callback(&self, callback: CloseCallback) -> Result<()> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        if guard.events.set_close_callback(callback) {
            Ok(())
        } else {
            Err(Error::InvalidArgument("a close callback is already registered".into()))
        }
    }

    pub fn remove_close_callback(&self) {
        self.inner.lock().expect("connection mutex poisoned").events.remove_close_callback();
    }

    /// Delivers every queued event to its registered callbacks. Meant to be invoked by
    /// the embedder's event-queue-flush timer (§6.3), outside of any call in progress.
    pub fn flush_events(&self) {
        self.inner.lock().expect("connection mutex poisoned").events.dispatch();
    }

    /// Delivers one pass of a stream's async callback, if its readiness condition holds
    /// (§4.6). Invoked by the embedder's per-stream timer.
    pub fn dispatch_stream_callback(&self, serial: u32) {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        let Some(idx) = guard.streams.iter().position(|s| s.serial == serial) else {
            return;
        };
        if guard.streams[idx].dispatch_in_progress {
            return;
        }
        if !guard.streams[idx].wants_timer() {
            return;
        }
        let Some(mut cb_state) = guard.streams[idx].callback.take() else {
            return;
        };
        let ready = IoEvents::READABLE;
        guard.streams[idx].dispatch_in_progress = true;
        (cb_state.callback)(ready.intersection(cb_state.events));
        guard.streams[idx].dispatch_in_progress = false;
        if let Some(slot) = guard.streams.get_mut(idx) {
            slot.callback = Some(cb_state);
        }
        self.rearm_stream_timer(&mut guard, idx);
    }

    // -- submission / dispatch internals -----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        out: Vec<u8>,
        program_version: ProgramVersion,
        procedure: i32,
        serial: u32,
        want_reply: bool,
        quiet_missing: bool,
        priority: bool,
        stream_wait: Option<u32>,
        start_mode: CallMode,
    ) -> Result<Vec<u8>> {
        let mut guard = self.inner.lock().expect("connection mutex poisoned");
        if let Some(e) = &guard.closed {
            return Err(e.clone());
        }

        let queue_id = guard.next_queue_id;
        guard.next_queue_id = guard.next_queue_id.wrapping_add(1);

        let mut slot = CallSlot::new(queue_id, serial, program_version, procedure, out, want_reply, quiet_missing, priority);
        slot.stream_wait = stream_wait;
        slot.mode = start_mode;
        let condvar = Arc::clone(&slot.condvar);

        let mut dispatcher = guard.wait_queue.is_empty();
        if priority {
            guard.wait_queue.push_front(slot);
        } else {
            guard.wait_queue.push_back(slot);
        }
        if !dispatcher {
            self.wake_dispatcher();
        }

        loop {
            if dispatcher {
                guard = self.run_event_loop(guard, queue_id)?;
                return Self::take_result(&mut guard, queue_id);
            }

            guard = condvar.wait(guard).expect("connection mutex poisoned");
            match guard.wait_queue.iter().find(|s| s.queue_id == queue_id) {
                None => return Err(Error::protocol("call vanished from the wait queue")),
                Some(slot) if slot.is_terminal() => return Self::take_result(&mut guard, queue_id),
                Some(_) => dispatcher = true,
            }
        }
    }

    fn take_result(guard: &mut MutexGuard<'_, ConnectionInner>, queue_id: u64) -> Result<Vec<u8>> {
        let idx = guard
            .wait_queue
            .iter()
            .position(|s| s.queue_id == queue_id)
            .expect("caller's own queue entry must still be present");
        let slot = guard.wait_queue.remove(idx).expect("index just located");
        match slot.mode {
            CallMode::Complete => Ok(slot.result.unwrap_or_default()),
            CallMode::Error => Err(slot.error.expect("Error mode always carries an error")),
            _ => Err(Error::protocol("call removed from queue while still pending")),
        }
    }

    /// Runs the dispatcher's event loop (§4.5) until `my_queue_id`'s entry becomes
    /// terminal, then hands the dispatcher role to the new head (if any) and returns.
    fn run_event_loop<'g>(
        &self,
        mut guard: MutexGuard<'g, ConnectionInner>,
        my_queue_id: u64,
    ) -> Result<MutexGuard<'g, ConnectionInner>> {
        loop {
            let want_read = guard.wait_queue.iter().any(|s| s.mode == CallMode::WaitRx) || !guard.streams.is_empty();
            let want_write = guard.wait_queue.iter().any(|s| s.mode == CallMode::WaitTx);
            let zero_timeout = !guard.decoded_backlog.is_empty();
            let fd = guard.transport.raw_fd();
            drop(guard);

            let outcome = self.poll_once(fd, want_read, want_write, zero_timeout);

            guard = self.inner.lock().expect("connection mutex poisoned");

            match outcome {
                Ok(outcome) => {
                    if outcome.wake {
                        self.drain_wake_pipe();
                    }
                    if outcome.writable {
                        if let Err(e) = self.run_write_submachine(&mut guard) {
                            self.cancel_all(&mut guard, e, CloseReason::Error);
                        }
                    }
                    if guard.closed.is_none() && (outcome.readable || zero_timeout) {
                        if let Err(e) = self.run_read_submachine(&mut guard) {
                            let reason = if xdr::is_eof(&e) { CloseReason::Eof } else { CloseReason::Error };
                            self.cancel_all(&mut guard, e, reason);
                        }
                    }
                    if guard.closed.is_none() && outcome.hup_or_err {
                        self.cancel_all(&mut guard, Error::protocol("transport reported POLLHUP/POLLERR"), CloseReason::Error);
                    }
                }
                Err(e) => self.cancel_all(&mut guard, e, CloseReason::Error),
            }

            // Only notify here; the slot itself stays in the queue until its owning
            // thread wakes, finds it still present, and removes it via `take_result`.
            // Dropping it here instead would race the wake-up: the waiter can't resume
            // `condvar.wait` until this function releases the lock, by which point its
            // slot (and its result) would already be gone.
            for slot in guard.wait_queue.iter() {
                if slot.queue_id != my_queue_id && slot.is_terminal() {
                    slot.condvar.notify_all();
                }
            }

            let my_terminal = guard
                .wait_queue
                .iter()
                .find(|s| s.queue_id == my_queue_id)
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            if my_terminal {
                if let Some(head) = guard.wait_queue.front() {
                    head.condvar.notify_all();
                }
                return Ok(guard);
            }
        }
    }

    fn wake_dispatcher(&self) {
        let _ = nix_write(&self.wake_write, &[0u8]);
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix_read(&self.wake_read, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn poll_once(&self, transport_fd: RawFd, want_read: bool, want_write: bool, zero_timeout: bool) -> Result<PollOutcome> {
        let mut transport_flags = PollFlags::empty();
        if want_read {
            transport_flags |= PollFlags::POLLIN;
        }
        if want_write {
            transport_flags |= PollFlags::POLLOUT;
        }

        let transport_borrowed = unsafe { BorrowedFd::borrow_raw(transport_fd) };
        let wake_borrowed = self.wake_read.as_fd();
        let mut fds = [
            PollFd::new(transport_borrowed, transport_flags),
            PollFd::new(wake_borrowed, PollFlags::POLLIN),
        ];

        let timeout = if zero_timeout { PollTimeout::ZERO } else { PollTimeout::NONE };
        block_sensitive_signals(|| poll(&mut fds, timeout).map_err(Error::from))?;

        let transport_revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        let wake_revents = fds[1].revents().unwrap_or_else(PollFlags::empty);

        Ok(PollOutcome {
            readable: transport_revents.contains(PollFlags::POLLIN),
            writable: transport_revents.contains(PollFlags::POLLOUT),
            hup_or_err: transport_revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR),
            wake: wake_revents.contains(PollFlags::POLLIN),
        })
    }

    /// Finds the head-most `WAIT_TX` call and attempts a single non-blocking write
    /// (§4.5 write sub-machine), routing through the security wrapper if active.
    fn run_write_submachine(&self, guard: &mut ConnectionInner) -> Result<()> {
        let Some(idx) = guard.wait_queue.iter().position(|s| s.mode == CallMode::WaitTx) else {
            return Ok(());
        };

        if guard.security.is_some() {
            let has_pending = guard.security.as_ref().expect("checked Some above").has_pending_ciphertext();
            if !has_pending {
                let remaining_len = {
                    let slot = &guard.wait_queue[idx];
                    (slot.out.len() - slot.offset).min(crate::security::MAX_SASL_CHUNK)
                };
                let slot = &guard.wait_queue[idx];
                let plaintext = slot.out[slot.offset..][..remaining_len].to_vec();
                guard.security.as_mut().expect("checked Some above").stage_plaintext(&plaintext)?;
            }

            let chunk = guard.security.as_ref().expect("checked Some above").pending_chunk().to_vec();
            let chunk_len = chunk.len();
            let written = guard.transport.write_nonblocking(&chunk)?;
            match written {
                None => return Ok(()),
                Some(n) => {
                    guard.security.as_mut().expect("checked Some above").advance(n);
                    let drained = !guard.security.as_ref().expect("checked Some above").has_pending_ciphertext();
                    if n == chunk_len && drained {
                        let slot = &mut guard.wait_queue[idx];
                        let consumed = (slot.out.len() - slot.offset).min(crate::security::MAX_SASL_CHUNK);
                        slot.offset += consumed;
                        if slot.offset >= slot.out.len() {
                            slot.mode = if slot.want_reply { CallMode::WaitRx } else { CallMode::Complete };
                        }
                    }
                }
            }
            return Ok(());
        }

        let to_write = {
            let slot = &guard.wait_queue[idx];
            slot.out[slot.offset..].to_vec()
        };
        let written = guard.transport.write_nonblocking(&to_write)?;
        match written {
            None => Ok(()),
            Some(n) => {
                let slot = &mut guard.wait_queue[idx];
                slot.offset += n;
                if slot.offset >= slot.out.len() {
                    slot.mode = if slot.want_reply { CallMode::WaitRx } else { CallMode::Complete };
                }
                Ok(())
            }
        }
    }

    /// Drains whatever the transport has, decoding through the security wrapper if
    /// active, then assembles and dispatches complete frames (§4.5 read sub-machine).
    fn run_read_submachine(&self, guard: &mut ConnectionInner) -> Result<()> {
        let eof = self.fill_decoded_backlog(guard)?;

        loop {
            if guard.read_filled < 4 && !extend_read_buf(guard, 4) {
                break;
            }
            if guard.read_filled < 4 {
                break;
            }

            let prefix: [u8; 4] = guard.read_buf[..4].try_into().expect("slice is exactly 4 bytes");
            let declared_len = frame::decode_length_prefix(&prefix)? as usize;

            if guard.read_filled < declared_len && !extend_read_buf(guard, declared_len) {
                break;
            }
            if guard.read_filled < declared_len {
                break;
            }

            let frame_bytes = guard.read_buf[4..declared_len].to_vec();
            guard.read_filled = 0;
            self.dispatch_frame(guard, &frame_bytes)?;
        }

        if eof {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )));
        }
        Ok(())
    }

    fn fill_decoded_backlog(&self, guard: &mut ConnectionInner) -> Result<bool> {
        let mut raw = [0u8; 16 * 1024];
        loop {
            match guard.transport.read_nonblocking(&mut raw)? {
                None => return Ok(false),
                Some(0) => return Ok(true),
                Some(n) => {
                    let chunk = &raw[..n];
                    let plaintext = match guard.security.as_mut() {
                        Some(security) => security.decode(chunk)?,
                        None => chunk.to_vec(),
                    };
                    guard.decoded_backlog.extend(plaintext);
                    if n < raw.len() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn dispatch_frame(&self, guard: &mut ConnectionInner, frame_bytes: &[u8]) -> Result<()> {
        let (header, body) = frame::decode_frame(frame_bytes)?;
        match header.message_type {
            MessageType::Reply => self.handle_reply(guard, &header, body),
            MessageType::Message => self.handle_message(guard, &header, body),
            MessageType::Stream => self.handle_stream_frame(guard, &header, body),
            MessageType::Call => Err(Error::protocol("unexpected CALL frame from server")),
        }
    }

    fn handle_reply(&self, guard: &mut ConnectionInner, header: &FrameHeader, body: &[u8]) -> Result<()> {
        let idx = guard
            .wait_queue
            .iter()
            .position(|s| s.serial == header.serial && s.stream_wait.is_none());
        let Some(idx) = idx else {
            debug!("reply for unknown serial {}", header.serial);
            return Ok(());
        };

        {
            let slot = &guard.wait_queue[idx];
            if slot.program_version.program != header.program || slot.program_version.version != header.version {
                return Err(Error::protocol("reply program/version mismatch"));
            }
            if slot.procedure != header.procedure {
                return Err(Error::protocol("reply procedure mismatch"));
            }
        }

        match header.status {
            Status::Ok => {
                let slot = &mut guard.wait_queue[idx];
                slot.result = Some(body.to_vec());
                slot.mode = CallMode::Complete;
            }
            Status::Error => {
                let mut cursor = body;
                let record = xdr::read_error_record(&mut cursor)?;
                let quiet_missing = guard.wait_queue[idx].quiet_missing;
                let slot = &mut guard.wait_queue[idx];
                slot.error = Some(Error::from_rpc_quiet_missing(record, quiet_missing));
                slot.mode = CallMode::Error;
            }
            Status::Continue => return Err(Error::protocol("CONTINUE status on a REPLY frame")),
        }
        Ok(())
    }

    fn handle_message(&self, guard: &mut ConnectionInner, header: &FrameHeader, body: &[u8]) -> Result<()> {
        if header.procedure == control_procedure::KEEPALIVE {
            debug!("keepalive response received");
            guard.keepalive_last_seen = Some(std::time::Instant::now());
            return Ok(());
        }
        match decode_event(header.procedure, body) {
            Ok(event) => guard.events.enqueue(event),
            Err(e) => warn!("dropping bogus event received during dispatch: {e}"),
        }
        Ok(())
    }

    fn handle_stream_frame(&self, guard: &mut ConnectionInner, header: &FrameHeader, body: &[u8]) -> Result<()> {
        let Some(stream_idx) = guard.streams.iter().position(|s| s.serial == header.serial) else {
            debug!("stream frame for unknown stream serial {}", header.serial);
            return Ok(());
        };

        match header.status {
            Status::Continue => {
                guard.streams[stream_idx].inbound.extend(body.iter().copied());
                if let Some(idx) = guard
                    .wait_queue
                    .iter()
                    .position(|s| s.is_stream_receive_wait(header.serial))
                {
                    guard.wait_queue[idx].mode = CallMode::Complete;
                }
            }
            Status::Ok => {
                if let Some(idx) = guard.wait_queue.iter().position(|s| {
                    s.stream_wait == Some(header.serial) && !s.is_stream_receive_wait(header.serial)
                }) {
                    guard.wait_queue[idx].mode = CallMode::Complete;
                } else {
                    guard.streams[stream_idx].finished = true;
                }
            }
            Status::Error => {
                let mut r = body;
                let record = xdr::read_error_record(&mut r)?;
                let error = Error::Rpc(record);
                if let Some(idx) = guard.wait_queue.iter().position(|s| {
                    s.stream_wait == Some(header.serial) && !s.is_stream_receive_wait(header.serial)
                }) {
                    guard.wait_queue[idx].error = Some(error);
                    guard.wait_queue[idx].mode = CallMode::Error;
                } else if guard.streams[stream_idx].error.is_none() {
                    guard.streams[stream_idx].error = Some(error);
                } else {
                    return Err(Error::protocol("duplicate async stream error"));
                }
            }
        }
        Ok(())
    }

    fn cancel_all(&self, guard: &mut ConnectionInner, cause: Error, reason: CloseReason) {
        error!("connection failing: {cause}");
        let sticky = Error::connection_lost(&cause);
        for slot in guard.wait_queue.iter_mut() {
            if !slot.is_terminal() {
                slot.error = Some(sticky.clone());
                slot.mode = CallMode::Error;
            }
        }
        for stream in guard.streams.iter_mut() {
            if stream.error.is_none() && !stream.finished {
                stream.error = Some(sticky.clone());
            }
        }
        guard.closed = Some(sticky);
        guard.events.fire_close(reason);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain_inbound(stream: &mut StreamState, buf: &mut [u8]) -> usize {
    let n = buf.len().min(stream.inbound.len());
    for slot in buf.iter_mut().take(n) {
        *slot = stream.inbound.pop_front().expect("checked length above");
    }
    n
}

fn extend_read_buf(guard: &mut ConnectionInner, target: usize) -> bool {
    let need = target - guard.read_filled;
    let take = need.min(guard.decoded_backlog.len());
    if take == 0 {
        return false;
    }
    let at = guard.read_filled;
    for i in 0..take {
        guard.read_buf[at + i] = guard.decoded_backlog.pop_front().expect("checked length above");
    }
    guard.read_filled += take;
    true
}

struct PollOutcome {
    readable: bool,
    writable: bool,
    hup_or_err: bool,
    wake: bool,
}

/// §4.5: "block sensitive signals (window-change, child, pipe) around the poll to avoid
/// interrupt storms. On platforms where signal masking is unavailable, skip this step."
fn block_sensitive_signals<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGWINCH);
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGPIPE);
    let mut old = SigSet::empty();
    let masked = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut old)).is_ok();

    let result = f();

    if masked {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
    }
    result
}

fn decode_event(procedure: i32, body: &[u8]) -> Result<Event> {
    let mut r = body;
    match procedure {
        control_procedure::EVENT_LIFECYCLE => {
            let object = xdr::read_bytes(&mut r)?;
            let event = xdr::read_i32(&mut r)?;
            let detail = xdr::read_i32(&mut r)?;
            Ok(Event::Lifecycle { object, event, detail })
        }
        control_procedure::EVENT_REBOOT => {
            let object = xdr::read_bytes(&mut r)?;
            Ok(Event::Reboot { object })
        }
        control_procedure::EVENT_RTC_CHANGE => {
            let object = xdr::read_bytes(&mut r)?;
            let offset = xdr::read_i32(&mut r)? as i64;
            Ok(Event::RtcChange { object, offset })
        }
        control_procedure::EVENT_WATCHDOG => {
            let object = xdr::read_bytes(&mut r)?;
            let action = xdr::read_i32(&mut r)?;
            Ok(Event::Watchdog { object, action })
        }
        control_procedure::EVENT_IO_ERROR => {
            let object = xdr::read_bytes(&mut r)?;
            let src_path = xdr::read_string(&mut r)?;
            let dev_alias = xdr::read_string(&mut r)?;
            let action = xdr::read_i32(&mut r)?;
            let reason = xdr::read_optional_string(&mut r)?;
            Ok(Event::IoError {
                object,
                src_path,
                dev_alias,
                action,
                reason,
            })
        }
        control_procedure::EVENT_GRAPHICS => {
            let object = xdr::read_bytes(&mut r)?;
            let phase = xdr::read_i32(&mut r)?;
            let local = xdr::read_string(&mut r)?;
            let remote = xdr::read_string(&mut r)?;
            let auth_scheme = xdr::read_string(&mut r)?;
            Ok(Event::GraphicsSession {
                object,
                phase,
                local,
                remote,
                auth_scheme,
            })
        }
        other => Err(Error::protocol(format!("unrecognized event procedure {other}"))),
    }
}

fn build_transport(spec: &ConnectSpec, env: &EnvConfig) -> Result<Box<dyn Transport>> {
    match &spec.transport {
        TransportSpec::Tls { host, port, no_verify, pki_path } => {
            let credentials = match pki_path {
                Some(dir) => TlsCredentials::load_from_pkipath(dir, *no_verify)?,
                None => return Err(Error::InvalidArgument("TLS transport requires pkipath".into())),
            };
            Ok(Box::new(TlsTransport::connect(host, *port, &credentials)?))
        }
        TransportSpec::Tcp { host, port } => Ok(Box::new(TcpTransport::connect(host, *port)?)),
        TransportSpec::Unix { path, auto_start } => {
            if *auto_start && env.auto_start {
                let daemon_path = env
                    .daemon_path
                    .clone()
                    .ok_or_else(|| Error::protocol("AUTO_START requested but DAEMON_PATH is unset"))?;
                Ok(Box::new(UnixTransport::connect_with_autospawn(
                    path,
                    &daemon_path,
                    &[],
                    AutoSpawnBackoff::default(),
                )?))
            } else {
                Ok(Box::new(UnixTransport::connect(path)?))
            }
        }
        TransportSpec::Tunnel { command, args } => Ok(Box::new(TunnelTransport::spawn(command, args)?)),
    }
}

struct ConnAuthChannel<'a> {
    conn: &'a Connection,
}

impl AuthChannelTrait for ConnAuthChannel<'_> {
    fn call(&self, procedure: i32, args: Vec<u8>, quiet_missing: bool) -> Result<Option<Vec<u8>>> {
        match self.conn.call(REMOTE_PROGRAM, procedure, args, true, quiet_missing, false) {
            Ok(body) => Ok(Some(body)),
            Err(Error::Unsupported(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_encrypted(&self) -> bool {
        self.conn.is_encrypted()
    }

    fn cipher_key_bits(&self) -> Option<u32> {
        self.conn.cipher_key_bits()
    }
}
