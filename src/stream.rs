// SPDX-License-Identifier: BSD-3-Clause

//! In-band byte streams (§4.6): STREAM-type frames multiplexed on the same connection as
//! ordinary calls, with non-blocking reads and an optional callback-driven async mode.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::eventloop::{IoEvents, TimerId};
use crate::procedure::ProgramVersion;

/// Internal per-stream state, owned by the connection's single mutex alongside the wait
/// queue (§4.5, §4.6) — never accessed outside it.
pub(crate) struct StreamState {
    pub serial: u32,
    pub program_version: ProgramVersion,
    pub procedure: i32,
    pub inbound: VecDeque<u8>,
    pub finished: bool,
    pub error: Option<Error>,
    pub callback: Option<StreamCallbackState>,
    /// Guards against freeing the callback closure while it is itself re-entering stream
    /// operations (§9 "Cyclic self-reference in stream callbacks").
    pub dispatch_in_progress: bool,
}

pub(crate) struct StreamCallbackState {
    pub events: IoEvents,
    pub callback: Box<dyn FnMut(IoEvents) + Send>,
    pub timer: TimerId,
}

impl StreamState {
    pub fn new(serial: u32, program_version: ProgramVersion, procedure: i32) -> Self {
        StreamState {
            serial,
            program_version,
            procedure,
            inbound: VecDeque::new(),
            finished: false,
            error: None,
            callback: None,
            dispatch_in_progress: false,
        }
    }

    pub fn check_error(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Whether the callback timer should currently be armed (§4.6: "fires whenever either
    /// inbound-non-empty-and-readable-requested or writable-requested").
    pub fn wants_timer(&self) -> bool {
        match &self.callback {
            None => false,
            Some(cb) => {
                (cb.events.contains(IoEvents::READABLE) && !self.inbound.is_empty())
                    || cb.events.contains(IoEvents::WRITABLE)
            }
        }
    }
}

/// Handle to an in-band stream (§4.6). Dropping the last handle releases its registry
/// entry; any registered callback is detached first.
pub struct Stream {
    conn: Arc<Connection>,
    serial: u32,
}

impl Stream {
    pub(crate) fn new(conn: Arc<Connection>, serial: u32) -> Self {
        Stream { conn, serial }
    }

    /// Encodes one CONTINUE packet and submits it, waiting only for transmission — no
    /// reply is expected (§4.6).
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.conn.stream_send(self.serial, bytes)
    }

    /// Non-blocking when the inbound buffer already has bytes; otherwise submits a
    /// pseudo-call that blocks until the read sub-machine satisfies it. Returns `Ok(None)`
    /// only when `non_blocking` is requested and nothing is buffered.
    pub fn receive(&self, buf: &mut [u8], non_blocking: bool) -> Result<Option<usize>> {
        self.conn.stream_receive(self.serial, buf, non_blocking)
    }

    /// Sends one OK packet with `want_reply=true` and waits for server confirmation.
    pub fn finish(&self) -> Result<()> {
        self.conn.stream_finish(self.serial)
    }

    /// Sends one ERROR packet with `want_reply=true` and waits for acknowledgement.
    pub fn abort(&self) -> Result<()> {
        self.conn.stream_abort(self.serial)
    }

    /// Registers a single async callback; a second registration fails (§4.6).
    pub fn add_callback(
        &self,
        events: IoEvents,
        callback: Box<dyn FnMut(IoEvents) + Send>,
    ) -> Result<()> {
        self.conn.stream_add_callback(self.serial, events, callback)
    }

    pub fn update_callback(&self, events: IoEvents) -> Result<()> {
        self.conn.stream_update_callback(self.serial, events)
    }

    pub fn remove_callback(&self) -> Result<()> {
        self.conn.stream_remove_callback(self.serial)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.conn.release_stream(self.serial);
    }
}
