// SPDX-License-Identifier: BSD-3-Clause

//! The per-call state machine (§3 "Call").

use std::sync::Arc;
use std::sync::Condvar;

use crate::error::Error;
use crate::procedure::ProgramVersion;

/// A Call's lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Outbound bytes not yet fully written.
    WaitTx,
    /// Outbound bytes fully written; waiting for a REPLY (or paired STREAM frame).
    WaitRx,
    /// Terminal: result is ready.
    Complete,
    /// Terminal: `error` is set.
    Error,
}

/// One outstanding request, linked into the connection's FIFO wait queue (§3, §4.5).
///
/// Every mutable field here is only ever touched while the owning [`crate::connection::Connection`]'s
/// single mutex is held; `condvar` is the exception — cloned out by the issuing thread
/// before it enters the wait loop so it can be used across a `Mutex::lock` + `Condvar::wait`
/// cycle without fighting the borrow checker over a guard it is about to consume.
pub(crate) struct CallSlot {
    /// Identifies this entry within the connection's wait queue. Distinct from `serial`:
    /// several stream pseudo-calls (send/receive/finish/abort) share one wire `serial`
    /// across the stream's lifetime, so a separate monotonic id is needed to address a
    /// particular queue entry unambiguously.
    pub queue_id: u64,
    pub serial: u32,
    pub program_version: ProgramVersion,
    pub procedure: i32,
    /// Full outbound frame bytes (length prefix + header + body), offset tracks how much
    /// has been written so far.
    pub out: Vec<u8>,
    pub offset: usize,
    pub want_reply: bool,
    /// §7/§8: "no such procedure" replies are turned into [`Error::Unsupported`] instead
    /// of a hard error when this is set.
    pub quiet_missing: bool,
    /// §2.2: jumps the wait queue ahead of ordinary calls on insertion.
    pub priority: bool,
    pub mode: CallMode,
    pub result: Option<Vec<u8>>,
    pub error: Option<Error>,
    pub condvar: Arc<Condvar>,
    /// Set when this Call is a stream's synchronous `receive()` pseudo-call (§4.6):
    /// identifies the stream serial it is waiting on rather than expecting a REPLY.
    pub stream_wait: Option<u32>,
}

impl CallSlot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_id: u64,
        serial: u32,
        program_version: ProgramVersion,
        procedure: i32,
        out: Vec<u8>,
        want_reply: bool,
        quiet_missing: bool,
        priority: bool,
    ) -> Self {
        CallSlot {
            queue_id,
            serial,
            program_version,
            procedure,
            out,
            offset: 0,
            want_reply,
            quiet_missing,
            priority,
            mode: CallMode::WaitTx,
            result: None,
            error: None,
            condvar: Arc::new(Condvar::new()),
            stream_wait: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.mode, CallMode::Complete | CallMode::Error)
    }

    /// True for a stream's synchronous `receive()` pseudo-call: it waits on STREAM frames
    /// for `serial` but (unlike `finish`/`abort`) never transmits anything itself.
    pub fn is_stream_receive_wait(&self, serial: u32) -> bool {
        self.stream_wait == Some(serial) && self.out.is_empty()
    }
}
