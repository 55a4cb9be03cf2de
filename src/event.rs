// SPDX-License-Identifier: BSD-3-Clause

//! Asynchronous event demultiplexing (§4.7): typed notifications demarshalled from
//! MESSAGE frames, queued, and fanned out to user callbacks keyed by (object handle,
//! event id) once the event-queue timer fires. Close callbacks (§2.2) share the same
//! single-slot registration/dispatch discipline.

use std::collections::{HashMap, VecDeque};

use crate::eventloop::TimerId;

/// Opaque identity of the remote object (domain, network, storage pool, ...) an event
/// concerns. The object-identity marshal itself is external (§1 non-goal); this is just
/// its wire form as carried inside a MESSAGE body.
pub type ObjectHandle = Vec<u8>;

/// A typed asynchronous notification (§4.7).
#[derive(Debug, Clone)]
pub enum Event {
    Lifecycle {
        object: ObjectHandle,
        event: i32,
        detail: i32,
    },
    Reboot {
        object: ObjectHandle,
    },
    RtcChange {
        object: ObjectHandle,
        offset: i64,
    },
    Watchdog {
        object: ObjectHandle,
        action: i32,
    },
    IoError {
        object: ObjectHandle,
        src_path: String,
        dev_alias: String,
        action: i32,
        reason: Option<String>,
    },
    GraphicsSession {
        object: ObjectHandle,
        phase: i32,
        local: String,
        remote: String,
        auth_scheme: String,
    },
}

impl Event {
    /// The registration id this event fans out under (§4.7: "enable events for id").
    pub fn event_id(&self) -> i32 {
        match self {
            Event::Lifecycle { .. } => 0,
            Event::Reboot { .. } => 1,
            Event::RtcChange { .. } => 2,
            Event::Watchdog { .. } => 3,
            Event::IoError { .. } => 4,
            Event::GraphicsSession { .. } => 5,
        }
    }

    pub fn object(&self) -> &ObjectHandle {
        match self {
            Event::Lifecycle { object, .. }
            | Event::Reboot { object }
            | Event::RtcChange { object, .. }
            | Event::Watchdog { object, .. }
            | Event::IoError { object, .. }
            | Event::GraphicsSession { object, .. } => object,
        }
    }
}

pub type EventCallback = Box<dyn FnMut(&Event) + Send>;

/// One registered callback, optionally scoped to a single object handle (`None` means
/// every object with this event id, §4.7).
struct Registration {
    object: Option<ObjectHandle>,
    callback: EventCallback,
}

/// Reason a registered close callback fires (§2.2, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller explicitly closed the connection.
    Requested,
    /// A transport error (POLLERR, or a failed read/write) killed the connection.
    Error,
    /// The peer performed a clean shutdown (a zero-length read).
    Eof,
    /// The keepalive driver (§2.2) gave up waiting for a response.
    Keepalive,
}

pub type CloseCallback = Box<dyn FnMut(CloseReason) + Send>;

/// The connection's event state (§4.7): a pending queue plus per-event-id registrations,
/// and the single close-callback slot that shares this machinery.
#[derive(Default)]
pub(crate) struct EventBridge {
    queue: VecDeque<Event>,
    registrations: HashMap<i32, Vec<Registration>>,
    close_callback: Option<CloseCallback>,
    /// Timer used to flush `queue` to registered callbacks outside of frame processing
    /// (§6.3: "one timer for the event-queue flush").
    pub timer: Option<TimerId>,
}

impl EventBridge {
    pub fn enqueue(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Registers a callback for `event_id`. Returns `true` if this was the first
    /// registration for that id, meaning the caller must issue the server-side "enable"
    /// RPC (§4.7).
    pub fn register(
        &mut self,
        event_id: i32,
        object: Option<ObjectHandle>,
        callback: EventCallback,
    ) -> bool {
        let list = self.registrations.entry(event_id).or_default();
        let was_empty = list.is_empty();
        list.push(Registration { object, callback });
        was_empty
    }

    /// Drops every callback registered for `event_id`. Returns `true` if any existed,
    /// meaning the caller must issue the "disable" RPC (§4.7).
    pub fn deregister(&mut self, event_id: i32) -> bool {
        self.registrations
            .remove(&event_id)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    /// Delivers every queued event to matching callbacks, then clears the queue. Meant
    /// to run with the connection mutex released (§4.6 "during dispatch...").
    pub fn dispatch(&mut self) {
        let pending: Vec<Event> = self.queue.drain(..).collect();
        for event in pending {
            if let Some(list) = self.registrations.get_mut(&event.event_id()) {
                for reg in list.iter_mut() {
                    let matches = match &reg.object {
                        None => true,
                        Some(handle) => handle == event.object(),
                    };
                    if matches {
                        (reg.callback)(&event);
                    }
                }
            }
        }
    }

    /// Installs the connection's one close callback. Fails if one is already registered
    /// (the original allows exactly one per connection, §4.7).
    pub fn set_close_callback(&mut self, cb: CloseCallback) -> bool {
        if self.close_callback.is_some() {
            return false;
        }
        self.close_callback = Some(cb);
        true
    }

    pub fn remove_close_callback(&mut self) {
        self.close_callback = None;
    }

    /// Invokes and clears the close callback, if any (§4.7: "invoked once... then
    /// automatically cleared").
    pub fn fire_close(&mut self, reason: CloseReason) {
        if let Some(mut cb) = self.close_callback.take() {
            cb(reason);
        }
    }
}
