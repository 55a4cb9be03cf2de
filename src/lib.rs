// SPDX-License-Identifier: BSD-3-Clause

//! Client-side core of a multiplexed RPC transport for remote virtualization management:
//! transport establishment and authentication, the request multiplexer ("pass the buck"
//! dispatch), in-band streams, and the asynchronous event bridge.
//!
//! The RPC procedure catalog itself — argument/result record shapes for the hundreds of
//! management calls — is supplied externally as opaque `(program, version, procedure)`
//! tuples (§1 non-goals); this crate only moves bytes and drives the wire protocol that
//! carries them.

pub mod auth;
pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod eventloop;
pub mod frame;
pub mod procedure;
pub mod security;
pub mod stream;
pub mod transport;
pub mod xdr;

pub use config::{AutoSpawnBackoff, ConnectSpec, EnvConfig, TransportSpec};
pub use connection::Connection;
pub use error::{Error, ErrorRecord, Result};
pub use event::{CloseCallback, CloseReason, Event, EventCallback, ObjectHandle};
pub use eventloop::{EventLoop, IoEvents, NullEventLoop, TimerId, WatchId};
pub use procedure::{Decode, Encode, ProgramVersion, Raw, REMOTE_PROGRAM};
pub use stream::Stream;

use std::sync::Arc;

use auth::AuthOptions;

/// Establishes a connection per `spec` and drives authentication to completion (§4.4).
/// A thin facade over [`Connection::open`] for callers that don't need to name the type
/// directly.
pub fn open(
    spec: ConnectSpec,
    auth_options: AuthOptions,
    event_loop: Arc<dyn EventLoop>,
) -> Result<Arc<Connection>> {
    Connection::open(spec, auth_options, event_loop)
}
