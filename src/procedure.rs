// SPDX-License-Identifier: BSD-3-Clause

//! The procedure catalog itself — argument/result record shapes for the hundreds of
//! management RPCs — is an external, code-generated concern (§1 non-goals): the core
//! treats every procedure as an opaque `(program, version, procedure, encoder, decoder)`
//! tuple. This module defines that contract plus the handful of control-plane procedure
//! numbers the authenticator, keepalive driver, and event bridge must invoke directly in
//! order to function at all.

use crate::error::Result;

/// Identifies which RPC program/version pair a [`crate::call::Call`] belongs to. Two
/// programs share one wire: the general control plane and a hypervisor-specific
/// sub-protocol (§9 "Two RPC programs on one connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramVersion {
    pub program: u32,
    pub version: u32,
}

/// The general-purpose control-plane program: auth negotiation, keepalive, event
/// enable/disable, and connection-lifecycle procedures live here.
pub const REMOTE_PROGRAM: ProgramVersion = ProgramVersion {
    program: 0x20008086,
    version: 1,
};

/// Reserved control-plane procedure numbers. The full catalog (domain/network/storage
/// management calls) is supplied externally; these are the ones the core itself drives.
pub mod control_procedure {
    /// Lists the authentication methods the server offers (§4.4 step 1). Treated as
    /// "no auth required" when the server doesn't implement it (quiet-missing).
    pub const AUTH_LIST: i32 = 66;
    /// Initiates a SASL negotiation, returning the server's supported mechanisms.
    pub const AUTH_SASL_INIT: i32 = 67;
    /// One round of SASL client/server data exchange.
    pub const AUTH_SASL_STEP: i32 = 68;
    /// One-shot external policy check (e.g. polkit) authentication method.
    pub const AUTH_POLKIT: i32 = 69;
    /// Keepalive request; the server is expected to reply with the same procedure number
    /// and no body (§2.2).
    pub const KEEPALIVE: i32 = 70;
    /// Enables delivery of a typed event for a given event id (§4.7).
    pub const CONNECT_DOMAIN_EVENT_REGISTER_ANY: i32 = 71;
    /// Disables delivery of a typed event for a given event id (§4.7).
    pub const CONNECT_DOMAIN_EVENT_DEREGISTER_ANY: i32 = 72;

    /// MESSAGE-frame procedure numbers identifying each typed event (§4.7).
    pub const EVENT_LIFECYCLE: i32 = 100;
    pub const EVENT_REBOOT: i32 = 101;
    pub const EVENT_RTC_CHANGE: i32 = 102;
    pub const EVENT_WATCHDOG: i32 = 103;
    pub const EVENT_IO_ERROR: i32 = 104;
    pub const EVENT_GRAPHICS: i32 = 105;
}

/// Implemented by any type that can be encoded as the argument or result body of an RPC
/// call. The core's generic `encode`/`decode` boundary (§1 non-goal: the catalog itself).
pub trait Encode {
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Implemented by any type that can be decoded from the body of an RPC reply.
pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// The unit type is used for procedures that take no arguments, or return no result
/// beyond "it succeeded" (e.g. `finish`/`abort` stream packets, keepalive, enable/disable
/// event RPCs).
impl Encode for () {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

impl Decode for () {
    fn decode(_bytes: &[u8]) -> Result<Self> {
        Ok(())
    }
}

/// Raw, already-encoded bytes, used when a caller has its own generated encoder/decoder
/// and just wants the multiplexer to move bytes.
#[derive(Debug, Clone, Default)]
pub struct Raw(pub Vec<u8>);

impl Encode for Raw {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

impl Decode for Raw {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Raw(bytes.to_vec()))
    }
}
