// SPDX-License-Identifier: BSD-3-Clause

//! The transport layer (§4.2): four variants behind one `read`/`write`/`close` interface.
//!
//! The source's C convention returns `0` from a non-blocking `read`/`write` to mean
//! "would block" and a negative count to mean "error", with EOF folded into the `0`
//! case too. That convention doesn't translate to idiomatic Rust, where `WouldBlock` is
//! its own `io::ErrorKind` and `Ok(0)` unambiguously means EOF. [`Transport::read_nonblocking`]
//! and [`Transport::write_nonblocking`] instead return `Ok(None)` for would-block and
//! `Ok(Some(n))` for `n` bytes transferred (`n == 0` is EOF on a read); the multiplexer's
//! read/write sub-machines (§4.5) key off that `Option` rather than a sentinel integer.

pub mod tcp;
pub mod tls;
pub mod tunnel;
pub mod unix;

use std::os::unix::io::RawFd;

use crate::error::Result;

/// A byte-stream transport: secure TCP, raw TCP, a local socket, or a tunneled
/// subprocess pipe pair (§4.2). All four variants present this one interface to the
/// multiplexer.
pub trait Transport: Send {
    /// Attempts to read into `buf` without blocking. `Ok(None)` means no data is
    /// currently available; `Ok(Some(0))` means the peer closed the connection;
    /// `Ok(Some(n))`, `n > 0`, means `n` bytes were read.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Attempts to write `buf` without blocking. `Ok(None)` means the write would
    /// block; `Ok(Some(n))` means `n` bytes were accepted.
    fn write_nonblocking(&mut self, buf: &[u8]) -> Result<Option<usize>>;

    fn close(&mut self) -> Result<()>;

    /// The file descriptor to `poll()` for readability/writability (§4.5 event loop).
    fn raw_fd(&self) -> RawFd;

    /// Human-readable "host;port" style endpoint strings, used to bind a SASL client
    /// context to the connection's local/remote addresses (§4.4).
    fn local_endpoint(&self) -> String;
    fn peer_endpoint(&self) -> String;

    /// True for transports that already provide confidentiality (TLS), used to relax
    /// the SASL security-strength-factor negotiation (§4.4).
    fn is_encrypted(&self) -> bool {
        false
    }

    /// The negotiated cipher key size in bits, when [`Transport::is_encrypted`] is true;
    /// exported to the authenticator as the "external security factor" (§4.4, GLOSSARY).
    fn cipher_key_bits(&self) -> Option<u32> {
        None
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Translates a `std::io` non-blocking read/write result into the `Option<usize>`
/// convention described above.
pub(crate) fn classify_io_result(res: std::io::Result<usize>) -> Result<Option<usize>> {
    match res {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}
