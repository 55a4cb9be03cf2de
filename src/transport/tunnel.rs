// SPDX-License-Identifier: BSD-3-Clause

//! Tunneled subprocess transport (§4.2): spawn an external launcher (e.g. a remote-shell
//! client) with stdin/stdout wired to one end of a socket pair, stderr to a pipe, and use
//! the other end of the socket pair as the transport. Deciding which command and
//! arguments to run is external (§1 non-goals); this module only does the spawning and
//! plumbing once a command line is known.

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};

use log::debug;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::pipe;

use crate::error::Result;
use crate::transport::{classify_io_result, set_nonblocking, Transport};

pub struct TunnelTransport {
    stream: UnixStream,
    child: Child,
    /// Read end of the child's stderr pipe, surfaced for diagnostics (the original logs
    /// the launcher's stderr on failure).
    stderr: OwnedFd,
}

impl TunnelTransport {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self> {
        debug!("spawning tunnel transport: {command} {args:?}");

        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        let (stderr_read, stderr_write) = pipe()?;

        let child_stdout = theirs.try_clone().map_err(crate::error::Error::from)?;
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::from(theirs))
            .stdout(Stdio::from(child_stdout))
            .stderr(Stdio::from(stderr_write))
            .spawn()?;

        let stream = UnixStream::from(ours);
        set_nonblocking(stream.as_raw_fd())?;

        Ok(TunnelTransport {
            stream,
            child,
            stderr: stderr_read,
        })
    }

    /// Reads whatever the launcher has written to stderr so far, for error messages.
    pub fn drain_stderr(&mut self) -> String {
        let mut buf = String::new();
        let mut f = std::fs::File::from(
            self.stderr
                .try_clone()
                .expect("stderr pipe fd should remain valid for the tunnel's lifetime"),
        );
        let _ = f.read_to_string(&mut buf);
        buf
    }
}

impl Transport for TunnelTransport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        use std::io::Read as _;
        classify_io_result(self.stream.read(buf))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        use std::io::Write;
        classify_io_result(self.stream.write(buf))
    }

    fn close(&mut self) -> Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both).ok();
        let _ = self.child.kill();
        let _ = self.child.wait();
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn local_endpoint(&self) -> String {
        "tunnel;0".to_string()
    }

    fn peer_endpoint(&self) -> String {
        "tunnel;0".to_string()
    }
}
