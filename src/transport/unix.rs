// SPDX-License-Identifier: BSD-3-Clause

//! Local-socket transport (§4.2): a filesystem path, or an abstract Linux namespace
//! address when the path starts with `@`. Optionally auto-spawns the daemon on refused
//! connections, with bounded retries and linear back-off.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use log::{debug, warn};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use crate::config::AutoSpawnBackoff;
use crate::error::{Error, Result};
use crate::transport::{classify_io_result, set_nonblocking, Transport};

pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    pub fn connect(path: &str) -> Result<Self> {
        let addr = make_addr(path)?;
        let fd = raw_connect(&addr)?;
        let stream = UnixStream::from(fd);
        set_nonblocking(stream.as_raw_fd())?;
        Ok(UnixTransport { stream })
    }

    /// Connects, retrying with an auto-spawned daemon on refusal, per §4.2 and §6.4
    /// (`AUTO_START`/`DAEMON_PATH`).
    pub fn connect_with_autospawn(
        path: &str,
        daemon_path: &Path,
        daemon_args: &[String],
        backoff: AutoSpawnBackoff,
    ) -> Result<Self> {
        match Self::connect(path) {
            Ok(t) => Ok(t),
            Err(Error::Transport(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!("local socket {path} refused, attempting daemon auto-spawn");
                spawn_daemon(daemon_path, daemon_args)?;
                retry_connect(path, backoff)
            }
            Err(e) => Err(e),
        }
    }
}

fn make_addr(path: &str) -> Result<UnixAddr> {
    if let Some(rest) = path.strip_prefix('@') {
        // Abstract namespace address: leading byte is NUL rather than '@' (§4.2).
        UnixAddr::new_abstract(rest.as_bytes())
            .map_err(|e| Error::protocol(format!("invalid abstract socket address: {e}")))
    } else {
        UnixAddr::new(path).map_err(|e| Error::protocol(format!("invalid socket path: {e}")))
    }
}

fn raw_connect(addr: &UnixAddr) -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    connect(fd.as_raw_fd(), addr)?;
    Ok(fd)
}

fn retry_connect(path: &str, backoff: AutoSpawnBackoff) -> Result<UnixTransport> {
    let mut last_err = None;
    for attempt in 0..backoff.max_attempts {
        thread::sleep(backoff.delay_for_attempt(attempt));
        match UnixTransport::connect(path) {
            Ok(t) => return Ok(t),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::protocol("daemon auto-spawn retries exhausted")))
}

fn spawn_daemon(daemon_path: &Path, args: &[String]) -> Result<()> {
    debug!("auto-spawning daemon at {}", daemon_path.display());
    Command::new(daemon_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            warn!("failed to auto-spawn daemon: {e}");
            Error::from(e)
        })?;
    Ok(())
}

impl Transport for UnixTransport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        use std::io::Read;
        classify_io_result(self.stream.read(buf))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        use std::io::Write;
        classify_io_result(self.stream.write(buf))
    }

    fn close(&mut self) -> Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both).ok();
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn local_endpoint(&self) -> String {
        "local;0".to_string()
    }

    fn peer_endpoint(&self) -> String {
        "local;0".to_string()
    }
}
