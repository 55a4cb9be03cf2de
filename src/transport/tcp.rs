// SPDX-License-Identifier: BSD-3-Clause

//! Raw TCP transport (§4.2): resolves and connects, disables Nagle, no handshake.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;

use crate::error::{Error, Result};
use crate::transport::{classify_io_result, set_nonblocking, Transport};

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(Error::from)?
            .next()
            .ok_or_else(|| Error::protocol(format!("no address found for {host}:{port}")))?;

        debug!("connecting raw TCP to {addr}");
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        set_nonblocking(stream.as_raw_fd())?;
        Ok(TcpTransport { stream })
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        set_nonblocking(stream.as_raw_fd())?;
        Ok(TcpTransport { stream })
    }

    pub(crate) fn inner(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn inner_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl Transport for TcpTransport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        classify_io_result(self.stream.read(buf))
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> Result<Option<usize>> {
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
        self.stream
            .local_addr()
            .map(|a| format!("{};{}", a.ip(), a.port()))
            .unwrap_or_else(|_| "unknown;0".to_string())
    }

    fn peer_endpoint(&self) -> String {
        self.stream
            .peer_addr()
            .map(|a| format!("{};{}", a.ip(), a.port()))
            .unwrap_or_else(|_| "unknown;0".to_string())
    }
}
