// SPDX-License-Identifier: BSD-3-Clause

//! TLS transport (§4.2): TCP connect, then a TLS handshake using a preloaded credential
//! pair, verifying the peer certificate and expecting a single `0x01` acceptance byte
//! from the server once the handshake completes.
//!
//! §9 "Global mutable state": the source keeps a process-wide TLS credential store
//! initialized once. Here that becomes [`global_client_config`], a lazily built
//! `Arc<rustls::ClientConfig>` shared by every [`TlsTransport`] in the process, with an
//! explicit [`shutdown`] rather than relying on drop order at process exit.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{Error, Result};
use crate::transport::{set_nonblocking, Transport};

/// A preloaded client credential pair plus the CA used to verify the peer (§4.2, §6.2
/// `pkipath`). Discovering these files on disk is the excluded, external concern; this
/// crate only consumes already-read PEM bytes.
#[derive(Clone)]
pub struct TlsCredentials {
    pub ca_cert_pem: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
    /// §6.2 `no_verify`: skip peer certificate verification entirely. Only ever set by
    /// an explicit, external opt-in — never defaulted on.
    pub no_verify: bool,
}

impl TlsCredentials {
    /// Loads `cacert.pem`, `clientcert.pem`, `clientkey.pem` from `dir` (§6.2 `pkipath`).
    pub fn load_from_pkipath(dir: &std::path::Path, no_verify: bool) -> Result<Self> {
        let read = |name: &str| -> Result<Vec<u8>> {
            std::fs::read(dir.join(name)).map_err(Error::from)
        };
        Ok(TlsCredentials {
            ca_cert_pem: read("cacert.pem")?,
            client_cert_pem: read("clientcert.pem")?,
            client_key_pem: read("clientkey.pem")?,
            no_verify,
        })
    }
}

static GLOBAL_CONFIG: OnceLock<Mutex<Option<(Arc<ClientConfig>, Arc<ClientConfig>)>>> =
    OnceLock::new();

fn store() -> &'static Mutex<Option<(Arc<ClientConfig>, Arc<ClientConfig>)>> {
    GLOBAL_CONFIG.get_or_init(|| Mutex::new(None))
}

/// Returns the process-wide TLS client configuration, building it from `credentials` the
/// first time it's needed. Every connection in the process shares this one pair of
/// `ClientConfig`s (verifying and non-verifying) and their session caches after that,
/// exactly like the original's one-time-init credential store. `no_verify` only chooses
/// which of the two cached configs to hand back.
pub fn global_client_config(credentials: &TlsCredentials) -> Result<Arc<ClientConfig>> {
    let mut guard = store().lock().expect("TLS credential store poisoned");
    if let Some((verifying, non_verifying)) = guard.as_ref() {
        return Ok(if credentials.no_verify {
            non_verifying.clone()
        } else {
            verifying.clone()
        });
    }

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &credentials.ca_cert_pem[..]) {
        roots
            .add(cert.map_err(|e| Error::tls(format!("bad CA cert: {e}")))?)
            .map_err(|e| Error::tls(format!("CA cert not trusted-root material: {e}")))?;
    }

    let client_certs: Vec<_> = rustls_pemfile::certs(&mut &credentials.client_cert_pem[..])
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::tls(format!("bad client cert: {e}")))?;
    let client_key = rustls_pemfile::private_key(&mut &credentials.client_key_pem[..])
        .map_err(|e| Error::tls(format!("bad client key: {e}")))?
        .ok_or_else(|| Error::tls("no private key found in client key PEM"))?;

    let verifying = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(client_certs.clone(), client_key.clone())
        .map_err(|e| Error::tls(format!("invalid client certificate/key pair: {e}")))?;

    // §6.2 `no_verify`: an explicit, external opt-in to skip peer verification, never
    // the default. Wired through `dangerous()` rather than omitted checks so the
    // insecure path stays visually obvious at the call site.
    let non_verifying = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoServerCertVerification))
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| Error::tls(format!("invalid client certificate/key pair: {e}")))?;

    let pair = (Arc::new(verifying), Arc::new(non_verifying));
    *guard = Some(pair.clone());
    Ok(if credentials.no_verify {
        pair.1
    } else {
        pair.0
    })
}

/// Explicit teardown of the process-wide credential store (§9). Not required for
/// correctness — only frees the cached config and session state early.
pub fn shutdown() {
    if let Some(lock) = GLOBAL_CONFIG.get() {
        *lock.lock().expect("TLS credential store poisoned") = None;
    }
}

#[derive(Debug)]
struct NoServerCertVerification;

impl ServerCertVerifier for NoServerCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

pub struct TlsTransport {
    sock: TcpStream,
    conn: ClientConnection,
    key_bits: Option<u32>,
}

impl TlsTransport {
    /// Connects, then drives the TLS handshake to completion (blocking — the socket is
    /// only switched to non-blocking afterward, matching §4.2's "all variants set the
    /// transport handle to non-blocking after the synchronous handshakes complete").
    pub fn connect(host: &str, port: u16, credentials: &TlsCredentials) -> Result<Self> {
        debug!("connecting TLS to {host}:{port}");
        let sock = TcpStream::connect((host, port))?;
        sock.set_nodelay(true)?;

        let config = global_client_config(credentials)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::tls(format!("invalid server name {host}: {e}")))?;
        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::tls(format!("failed to start TLS session: {e}")))?;

        let mut sock_clone = sock.try_clone()?;
        complete_handshake(&mut conn, &mut sock_clone)?;

        let key_bits = conn.negotiated_cipher_suite().map(cipher_suite_key_bits);

        expect_acceptance_byte(&mut conn, &mut sock_clone)?;

        set_nonblocking(sock.as_raw_fd())?;

        Ok(TlsTransport {
            sock,
            conn,
            key_bits,
        })
    }
}

/// The "external security factor" the authenticator wants (§4.4, GLOSSARY): the
/// negotiated cipher's effective key strength in bits. All of rustls's supported
/// AEAD suites today are 128- or 256-bit; anything whose name doesn't say `_256_`
/// is treated as 128.
fn cipher_suite_key_bits(suite: rustls::SupportedCipherSuite) -> u32 {
    let name = format!("{suite:?}");
    if name.contains("256") {
        256
    } else {
        128
    }
}

/// Drives `conn.complete_io` until the handshake is done, blocking on the raw socket.
fn complete_handshake(conn: &mut ClientConnection, sock: &mut TcpStream) -> Result<()> {
    while conn.is_handshaking() {
        if conn.wants_write() {
            conn.write_tls(sock).map_err(|e| Error::tls(e.to_string()))?;
        }
        if conn.wants_read() {
            let n = conn.read_tls(sock).map_err(|e| Error::tls(e.to_string()))?;
            if n == 0 {
                return Err(Error::tls("peer closed connection during handshake"));
            }
            conn.process_new_packets()
                .map_err(|e| Error::tls(format!("handshake failed: {e}")))?;
        }
    }
    Ok(())
}

/// §4.2: after the handshake, the server sends a single `0x01` byte to indicate
/// acceptance; anything else (or EOF) is an acceptance-denied failure.
fn expect_acceptance_byte(conn: &mut ClientConnection, sock: &mut TcpStream) -> Result<()> {
    let mut byte = [0u8; 1];
    loop {
        let mut plain = [0u8; 1];
        match conn.reader().read(&mut plain) {
            Ok(1) => {
                byte = plain;
                break;
            }
            Ok(_) => return Err(Error::tls("peer closed before sending acceptance byte")),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let n = conn.read_tls(sock).map_err(|e| Error::tls(e.to_string()))?;
                if n == 0 {
                    return Err(Error::tls("peer closed before sending acceptance byte"));
                }
                conn.process_new_packets()
                    .map_err(|e| Error::tls(format!("post-handshake record error: {e}")))?;
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
    if byte[0] != 0x01 {
        return Err(Error::tls(format!(
            "server denied TLS acceptance (byte = {:#x})",
            byte[0]
        )));
    }
    Ok(())
}

impl Transport for TlsTransport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        // Drain any ciphertext sitting on the socket into rustls first.
        match self.conn.read_tls(&mut self.sock) {
            Ok(0) => {}
            Ok(_) => {
                self.conn
                    .process_new_packets()
                    .map_err(|e| Error::tls(e.to_string()))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::from(e)),
        }

        match self.conn.reader().read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn write_nonblocking(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        let n = self
            .conn
            .writer()
            .write(buf)
            .map_err(Error::from)?;
        loop {
            match self.conn.write_tls(&mut self.sock) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(Some(n))
    }

    fn close(&mut self) -> Result<()> {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut self.sock);
        self.sock.shutdown(std::net::Shutdown::Both).ok();
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn local_endpoint(&self) -> String {
        self.sock
            .local_addr()
            .map(|a| format!("{};{}", a.ip(), a.port()))
            .unwrap_or_else(|_| "unknown;0".to_string())
    }

    fn peer_endpoint(&self) -> String {
        self.sock
            .peer_addr()
            .map(|a| format!("{};{}", a.ip(), a.port()))
            .unwrap_or_else(|_| "unknown;0".to_string())
    }

    fn is_encrypted(&self) -> bool {
        true
    }

    fn cipher_key_bits(&self) -> Option<u32> {
        self.key_bits
    }
}
