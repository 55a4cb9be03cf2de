// SPDX-License-Identifier: BSD-3-Clause

//! Ambient configuration (§6.4, §2.1): environment variables read once at connection-open
//! time, and the already-parsed connection descriptor contract (§6.2). Parsing the raw
//! URI text is an external, excluded concern (§1); this module only defines the struct
//! shape a connector external to this crate is expected to fill in.

use std::path::PathBuf;
use std::time::Duration;

/// Environment knobs read once per process (§6.4).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// `AUTO_START`: allow auto-spawning a local daemon for an unreachable local socket.
    pub auto_start: bool,
    /// `DAEMON_PATH`: override the daemon binary path used by auto-spawn.
    pub daemon_path: Option<PathBuf>,
    /// `TLS_DEBUG`: log level forwarded to the TLS library's own diagnostics.
    pub tls_debug: i32,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        EnvConfig {
            auto_start: env_bool("AUTO_START"),
            daemon_path: std::env::var_os("DAEMON_PATH").map(PathBuf::from),
            tls_debug: std::env::var("TLS_DEBUG")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            auto_start: false,
            daemon_path: None,
            tls_debug: 0,
        }
    }
}

fn env_bool(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1"))
}

/// Bounded linear backoff for local-socket auto-spawn retries (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct AutoSpawnBackoff {
    pub max_attempts: u32,
    pub initial: Duration,
    pub step: Duration,
}

impl Default for AutoSpawnBackoff {
    fn default() -> Self {
        AutoSpawnBackoff {
            max_attempts: 5,
            initial: Duration::from_millis(50),
            step: Duration::from_millis(50),
        }
    }
}

impl AutoSpawnBackoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial + self.step * attempt
    }
}

/// Which transport variant a descriptor selects (§4.2, §6.2 scheme suffixes).
#[derive(Debug, Clone)]
pub enum TransportSpec {
    Tls {
        host: String,
        port: u16,
        no_verify: bool,
        pki_path: Option<PathBuf>,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Unix {
        path: String,
        auto_start: bool,
    },
    Tunnel {
        command: String,
        args: Vec<String>,
    },
}

/// The already-parsed connection descriptor (§6.2). Produced by an external connector
/// that understands the URI text, query-parameter residue forwarding, and filesystem
/// discovery rules this crate does not implement.
#[derive(Debug, Clone)]
pub struct ConnectSpec {
    pub transport: TransportSpec,
    /// `name=`: URI forwarded to the server, overriding whatever the local descriptor said.
    pub remote_name: Option<String>,
    /// `auth=`: preferred authentication method name.
    pub preferred_auth: Option<String>,
    /// `no_tty=`: disables interactive credential prompts in the authenticator callback.
    pub no_tty: bool,
    /// `debug=`: per-connection debug logging.
    pub debug: bool,
}
