// SPDX-License-Identifier: BSD-3-Clause

//! Pluggable client authentication (§4.4): query the server's offered methods, pick one,
//! and drive it to completion. Three methods are named: anonymous (no-op), challenge/response
//! (SASL, §4.4 step 3), and external policy (a one-shot polkit-like RPC, §4.4 step 4).

pub mod sasl;

use log::debug;

use crate::error::{Error, Result};
use crate::security::SecurityWrapper;
use crate::xdr;

pub use sasl::SecurityProperties;

/// Method identifiers as reported by the server's auth-list (§4.4); order here is
/// insignificant, the server's advertised order governs "first offered" selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Sasl,
    Polkit,
}

impl AuthMethod {
    fn from_wire(code: i32) -> Option<Self> {
        match code {
            0 => Some(AuthMethod::None),
            1 => Some(AuthMethod::Sasl),
            2 => Some(AuthMethod::Polkit),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Sasl => "sasl",
            AuthMethod::Polkit => "polkit",
        }
    }
}

/// Credentials supplied up front or gathered interactively (§4.4: "the caller may be
/// prompted for a username/password").
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Interactive prompting hook. Given a prompt string, returns the user's answer, or
/// `None` if the caller has no way to prompt (batch/no-tty mode, §6.1 `no_tty`).
pub type CredentialCallback = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// What the authenticator needs from the connection to run its RPCs: one blocking
/// request/response round trip per step, addressed by the reserved control-plane
/// procedure numbers (§4.4, §SPEC_FULL §2.2). Kept as a trait so this module doesn't
/// depend on the multiplexer directly.
pub trait AuthChannel {
    /// Issues a call against `procedure` with an already-XDR-encoded `args` body and
    /// returns the XDR-encoded reply body. `quiet_missing` suppresses the "unsupported
    /// procedure" error into `Ok(None)` (§4.4: the auth-list query must not fail a server
    /// that predates authentication).
    fn call(&self, procedure: i32, args: Vec<u8>, quiet_missing: bool) -> Result<Option<Vec<u8>>>;

    /// True when the underlying transport already provides confidentiality (TLS),
    /// governing the security-strength-factor floor (§4.4).
    fn is_encrypted(&self) -> bool;

    /// The outer channel's own cipher strength, if any, exported to SASL as its
    /// external security-strength-factor (§4.4).
    fn cipher_key_bits(&self) -> Option<u32>;
}

pub struct AuthOptions {
    pub preferred_method: Option<String>,
    pub credential: Credential,
    pub prompt: Option<CredentialCallback>,
    pub no_tty: bool,
}

/// Drives the full method-selection and negotiation flow. Returns the negotiated
/// security wrapper (to be installed beneath any existing TLS layer) if challenge/response
/// was used, or `None` for anonymous/no-auth outcomes.
pub struct Authenticator;

impl Authenticator {
    pub fn negotiate(
        channel: &dyn AuthChannel,
        mut options: AuthOptions,
    ) -> Result<Option<SecurityWrapper>> {
        let offered = query_auth_list(channel)?;
        if offered.is_empty() {
            debug!("server requires no authentication");
            return Ok(None);
        }

        let method = select_method(&offered, options.preferred_method.as_deref())?;
        debug!("selected authentication method: {}", method.name());

        match method {
            AuthMethod::None => Ok(None),
            AuthMethod::Sasl => {
                let offered_mechanisms = query_sasl_mechanisms(channel)?;
                ensure_credential(&mut options)?;
                negotiate_sasl(channel, &offered_mechanisms, &options)
            }
            AuthMethod::Polkit => {
                negotiate_polkit(channel)?;
                Ok(None)
            }
        }
    }
}

/// §4.4 step 1: query the auth-list, with quiet-missing semantics so a server that
/// predates this RPC is treated as requiring no authentication rather than failing.
fn query_auth_list(channel: &dyn AuthChannel) -> Result<Vec<AuthMethod>> {
    let reply = channel.call(crate::procedure::control_procedure::AUTH_LIST, Vec::new(), true)?;
    let Some(body) = reply else {
        return Ok(Vec::new());
    };

    let mut cursor = std::io::Cursor::new(body);
    let count = xdr::read_u32(&mut cursor)?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let code = xdr::read_i32(&mut cursor)?;
        if let Some(method) = AuthMethod::from_wire(code) {
            methods.push(method);
        }
    }
    Ok(methods)
}

fn select_method(offered: &[AuthMethod], preferred: Option<&str>) -> Result<AuthMethod> {
    if let Some(name) = preferred {
        return offered
            .iter()
            .copied()
            .find(|m| m.name() == name)
            .ok_or_else(|| Error::auth(format!("server did not offer requested method {name}")));
    }
    offered
        .first()
        .copied()
        .ok_or_else(|| Error::auth("server advertised an empty auth list"))
}

fn ensure_credential(options: &mut AuthOptions) -> Result<()> {
    if options.credential.username.is_some() {
        return Ok(());
    }
    if options.no_tty {
        return Err(Error::auth("credentials required but no-tty mode forbids prompting"));
    }
    let Some(prompt) = options.prompt.as_mut() else {
        return Err(Error::auth("credentials required but no prompt callback was supplied"));
    };
    options.credential.username = prompt("Username:");
    if options.credential.username.is_none() {
        return Err(Error::auth("authentication cancelled: no username supplied"));
    }
    if options.credential.password.is_none() {
        options.credential.password = prompt("Password:");
    }
    Ok(())
}

/// §4.4 step 3: SASL init round reports the server's offered mechanism list, akin to
/// the auth-list query but scoped to this method.
fn query_sasl_mechanisms(channel: &dyn AuthChannel) -> Result<Vec<String>> {
    let reply = channel.call(
        crate::procedure::control_procedure::AUTH_SASL_INIT,
        Vec::new(),
        false,
    )?;
    let body = reply.ok_or_else(|| Error::auth("server did not respond to SASL init"))?;
    let mut cursor = std::io::Cursor::new(body);
    let count = xdr::read_u32(&mut cursor)?;
    let mut mechanisms = Vec::with_capacity(count as usize);
    for _ in 0..count {
        mechanisms.push(xdr::read_string(&mut cursor)?);
    }
    Ok(mechanisms)
}

fn negotiate_sasl(
    channel: &dyn AuthChannel,
    offered_mechanisms: &[String],
    options: &AuthOptions,
) -> Result<Option<SecurityWrapper>> {
    let properties = SecurityProperties::for_channel(channel.is_encrypted());
    let mut session = sasl::SaslNegotiation::start(
        offered_mechanisms,
        options.preferred_method.as_deref(),
        &options.credential,
        properties,
        channel.cipher_key_bits(),
    )?;

    let mut server_data: Option<Vec<u8>> = None;
    loop {
        let outcome = session.step(server_data.as_deref())?;
        let (to_send, is_final) = match outcome {
            sasl::StepOutcome::Continue(bytes) => (bytes, false),
            sasl::StepOutcome::Complete(bytes) => (bytes, true),
        };

        let mut args = Vec::new();
        xdr::write_bytes(&mut args, &to_send)?;
        let reply = channel.call(
            crate::procedure::control_procedure::AUTH_SASL_STEP,
            args,
            false,
        )?;

        if is_final && session.is_finished() {
            let ssf = session.negotiated_ssf();
            if !channel.is_encrypted() && ssf < properties.min_ssf {
                return Err(Error::auth(format!(
                    "negotiated security strength factor {ssf} is below the required floor \
                     of {} on an unencrypted channel",
                    properties.min_ssf
                )));
            }
            debug!("SASL negotiation complete (ssf={ssf})");
            return Ok(Some(SecurityWrapper::new(session.into_security_codec())));
        }

        let body = reply.ok_or_else(|| Error::auth("server did not continue SASL step"))?;
        let mut cursor = std::io::Cursor::new(body);
        server_data = Some(xdr::read_bytes(&mut cursor)?);
    }
}

/// §4.4 step 4: a one-shot RPC; success means access granted, any error fails the
/// connection attempt. No security layer results from this method.
fn negotiate_polkit(channel: &dyn AuthChannel) -> Result<()> {
    channel
        .call(crate::procedure::control_procedure::AUTH_POLKIT, Vec::new(), false)
        .map(|_| ())
}
