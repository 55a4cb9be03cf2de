// SPDX-License-Identifier: BSD-3-Clause

//! Challenge/response authentication driven over `rsasl`, the pluggable
//! security-context library named abstractly in §4.4.

use std::io::Cursor;

use rsasl::mechname::Mechname;
use rsasl::prelude::{SASLClient, SASLConfig, SaslError, Session, State};
use rsasl::property::{AuthId, Password};

use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::security::SecurityCodec;

/// Bounds the authenticator places on the negotiated security-strength-factor (§4.4):
/// `min == max == 0` when the channel is already confidential (TLS), else a floor of 56
/// bits with anonymous/plaintext mechanisms forbidden.
#[derive(Debug, Clone, Copy)]
pub struct SecurityProperties {
    pub min_ssf: u32,
    pub max_ssf: u32,
    pub forbid_anonymous: bool,
    pub forbid_plaintext: bool,
}

impl SecurityProperties {
    /// §4.4: already-encrypted channel (TLS) relaxes the floor to 0/0, since the outer
    /// transport supplies confidentiality; `external_ssf` is then exported to the
    /// mechanism so it can factor in the outer channel's strength.
    pub fn for_channel(already_encrypted: bool) -> Self {
        if already_encrypted {
            SecurityProperties {
                min_ssf: 0,
                max_ssf: 0,
                forbid_anonymous: false,
                forbid_plaintext: false,
            }
        } else {
            SecurityProperties {
                min_ssf: 56,
                max_ssf: 100_000,
                forbid_anonymous: true,
                forbid_plaintext: true,
            }
        }
    }
}

/// Drives one client-side SASL session to completion (§4.4 step 3, challenge/response).
pub struct SaslNegotiation {
    session: Session<()>,
    external_ssf: Option<u32>,
}

fn is_anonymous_mechanism(name: &str) -> bool {
    name.eq_ignore_ascii_case("ANONYMOUS")
}

fn is_plaintext_mechanism(name: &str) -> bool {
    matches!(name.to_ascii_uppercase().as_str(), "PLAIN" | "LOGIN")
}

/// One round of the negotiation: either more data must be sent to the server and the
/// loop continues, or the session is complete.
pub enum StepOutcome {
    Continue(Vec<u8>),
    Complete(Vec<u8>),
}

impl SaslNegotiation {
    /// Initializes a client context bound to `service_principal` (e.g. `"libvirt"`) and
    /// drives mechanism selection against the server's offered mechanism list, honoring
    /// a caller-preferred mechanism if one was requested (§4.4).
    pub fn start(
        offered_mechanisms: &[String],
        preferred_mechanism: Option<&str>,
        credential: &Credential,
        properties: SecurityProperties,
        external_ssf: Option<u32>,
    ) -> Result<Self> {
        if let Some(pref) = preferred_mechanism {
            if !offered_mechanisms.iter().any(|m| m == pref) {
                return Err(Error::auth(format!(
                    "server did not offer the requested mechanism {pref}"
                )));
            }
            if properties.forbid_anonymous && is_anonymous_mechanism(pref) {
                return Err(Error::auth(format!(
                    "requested mechanism {pref} is anonymous, forbidden on this channel"
                )));
            }
            if properties.forbid_plaintext && is_plaintext_mechanism(pref) {
                return Err(Error::auth(format!(
                    "requested mechanism {pref} sends plaintext credentials, forbidden on this channel"
                )));
            }
        }

        let mut builder = SASLConfig::builder()
            .with_defaults();
        if let Some(username) = &credential.username {
            builder = builder
                .with_property(AuthId, username.clone())
                .map_err(|e| Error::auth(format!("invalid SASL authid: {e}")))?;
        }
        if let Some(password) = &credential.password {
            builder = builder
                .with_property(Password, password.clone())
                .map_err(|e| Error::auth(format!("invalid SASL password: {e}")))?;
        }
        let config = builder
            .build()
            .map_err(|e| Error::auth(format!("failed to build SASL config: {e}")))?;

        let client = SASLClient::new(config);

        let candidates: Vec<&Mechname> = offered_mechanisms
            .iter()
            .filter(|m| preferred_mechanism.map_or(true, |p| p == m.as_str()))
            .filter(|m| !(properties.forbid_anonymous && is_anonymous_mechanism(m)))
            .filter(|m| !(properties.forbid_plaintext && is_plaintext_mechanism(m)))
            .filter_map(|m| Mechname::parse(m.as_bytes()).ok())
            .collect();

        if candidates.is_empty() {
            return Err(Error::auth(
                "no mechanism offered by the server satisfies the channel's security policy",
            ));
        }

        let session = client
            .start_suggested(candidates.into_iter())
            .map_err(|e| Error::auth(format!("no mutually supported SASL mechanism: {e}")))?;

        // PLAIN and the SCRAM family (the only mechanisms this client enables) establish no
        // confidentiality layer of their own, so the session's effective strength is whatever
        // the outer channel already contributed. rsasl has no cyrus-sasl-style max-ssf knob to
        // hand this to the mechanism directly, so it is clamped here and checked once
        // negotiation completes instead, see `negotiated_ssf`.
        let external_ssf = external_ssf.map(|ssf| ssf.min(properties.max_ssf));
        Ok(SaslNegotiation { session, external_ssf })
    }

    /// The security-strength-factor in effect once negotiation completes (§4.4). None of
    /// the mechanisms enabled here add their own confidentiality, so this is just whatever
    /// the outer channel supplied going in.
    pub fn negotiated_ssf(&self) -> u32 {
        self.external_ssf.unwrap_or(0)
    }

    /// Performs one client step, handing `server_data` (if any was received) to the
    /// mechanism and returning the bytes to send back, or the final bytes plus
    /// completion (§4.4: "perform a client step ... repeat until both sides report
    /// complete").
    pub fn step(&mut self, server_data: Option<&[u8]>) -> Result<StepOutcome> {
        let mut out = Cursor::new(Vec::new());
        let state = self
            .session
            .step(server_data, &mut out)
            .map_err(sasl_step_error)?;

        let bytes = out.into_inner();
        match state {
            State::Running => Ok(StepOutcome::Continue(bytes)),
            State::Finished(_) => Ok(StepOutcome::Complete(bytes)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.session.is_finished()
    }

    /// Installs this session's negotiated security layer as the frame-level
    /// [`SecurityCodec`] once both sides report completion (§4.3).
    pub fn into_security_codec(self) -> Box<dyn SecurityCodec> {
        Box::new(SaslSecurityCodec {
            session: self.session,
        })
    }
}

fn sasl_step_error(e: SaslError) -> Error {
    Error::auth(format!("SASL step failed: {e}"))
}

struct SaslSecurityCodec {
    session: Session<()>,
}

impl SecurityCodec for SaslSecurityCodec {
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.session
            .encode(plaintext, &mut out)
            .map_err(|e| Error::auth(format!("SASL encode failed: {e}")))?;
        Ok(out.into_inner())
    }

    fn unwrap(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.session
            .decode(ciphertext, &mut out)
            .map_err(|e| Error::auth(format!("SASL decode failed: {e}")))?;
        Ok(out.into_inner())
    }
}
