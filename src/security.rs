// SPDX-License-Identifier: BSD-3-Clause

//! The security wrapper (§4.3, §9 "Security wrapper layering"): once the authenticator
//! negotiates a SASL security layer, every outbound frame's bytes are re-encoded and
//! every inbound frame's bytes re-decoded through it, strictly beneath TLS when both are
//! active. A single encode/decode call can produce more or fewer bytes than it was given,
//! so the wrapper owns its own staging buffer and offset state independent of the
//! `Call`'s outbound offset.

use crate::error::Result;

/// The reversible per-byte transform installed after a successful challenge/response
/// authentication (§4.4). Implemented over a negotiated SASL security layer; kept as a
/// trait so the multiplexer never has to know the concrete mechanism.
pub trait SecurityCodec: Send {
    /// Encrypts/wraps one chunk of plaintext, returning the ciphertext to send.
    fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Decrypts/unwraps one chunk of ciphertext, returning the plaintext recovered.
    fn unwrap(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Maximum plaintext chunk handed to [`SecurityCodec::wrap`] at once; mirrors the
/// source's use of the frame's `MAX_BODY` bound as the SASL buffer size.
pub const MAX_SASL_CHUNK: usize = crate::frame::MAX_BODY;

pub struct SecurityWrapper {
    codec: Box<dyn SecurityCodec>,
    /// Ciphertext produced by the last `wrap()` call, not yet fully drained to the
    /// transport. The write sub-machine (§4.5) must finish draining this before the
    /// next plaintext chunk is staged.
    pending_ciphertext: Vec<u8>,
    pending_offset: usize,
}

impl SecurityWrapper {
    pub fn new(codec: Box<dyn SecurityCodec>) -> Self {
        SecurityWrapper {
            codec,
            pending_ciphertext: Vec::new(),
            pending_offset: 0,
        }
    }

    pub fn has_pending_ciphertext(&self) -> bool {
        self.pending_offset < self.pending_ciphertext.len()
    }

    /// Encodes `plaintext` into the staging buffer. Must only be called once the
    /// previous chunk has fully drained (§4.3).
    pub fn stage_plaintext(&mut self, plaintext: &[u8]) -> Result<()> {
        debug_assert!(!self.has_pending_ciphertext());
        let chunk = &plaintext[..plaintext.len().min(MAX_SASL_CHUNK)];
        self.pending_ciphertext = self.codec.wrap(chunk)?;
        self.pending_offset = 0;
        Ok(())
    }

    /// The not-yet-written remainder of the staged ciphertext.
    pub fn pending_chunk(&self) -> &[u8] {
        &self.pending_ciphertext[self.pending_offset..]
    }

    pub fn advance(&mut self, n: usize) {
        self.pending_offset += n;
        if self.pending_offset >= self.pending_ciphertext.len() {
            self.pending_ciphertext.clear();
            self.pending_offset = 0;
        }
    }

    /// Decodes a chunk of ciphertext read from the transport into plaintext frame bytes.
    pub fn decode(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.codec.unwrap(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An identity codec, used to exercise the staging/draining bookkeeping without
    /// depending on a live SASL session.
    struct IdentityCodec;

    impl SecurityCodec for IdentityCodec {
        fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
            Ok(plaintext.to_vec())
        }
        fn unwrap(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
            Ok(ciphertext.to_vec())
        }
    }

    #[test]
    fn drains_pending_chunk_before_restaging() {
        let mut wrapper = SecurityWrapper::new(Box::new(IdentityCodec));
        wrapper.stage_plaintext(b"hello").unwrap();
        assert!(wrapper.has_pending_ciphertext());
        assert_eq!(wrapper.pending_chunk(), b"hello");
        wrapper.advance(3);
        assert_eq!(wrapper.pending_chunk(), b"lo");
        wrapper.advance(2);
        assert!(!wrapper.has_pending_ciphertext());
    }
}
