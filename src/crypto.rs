//! Key derivation, payload encryption, and WAL signing.
//!
//! Role keys are derived once per session with HKDF-SHA256 and held in
//! private fields; there is no export path. Payloads at rest are sealed
//! with XChaCha20-Poly1305 under the data key; WAL entries are signed with
//! HMAC-SHA256 under the signing key.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::core::error::{CoreError, ErrorKind};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 24;
pub const SIGNATURE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("writes require a secure context")]
    InsecureContext,
    #[error("payload encryption failed")]
    SealFailed,
    #[error("payload decryption failed (wrong key or tampered ciphertext)")]
    OpenFailed,
    #[error("ciphertext too short ({got} bytes)")]
    CiphertextTruncated { got: usize },
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("key derivation failed: {reason}")]
    DerivationFailed { reason: String },
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        let kind = match err {
            CryptoError::InsecureContext => ErrorKind::Auth,
            CryptoError::SignatureMismatch | CryptoError::OpenFailed => ErrorKind::WalCorruption,
            CryptoError::CiphertextTruncated { .. } => ErrorKind::WalCorruption,
            CryptoError::SealFailed | CryptoError::DerivationFailed { .. } => {
                ErrorKind::Validation
            }
        };
        CoreError::new(kind, err.to_string())
    }
}

/// Non-extractable role keys for one session.
///
/// Key separation: the data key only ever encrypts payloads, the signing
/// key only ever signs WAL entries, and the session key is handed to
/// host-side consumers needing a per-session secret (never the other two).
pub struct KeyManager {
    data_key: [u8; 32],
    signing_key: [u8; 32],
    session_key: [u8; 32],
    secure_context: bool,
}

impl KeyManager {
    /// Derive all role keys from a root secret and per-session salt.
    pub fn derive(
        root_secret: &[u8],
        session_salt: &[u8],
        secure_context: bool,
    ) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(session_salt), root_secret);
        let mut data_key = [0u8; 32];
        let mut signing_key = [0u8; 32];
        let mut session_key = [0u8; 32];
        for (info, key) in [
            (&b"echovault/data"[..], &mut data_key),
            (&b"echovault/sign"[..], &mut signing_key),
            (&b"echovault/session"[..], &mut session_key),
        ] {
            hk.expand(info, key)
                .map_err(|e| CryptoError::DerivationFailed {
                    reason: format!("hkdf expand failed: {e:?}"),
                })?;
        }
        Ok(Self {
            data_key,
            signing_key,
            session_key,
            secure_context,
        })
    }

    /// Ephemeral keys for tests and throwaway stores.
    pub fn ephemeral() -> Self {
        let mut root = [0u8; 32];
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut root);
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive(&root, &salt, true).expect("ephemeral derivation cannot fail")
    }

    /// Writes are blocked outside a secure context.
    pub fn ensure_secure_context(&self) -> Result<(), CryptoError> {
        if self.secure_context {
            Ok(())
        } else {
            Err(CryptoError::InsecureContext)
        }
    }

    /// Encrypt a payload under the data key. Output is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.data_key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext` sealed by [`Self::seal`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::CiphertextTruncated { got: sealed.len() });
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.data_key));
        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::OpenFailed)
    }

    /// Sign bytes with the signing key.
    pub fn sign(&self, bytes: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.signing_key).expect("hmac accepts any key length");
        mac.update(bytes);
        let out = mac.finalize().into_bytes();
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&out);
        sig
    }

    /// Constant-time signature verification.
    pub fn verify(&self, bytes: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.signing_key).expect("hmac accepts any key length");
        mac.update(bytes);
        mac.verify_slice(signature)
            .map_err(|_| CryptoError::SignatureMismatch)
    }

    /// Opaque per-session secret for host consumers.
    pub fn session_token(&self) -> [u8; 32] {
        // Derived, not the raw session key: hand out a fingerprint only.
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.session_key).expect("hmac accepts any key length");
        mac.update(b"echovault/session-token");
        let out = mac.finalize().into_bytes();
        let mut token = [0u8; 32];
        token.copy_from_slice(&out);
        token
    }
}
