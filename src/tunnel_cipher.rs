use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const SESSION_ID_LEN: usize = 8;

/// The process-wide tunnel cipher: XChaCha20-Poly1305 keyed by the
/// pre-shared key. One instance is created at startup and reused for
/// every packet in both directions.
///
/// The 24-byte extended nonce is drawn fresh from the process entropy
/// source per operation; uniqueness relies on the nonce length.
pub struct TunnelCipher {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for TunnelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelCipher").finish_non_exhaustive()
    }
}

impl TunnelCipher {
    pub fn new(key: &[u8]) -> std::io::Result<Self> {
        if key.len() != KEY_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "pre-shared key must be exactly {} bytes, got {}",
                    KEY_LEN,
                    key.len()
                ),
            ));
        }
        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Encrypts `plaintext`, returning ciphertext with the 16-byte
    /// authentication tag appended.
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> std::io::Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| std::io::Error::other("failed to seal tunnel payload"))
    }

    /// Decrypts and authenticates `ciphertext` (tag included). A failure
    /// here means the packet was tampered with or sealed under a
    /// different key; the caller must abort the exchange and must not
    /// retry with the same inputs.
    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> std::io::Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "packet authentication failed",
                )
            })
    }

    pub fn generate_session_id() -> [u8; SESSION_ID_LEN] {
        let mut session_id = [0u8; SESSION_ID_LEN];
        rand::rng().fill_bytes(&mut session_id);
        session_id
    }

    pub fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }
}
