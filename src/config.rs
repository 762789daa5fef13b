use std::net::SocketAddr;

use crate::tunnel_cipher::KEY_LEN;

/// Validated startup configuration. Both errors here are fatal and
/// happen before any socket is opened.
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub psk: [u8; KEY_LEN],
    pub num_threads: usize,
}

impl ClientConfig {
    pub fn new(server: &str, psk: &str, num_threads: usize) -> std::io::Result<Self> {
        let server_addr = server.parse::<SocketAddr>().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid server address '{server}': {e}"),
            )
        })?;

        let psk_bytes = psk.as_bytes();
        if psk_bytes.len() != KEY_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "pre-shared key must be exactly {} bytes, got {}",
                    KEY_LEN,
                    psk_bytes.len()
                ),
            ));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(psk_bytes);

        Ok(Self {
            server_addr,
            psk: key,
            num_threads,
        })
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addr", &self.server_addr)
            .field("psk", &"<redacted>")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
