use std::sync::Arc;

use log::{debug, error, info};
use tokio::net::TcpListener;

use crate::exchange::run_exchange;
use crate::exchange_pool::ExchangePool;
use crate::port_hopper::PortHopper;
use crate::tunnel_cipher::TunnelCipher;

pub const LOCAL_BIND_ADDRESS: &str = "127.0.0.1:1080";

/// Accept loop for the local SOCKS listener. Each connection becomes one
/// exchange on the pool; a single connection's failure never takes the
/// loop down.
pub async fn run_local_server(
    hopper: Arc<PortHopper>,
    cipher: Arc<TunnelCipher>,
    pool: Arc<ExchangePool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(LOCAL_BIND_ADDRESS).await.map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("failed to bind local SOCKS port {LOCAL_BIND_ADDRESS}: {e}"),
        )
    })?;

    info!("whisper client running, SOCKS proxy on socks5://{LOCAL_BIND_ADDRESS}");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("accept failed: {e:?}");
                continue;
            }
        };

        let cloned_hopper = hopper.clone();
        let cloned_cipher = cipher.clone();
        let submitted = pool.submit(async move {
            match run_exchange(stream, cloned_hopper, cloned_cipher).await {
                Ok(()) => debug!("{}:{} exchange finished", addr.ip(), addr.port()),
                // Closed silently: no SOCKS5 error reply is sent back.
                Err(e) => debug!("{}:{} exchange closed: {e}", addr.ip(), addr.port()),
            }
            Ok(())
        });
        if !submitted {
            error!("exchange pool is gone, dropping connection from {addr}");
        }
    }
}
