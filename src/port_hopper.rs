use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub const HOP_INTERVAL: Duration = Duration::from_secs(45);
pub const MAX_HOP_JITTER: Duration = Duration::from_secs(15);

/// Owns the single outbound UDP socket toward the tunnel server and
/// periodically replaces it so the tunnel's local port keeps changing.
///
/// The current socket is published behind a mutex. Exchanges snapshot
/// the `Arc` once at send time and keep using that snapshot for the
/// matching reply wait, so a hop in the middle of an exchange cannot
/// orphan the reply: the old socket stays alive until the last exchange
/// holding it finishes.
pub struct PortHopper {
    server_addr: SocketAddr,
    current: Mutex<Option<Arc<UdpSocket>>>,
}

impl PortHopper {
    pub fn new(server_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            server_addr,
            current: Mutex::new(None),
        })
    }

    /// Returns a snapshot of the current socket, or `None` when the last
    /// rebind failed and the hopper is waiting for its next tick.
    pub fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.current.lock().clone()
    }

    /// Replaces the current socket with a freshly bound one. On failure
    /// the slot is cleared; the hop loop retries on its next tick.
    pub async fn hop(&self) {
        match self.open_socket().await {
            Ok(socket) => {
                debug!(
                    "hopped tunnel socket to local port {}",
                    socket.local_addr().map(|a| a.port()).unwrap_or(0)
                );
                *self.current.lock() = Some(Arc::new(socket));
            }
            Err(e) => {
                warn!("failed to open tunnel socket: {e}");
                *self.current.lock() = None;
            }
        }
    }

    async fn open_socket(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.server_addr).await?;
        Ok(socket)
    }

    /// Runs the hop loop until `stop` fires, then drops the socket so
    /// shutdown never leaks a bound port.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            self.hop().await;
            tokio::select! {
                _ = tokio::time::sleep(next_hop_delay()) => {}
                _ = stop.changed() => break,
            }
        }
        *self.current.lock() = None;
        debug!("port hopper stopped");
    }
}

/// Base hop interval plus uniform jitter in [0, 15s).
fn next_hop_delay() -> Duration {
    HOP_INTERVAL + Duration::from_millis(rand::rng().random_range(0..MAX_HOP_JITTER.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_delay_bounds() {
        for _ in 0..1000 {
            let delay = next_hop_delay();
            assert!(delay >= Duration::from_secs(45));
            assert!(delay < Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn test_single_live_socket_per_hop() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hopper = PortHopper::new(server.local_addr().unwrap());
        assert!(hopper.current_socket().is_none());

        let mut previous: Option<Arc<UdpSocket>> = None;
        for _ in 0..3 {
            hopper.hop().await;
            let current = hopper.current_socket().unwrap();

            if let Some(old) = previous.take() {
                assert!(!Arc::ptr_eq(&old, &current));
                // The hopper released its reference to the replaced
                // socket; only the test still holds it.
                assert_eq!(Arc::strong_count(&old), 1);
            }
            // Held by the hopper and by this snapshot.
            assert_eq!(Arc::strong_count(&current), 2);
            previous = Some(current);
        }
    }

    #[tokio::test]
    async fn test_failed_hop_clears_current_socket() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hopper = PortHopper::new(server.local_addr().unwrap());
        hopper.hop().await;
        assert!(hopper.current_socket().is_some());

        // Connecting the v4-bound socket to a v6 address fails, so this
        // hop must clear the slot instead of leaving the stale socket
        // published.
        let bad = PortHopper::new("[::1]:9".parse().unwrap());
        bad.hop().await;
        assert!(bad.current_socket().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_and_drops_socket() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hopper = PortHopper::new(server.local_addr().unwrap());

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(hopper.clone().run(stop_rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hopper.current_socket().is_some());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(hopper.current_socket().is_none());
    }
}
