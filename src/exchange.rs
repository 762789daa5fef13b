// One request/response exchange per local connection:
//
//   AwaitLocalRequest -> BuildAndSend -> AwaitServerReply ->
//   DecryptAndForward -> Relay -> Closed
//
// Every failure path returns early, which drops the local connection
// without a SOCKS5 error reply. The exchange snapshots the current
// tunnel socket once at send time and keeps that snapshot for the reply
// wait and the relay leg, so a port hop mid-exchange cannot orphan the
// reply.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::port_hopper::PortHopper;
use crate::socks_ingress::{self, ConnectRequest};
use crate::stealth_packet;
use crate::tunnel_cipher::{NONCE_LEN, TAG_LEN, TunnelCipher};

pub const TUNNEL_VERSION: u8 = 0x01;
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// The relay leg has no close signal from the tunnel side; an idle bound
/// ends it instead. Matches the upper bound of a full hop cycle.
pub const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_DATAGRAM_LEN: usize = 65535;

/// Tunnel request plaintext: version, SOCKS command, address type,
/// IPv4 address, big-endian port.
fn build_tunnel_request(request: &ConnectRequest) -> [u8; 9] {
    let mut plaintext = [0u8; 9];
    plaintext[0] = TUNNEL_VERSION;
    plaintext[1] = socks_ingress::CMD_CONNECT;
    plaintext[2] = socks_ingress::ADDR_TYPE_IPV4;
    plaintext[3..7].copy_from_slice(&request.address.octets());
    plaintext[7..9].copy_from_slice(&request.port.to_be_bytes());
    plaintext
}

/// Reply plaintexts are length-prefixed so zero-padding never corrupts
/// genuine trailing bytes: 2-byte big-endian length, response data,
/// optional zero padding.
fn unframe_reply(plaintext: &[u8]) -> std::io::Result<&[u8]> {
    if plaintext.len() < 2 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "reply plaintext missing length prefix",
        ));
    }
    let len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
    if len > plaintext.len() - 2 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "reply length prefix {len} exceeds plaintext of {} bytes",
                plaintext.len() - 2
            ),
        ));
    }
    Ok(&plaintext[2..2 + len])
}

/// Nanosecond send-time clock reading. The client only generates
/// sequence numbers; monotonicity and replay checks are the server
/// peer's responsibility.
fn current_sequence() -> u64 {
    SystemTime::UNIX_EPOCH.elapsed().unwrap().as_nanos() as u64
}

/// Runs one exchange to completion. The local stream is dropped when
/// this returns, in both the success and every failure case.
pub async fn run_exchange<S>(
    mut local: S,
    hopper: Arc<PortHopper>,
    cipher: Arc<TunnelCipher>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // AwaitLocalRequest
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let n = local.read(&mut buf).await?;
    let request = socks_ingress::parse_connect_request(&buf[..n])?;

    // BuildAndSend
    let socket = hopper.current_socket().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no tunnel socket available",
        )
    })?;

    let nonce = TunnelCipher::generate_nonce();
    let sealed = cipher.seal(&nonce, &build_tunnel_request(&request))?;
    let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&sealed);

    let session_id = TunnelCipher::generate_session_id();
    let packet = stealth_packet::encode(&session_id, current_sequence(), &payload)?;
    socket.send(&packet).await?;

    // AwaitServerReply: one datagram on the snapshotted socket.
    let n = timeout(REPLY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for tunnel reply",
            )
        })??;

    // DecryptAndForward
    let decoded = stealth_packet::decode(&buf[..n])?;
    if decoded.payload.len() < NONCE_LEN + TAG_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("reply payload too short: {} bytes", decoded.payload.len()),
        ));
    }
    let (reply_nonce, ciphertext) = decoded.payload.split_at(NONCE_LEN);
    let reply_nonce: [u8; NONCE_LEN] = reply_nonce.try_into().unwrap();
    let plaintext = cipher.open(&reply_nonce, ciphertext)?;
    let response = unframe_reply(&plaintext)?;

    // Relay: deliver the response, then keep forwarding tunnel datagrams
    // to the local side. This leg is one-directional.
    local.write_all(response).await?;
    relay_to_local(&socket, &mut local, &mut buf).await
}

async fn relay_to_local<S>(
    socket: &UdpSocket,
    local: &mut S,
    buf: &mut [u8],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    loop {
        let n = match timeout(RELAY_IDLE_TIMEOUT, socket.recv(buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        local.write_all(&buf[..n]).await?;
    }
}
