// Stealth packet framing.
//
// Each datagram is disguised as a QUIC long-header packet:
//
//   fake header (18..=32 bytes) | sequence (8) | payload length (2) |
//   encrypted payload (nonce | ciphertext | tag) | padding (0..=64)
//
// The fake header length is chosen per packet and carried in the low
// nibble of the first byte (0xC0 | len - 18), so both sides use the
// same length. The explicit payload length marks where the random,
// unauthenticated padding begins.

use bytes::{BufMut, BytesMut};
use rand::{Rng, RngCore};

use crate::tunnel_cipher::SESSION_ID_LEN;

pub const MIN_FAKE_HEADER_LEN: usize = 18;
pub const MAX_FAKE_HEADER_LEN: usize = 32;
pub const MAX_PADDING_LEN: usize = 64;
pub const SEQUENCE_LEN: usize = 8;
pub const PAYLOAD_LEN_LEN: usize = 2;

/// QUIC long-header form and fixed bits.
const LONG_HEADER_BITS: u8 = 0xc0;

const VERSION_OFFSET: usize = 1;
const CONNECTION_ID_LEN_OFFSET: usize = 5;
const SESSION_ID_OFFSET: usize = 6;

#[derive(Debug, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    pub session_id: [u8; SESSION_ID_LEN],
    pub sequence: u64,
    pub payload: &'a [u8],
}

/// Builds a stealth packet around an already-encrypted payload.
pub fn encode(
    session_id: &[u8; SESSION_ID_LEN],
    sequence: u64,
    payload: &[u8],
) -> std::io::Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("payload too large for stealth packet: {}", payload.len()),
        ));
    }

    let mut rng = rand::rng();
    let header_len = rng.random_range(MIN_FAKE_HEADER_LEN..=MAX_FAKE_HEADER_LEN);
    let padding_len = rng.random_range(0..=MAX_PADDING_LEN);

    let mut header = [0u8; MAX_FAKE_HEADER_LEN];
    rng.fill_bytes(&mut header[..header_len]);
    header[0] = LONG_HEADER_BITS | (header_len - MIN_FAKE_HEADER_LEN) as u8;
    // Version-like field, low bit set to mimic QUIC v1.
    let version = 0x0000_0001 | rng.random::<u32>();
    header[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&version.to_be_bytes());
    header[CONNECTION_ID_LEN_OFFSET] = SESSION_ID_LEN as u8;
    header[SESSION_ID_OFFSET..SESSION_ID_OFFSET + SESSION_ID_LEN].copy_from_slice(session_id);

    let mut padding = [0u8; MAX_PADDING_LEN];
    rng.fill_bytes(&mut padding[..padding_len]);

    let mut packet = BytesMut::with_capacity(
        header_len + SEQUENCE_LEN + PAYLOAD_LEN_LEN + payload.len() + padding_len,
    );
    packet.put_slice(&header[..header_len]);
    packet.put_u64(sequence);
    packet.put_u16(payload.len() as u16);
    packet.put_slice(payload);
    packet.put_slice(&padding[..padding_len]);

    Ok(packet.to_vec())
}

/// Parses a stealth packet, returning the embedded session ID, sequence
/// number and the encrypted payload with trailing padding stripped.
pub fn decode(datagram: &[u8]) -> std::io::Result<DecodedPacket<'_>> {
    if datagram.len() < MIN_FAKE_HEADER_LEN + SEQUENCE_LEN + PAYLOAD_LEN_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("short stealth packet: {} bytes", datagram.len()),
        ));
    }

    let first_byte = datagram[0];
    if first_byte & 0xf0 != LONG_HEADER_BITS {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("not a long-header packet: first byte {:#04x}", first_byte),
        ));
    }

    let header_len = MIN_FAKE_HEADER_LEN + (first_byte & 0x0f) as usize;
    if header_len > MAX_FAKE_HEADER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid fake header length: {header_len}"),
        ));
    }
    if datagram.len() < header_len + SEQUENCE_LEN + PAYLOAD_LEN_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stealth packet truncated before payload",
        ));
    }

    if datagram[CONNECTION_ID_LEN_OFFSET] as usize != SESSION_ID_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "unexpected connection ID length: {}",
                datagram[CONNECTION_ID_LEN_OFFSET]
            ),
        ));
    }

    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&datagram[SESSION_ID_OFFSET..SESSION_ID_OFFSET + SESSION_ID_LEN]);

    let sequence_end = header_len + SEQUENCE_LEN;
    let sequence = u64::from_be_bytes(datagram[header_len..sequence_end].try_into().unwrap());

    let payload_len =
        u16::from_be_bytes(datagram[sequence_end..sequence_end + 2].try_into().unwrap()) as usize;
    let rest = &datagram[sequence_end + PAYLOAD_LEN_LEN..];
    if payload_len > rest.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "stealth packet payload truncated: expected {payload_len}, have {}",
                rest.len()
            ),
        ));
    }

    Ok(DecodedPacket {
        session_id,
        sequence,
        payload: &rest[..payload_len],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let session_id = [1, 2, 3, 4, 5, 6, 7, 8];
        let payload = b"nonce-and-ciphertext-and-tag";

        for sequence in [0u64, 1, u64::MAX, 1_700_000_000_000_000_000] {
            let packet = encode(&session_id, sequence, payload).unwrap();
            let decoded = decode(&packet).unwrap();
            assert_eq!(decoded.session_id, session_id);
            assert_eq!(decoded.sequence, sequence);
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn test_header_and_padding_bounds() {
        let session_id = [9u8; SESSION_ID_LEN];
        let payload = [0xabu8; 40];

        for _ in 0..200 {
            let packet = encode(&session_id, 7, &payload).unwrap();

            let header_len = MIN_FAKE_HEADER_LEN + (packet[0] & 0x0f) as usize;
            assert!((MIN_FAKE_HEADER_LEN..=MAX_FAKE_HEADER_LEN).contains(&header_len));
            assert_eq!(packet[0] & 0xf0, 0xc0);

            let padding_len =
                packet.len() - header_len - SEQUENCE_LEN - PAYLOAD_LEN_LEN - payload.len();
            assert!(padding_len <= MAX_PADDING_LEN);

            // Padding lives after the payload and is not part of it.
            assert_eq!(decode(&packet).unwrap().payload, payload);
        }
    }

    #[test]
    fn test_decode_rejects_short_packet() {
        let err = decode(&[0xc0; 10]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let err = decode(&[]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_rejects_non_long_header() {
        let packet = encode(&[0u8; SESSION_ID_LEN], 1, b"payload").unwrap();
        let mut tampered = packet.clone();
        tampered[0] = 0x40; // short header form
        assert_eq!(
            decode(&tampered).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_decode_rejects_length_nibble_overflow() {
        let mut packet = encode(&[0u8; SESSION_ID_LEN], 1, &[0u8; 60]).unwrap();
        packet[0] = 0xc0 | 0x0f; // would mean a 33-byte header
        assert_eq!(
            decode(&packet).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_decode_rejects_overrunning_payload_length() {
        let mut packet = encode(&[0u8; SESSION_ID_LEN], 1, b"tiny").unwrap();
        let header_len = MIN_FAKE_HEADER_LEN + (packet[0] & 0x0f) as usize;
        let len_offset = header_len + SEQUENCE_LEN;
        packet[len_offset] = 0xff;
        packet[len_offset + 1] = 0xff;
        assert_eq!(
            decode(&packet).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_decode_rejects_bad_connection_id_length() {
        let mut packet = encode(&[0u8; SESSION_ID_LEN], 1, b"payload").unwrap();
        packet[CONNECTION_ID_LEN_OFFSET] = 20;
        assert_eq!(
            decode(&packet).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(encode(&[0u8; SESSION_ID_LEN], 1, &payload).is_err());
    }
}
