// Minimal SOCKS5 ingress: a single IPv4 CONNECT request read in one
// shot, no greeting or method negotiation, no domain or IPv6 addressing,
// no BIND/UDP-ASSOCIATE. Anything else closes the connection without a
// SOCKS5 error reply.

use std::net::Ipv4Addr;

pub const VER_SOCKS5: u8 = 0x05;
pub const CMD_CONNECT: u8 = 0x01;
pub const ADDR_TYPE_IPV4: u8 = 0x01;

/// Version byte, command, reserved, address type, 4-byte IPv4 address.
const MIN_REQUEST_LEN: usize = 8;
const ADDR_OFFSET: usize = 4;
const PORT_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: Ipv4Addr,
    pub port: u16,
}

pub fn parse_connect_request(buf: &[u8]) -> std::io::Result<ConnectRequest> {
    if buf.len() < MIN_REQUEST_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("truncated SOCKS5 request: {} bytes", buf.len()),
        ));
    }
    if buf[0] != VER_SOCKS5 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version: {:#04x}", buf[0]),
        ));
    }
    if buf[1] != CMD_CONNECT {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported SOCKS command: {:#04x}", buf[1]),
        ));
    }
    if buf[3] != ADDR_TYPE_IPV4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported address type: {:#04x}", buf[3]),
        ));
    }
    if buf.len() < PORT_OFFSET + 2 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "SOCKS5 request missing destination port",
        ));
    }

    let address = Ipv4Addr::new(
        buf[ADDR_OFFSET],
        buf[ADDR_OFFSET + 1],
        buf[ADDR_OFFSET + 2],
        buf[ADDR_OFFSET + 3],
    );
    let port = u16::from_be_bytes([buf[PORT_OFFSET], buf[PORT_OFFSET + 1]]);

    Ok(ConnectRequest { address, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_ipv4_connect() {
        let request = parse_connect_request(&[
            0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x04, 0x38,
        ])
        .unwrap();
        assert_eq!(request.address, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(request.port, 1080);
    }

    #[test]
    fn test_rejects_socks4() {
        let err = parse_connect_request(&[
            0x04, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x04, 0x38,
        ])
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_rejects_non_connect_commands() {
        // BIND and UDP-ASSOCIATE
        for cmd in [0x02, 0x03] {
            let err = parse_connect_request(&[
                0x05, cmd, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x04, 0x38,
            ])
            .unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn test_rejects_domain_and_ipv6_address_types() {
        for addr_type in [0x03, 0x04] {
            let err = parse_connect_request(&[
                0x05, 0x01, 0x00, addr_type, 0x7f, 0x00, 0x00, 0x01, 0x04, 0x38,
            ])
            .unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn test_rejects_short_requests() {
        assert!(parse_connect_request(&[]).is_err());
        assert!(parse_connect_request(&[0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00]).is_err());
        // Long enough for the address but not the port.
        assert!(
            parse_connect_request(&[0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x04])
                .is_err()
        );
    }
}
