//! SOCKS5 CONNECT through Tor's SOCKS port
//!
//! Hostnames are always sent as domain names (ATYP 0x03) so that tor
//! resolves them, including `.onion` addresses.

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a stream to `host:port` via the SOCKS5 proxy at `proxy`
pub async fn connect(proxy: &str, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut socks = TcpStream::connect(proxy).await?;
    handshake(&mut socks, host, port).await?;
    debug!("SOCKS5 connection established to {}:{}", host, port);
    Ok(socks)
}

async fn handshake(socks: &mut TcpStream, host: &str, port: u16) -> io::Result<()> {
    // Greeting: version 5, one method, no auth
    socks.write_all(&[SOCKS_VERSION, 0x01, NO_AUTH]).await?;

    let mut response = [0u8; 2];
    socks.read_exact(&mut response).await?;
    if response != [SOCKS_VERSION, NO_AUTH] {
        return Err(protocol_error("SOCKS5 auth negotiation failed"));
    }

    socks.write_all(&connect_request(host, port)?).await?;

    // Reply header: version, reply code, reserved, address type
    let mut header = [0u8; 4];
    socks.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(protocol_error("invalid SOCKS5 response version"));
    }
    if header[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 connect failed: {}", reply_message(header[1])),
        ));
    }

    // Discard the bound address
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(socks.read_u8().await?),
        _ => return Err(protocol_error("invalid SOCKS5 bound address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    socks.read_exact(&mut bound).await?;
    Ok(())
}

fn connect_request(host: &str, port: u16) -> io::Result<Vec<u8>> {
    let domain = host.as_bytes();
    let domain_len = u8::try_from(domain.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("hostname length must be 1-255 bytes: {:?}", host),
            )
        })?;

    let mut request = Vec::with_capacity(7 + domain.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain_len]);
    request.extend_from_slice(domain);
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn protocol_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
