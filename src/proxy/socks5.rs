//! SOCKS5 client handshake (RFC 1928, RFC 1929 for username/password)

use super::{Address, ProxyError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password subnegotiation version
const AUTH_VERSION: u8 = 0x01;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Human readable reply code
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
        _ => "unknown reply",
    }
}

/// Ask the proxy on `stream` to CONNECT to `target`
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &Address,
    credentials: Option<&(String, String)>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting
    let method = if credentials.is_some() {
        AuthMethod::UsernamePassword
    } else {
        AuthMethod::NoAuth
    };
    stream.write_all(&[SOCKS_VERSION, 1, method as u8]).await?;

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    if buf[1] == AuthMethod::NoAcceptable as u8 || buf[1] != method as u8 {
        return Err(ProxyError::NoAcceptableAuth);
    }

    if let Some((username, password)) = credentials {
        if username.len() > 255 || password.len() > 255 {
            return Err(ProxyError::InvalidAddress(
                "credentials longer than 255 bytes".to_string(),
            ));
        }
        let mut auth = Vec::with_capacity(3 + username.len() + password.len());
        auth.push(AUTH_VERSION);
        auth.push(username.len() as u8);
        auth.extend_from_slice(username.as_bytes());
        auth.push(password.len() as u8);
        auth.extend_from_slice(password.as_bytes());
        stream.write_all(&auth).await?;

        stream.read_exact(&mut buf).await?;
        if buf[1] != 0x00 {
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    stream.write_all(&make_request(target)?).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(head[0]));
    }
    if head[1] != 0x00 {
        return Err(ProxyError::Refused(reply_message(head[1]).to_string()));
    }

    let bound_len = match AddressType::try_from(head[3])? {
        AddressType::Ipv4 => 4,
        AddressType::Ipv6 => 16,
        AddressType::Domain => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    debug!("SOCKS5 CONNECT to {} established", target);
    Ok(())
}

fn make_request(target: &Address) -> Result<Vec<u8>, ProxyError> {
    let mut buf = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match target {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            if domain.len() > 255 {
                return Err(ProxyError::InvalidAddress(domain.clone()));
            }
            buf.push(AddressType::Domain as u8);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_request() {
        let request = make_request(&Address::Domain("example.com".into(), 443)).unwrap();
        assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
        assert_eq!(&request[5..16], b"example.com");
        assert_eq!(&request[16..], &443u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_connect_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x01, 0xbb]);
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        socks5_connect(&mut client, &Address::Ipv4([10, 0, 0, 1], 443), None)
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 9];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x02pw");
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let creds = ("user".to_string(), "pw".to_string());
        socks5_connect(&mut client, &Address::Ipv4([10, 0, 0, 1], 22), Some(&creds))
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(&mut client, &Address::Ipv4([10, 0, 0, 1], 22), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Refused(ref m) if m == "connection refused"));
    }
}
