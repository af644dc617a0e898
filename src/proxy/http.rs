//! HTTP CONNECT client handshake

use super::{Address, ProxyError};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Longest response head we are willing to read
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Ask the proxy on `stream` to CONNECT to `target` and return the stream
/// once the proxy answered with a 2xx status.
pub async fn http_connect<S>(
    stream: S,
    target: &Address,
    credentials: Option<&(String, String)>,
) -> Result<S, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_request(target, credentials);
    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(request.as_bytes()).await?;

    // Status line
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = parse_status(&status_line)?;

    // Drain headers
    let mut consumed = status_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::InvalidResponse("unexpected EOF".to_string()));
        }
        consumed += n;
        if consumed > MAX_RESPONSE_HEAD {
            return Err(ProxyError::InvalidResponse("response head too long".to_string()));
        }
        if line.trim().is_empty() {
            break;
        }
    }

    match status {
        200..=299 => {}
        407 => return Err(ProxyError::AuthenticationFailed),
        other => return Err(ProxyError::Refused(format!("HTTP status {}", other))),
    }

    if !reader.buffer().is_empty() {
        return Err(ProxyError::InvalidResponse(
            "proxy sent data before the tunnel was established".to_string(),
        ));
    }

    debug!("HTTP CONNECT to {} established", target);
    Ok(reader.into_inner())
}

fn build_request(target: &Address, credentials: Option<&(String, String)>) -> String {
    let authority = target.to_string();
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some((username, password)) = credentials {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");
    request
}

fn parse_status(line: &str) -> Result<u16, ProxyError> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::InvalidResponse(line.trim().to_string()));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ProxyError::InvalidResponse(line.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_build_request_with_auth() {
        let creds = ("user".to_string(), "pass".to_string());
        let request = build_request(&Address::Domain("tunnel.cloudproxy.app".into(), 443), Some(&creds));
        assert!(request.starts_with("CONNECT tunnel.cloudproxy.app:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("HTTP/1.1 200 Connection established\r\n").unwrap(), 200);
        assert_eq!(parse_status("HTTP/1.0 407 Proxy Authentication Required").unwrap(), 407);
        assert!(parse_status("SSH-2.0-OpenSSH").is_err());
    }

    #[tokio::test]
    async fn test_connect_established() {
        let (client, mut server) = tokio::io::duplex(4096);

        let proxy = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("CONNECT 10.0.0.1:443 HTTP/1.1"));
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\nVia: test\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let stream = http_connect(client, &Address::Ipv4([10, 0, 0, 1], 443), None).await;
        assert!(stream.is_ok());
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_auth_required() {
        let (client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let err = http_connect(client, &Address::Ipv4([10, 0, 0, 1], 443), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AuthenticationFailed));
    }
}
