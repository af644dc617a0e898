//! Connect and reconnect URLs

use super::{Destination, TunnelTarget};
use crate::protocol::{CONNECT_ENDPOINT, RECONNECT_ENDPOINT, TUNNEL_HOST, URL_PATH_ROOT, URL_SCHEME};
use crate::tunnel::TunnelError;
use url::Url;

/// URL opening a fresh session to the target
pub fn connect_url(target: &TunnelTarget) -> Result<Url, TunnelError> {
    target.validate()?;
    let mut url = base_url(target, CONNECT_ENDPOINT)?;
    match &target.destination {
        Destination::Instance {
            project,
            zone,
            instance,
            interface,
            port,
        } => {
            url.query_pairs_mut()
                .append_pair("project", project)
                .append_pair("zone", zone)
                .append_pair("instance", instance)
                .append_pair("interface", interface)
                .append_pair("port", &port.to_string());
        }
        Destination::Network {
            project,
            region,
            network,
            host,
            port,
        } => {
            url.query_pairs_mut()
                .append_pair("project", project)
                .append_pair("region", region)
                .append_pair("network", network)
                .append_pair("host", host)
                .append_pair("port", &port.to_string());
        }
        Destination::Raw { query } => url.set_query(Some(query.trim_start_matches('?'))),
    }
    Ok(url)
}

/// URL resuming session `sid`, telling the gateway how much we received
pub fn reconnect_url(target: &TunnelTarget, sid: &[u8], ack: u64) -> Result<Url, TunnelError> {
    let mut url = base_url(target, RECONNECT_ENDPOINT)?;
    url.query_pairs_mut()
        .append_pair("sid", &hex::encode(sid))
        .append_pair("ack", &ack.to_string());
    Ok(url)
}

/// Headers sent with every upgrade request
pub fn handshake_headers(user_agent: &str, token: &str) -> Vec<(String, String)> {
    vec![
        ("User-Agent".to_string(), user_agent.to_string()),
        ("Authorization".to_string(), format!("Bearer {}", token)),
    ]
}

fn base_url(target: &TunnelTarget, endpoint: &str) -> Result<Url, TunnelError> {
    let mut url = Url::parse(&format!("{}://{}", URL_SCHEME, TUNNEL_HOST))
        .map_err(|e| TunnelError::InvalidTarget(e.to_string()))?;
    let mut root = URL_PATH_ROOT.to_string();

    if let Some(raw) = &target.url_override {
        let parsed = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("{}://{}", URL_SCHEME, raw))
        }
        .map_err(|e| TunnelError::InvalidTarget(format!("url override {}: {}", raw, e)))?;

        if !matches!(parsed.scheme(), "wss" | "ws") {
            return Err(TunnelError::InvalidTarget(format!(
                "url override scheme must be wss or ws: {}",
                raw
            )));
        }
        let path = parsed.path().trim_end_matches('/');
        if !path.is_empty() {
            root = path.to_string();
        }
        url = parsed;
        url.set_query(None);
        url.set_fragment(None);
    }

    url.set_path(&format!("{}/{}", root, endpoint));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TunnelTarget {
        TunnelTarget::instance("project-a", "zone-b", "instance-c", "nic0", 22)
    }

    #[test]
    fn test_connect_url() {
        let url = connect_url(&target()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://tunnel.cloudproxy.app/v4/connect?project=project-a&zone=zone-b\
             &instance=instance-c&interface=nic0&port=22"
        );
    }

    #[test]
    fn test_connect_url_network() {
        let target = TunnelTarget::network("project-a", "us-west1", "default", "10.1.2.3", 3389);
        let url = connect_url(&target).unwrap();
        assert_eq!(
            url.query(),
            Some("project=project-a&region=us-west1&network=default&host=10.1.2.3&port=3389")
        );
    }

    #[test]
    fn test_connect_url_raw_query() {
        let url = connect_url(&TunnelTarget::raw("?project=p&port=22&newflag=1")).unwrap();
        assert_eq!(url.query(), Some("project=p&port=22&newflag=1"));
    }

    #[test]
    fn test_reconnect_url() {
        let url = reconnect_url(&target(), b"I am a SID", 4096).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://tunnel.cloudproxy.app/v4/reconnect?sid=4920616d206120534944&ack=4096"
        );
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("sid".to_string(), hex::encode(b"I am a SID")));
        assert_eq!(pairs[1], ("ack".to_string(), "4096".to_string()));
    }

    #[test]
    fn test_url_override_host_only() {
        let target = target().with_url_override("wss://localhost:8443");
        let url = connect_url(&target).unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(8443));
        assert_eq!(url.path(), "/v4/connect");
        assert!(url.query().unwrap_or_default().contains("instance=instance-c"));
    }

    #[test]
    fn test_url_override_with_path() {
        let target = target().with_url_override("ws://127.0.0.1:9000/custom/root/");
        let url = reconnect_url(&target, b"\x01", 0).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/custom/root/reconnect");
        assert_eq!(url.query(), Some("sid=01&ack=0"));
    }

    #[test]
    fn test_url_override_without_scheme() {
        let url = connect_url(&target().with_url_override("gateway.example.com")).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("gateway.example.com"));
    }

    #[test]
    fn test_url_override_bad_scheme() {
        let target = target().with_url_override("https://example.com");
        assert!(matches!(connect_url(&target), Err(TunnelError::InvalidTarget(_))));
    }

    #[test]
    fn test_handshake_headers() {
        let headers = handshake_headers("agent/1.0", "abc");
        assert_eq!(headers[0], ("User-Agent".to_string(), "agent/1.0".to_string()));
        assert_eq!(headers[1], ("Authorization".to_string(), "Bearer abc".to_string()));
    }
}
