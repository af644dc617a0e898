//! Tunnel destinations

use crate::proxy::ProxyInfo;
use crate::transport::TlsPolicy;
use crate::tunnel::TunnelError;
use serde::{Deserialize, Serialize};

/// What the gateway should connect the tunnel to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    /// A port on a VM network interface
    Instance {
        project: String,
        zone: String,
        instance: String,
        interface: String,
        port: u16,
    },
    /// A host address inside a VPC network, reached through a region
    Network {
        project: String,
        region: String,
        network: String,
        host: String,
        port: u16,
    },
    /// Pre-composed, already encoded query string
    Raw { query: String },
}

/// Everything that identifies where and how a session connects.
/// Immutable once a session is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTarget {
    pub destination: Destination,
    /// Replaces scheme and host, and the path root when it has one
    #[serde(default)]
    pub url_override: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyInfo>,
    #[serde(default)]
    pub tls: TlsPolicy,
}

impl TunnelTarget {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            url_override: None,
            proxy: None,
            tls: TlsPolicy::Verify,
        }
    }

    /// Target a port on an instance interface
    pub fn instance(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        interface: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::new(Destination::Instance {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            interface: interface.into(),
            port,
        })
    }

    /// Target a host address through a region and network
    pub fn network(
        project: impl Into<String>,
        region: impl Into<String>,
        network: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self::new(Destination::Network {
            project: project.into(),
            region: region.into(),
            network: network.into(),
            host: host.into(),
            port,
        })
    }

    /// Target described by a ready-made query string
    pub fn raw(query: impl Into<String>) -> Self {
        Self::new(Destination::Raw {
            query: query.into(),
        })
    }

    pub fn with_url_override(mut self, url: impl Into<String>) -> Self {
        self.url_override = Some(url.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyInfo) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Reject targets with missing identity fields
    pub fn validate(&self) -> Result<(), TunnelError> {
        let fields: Vec<(&str, &str)> = match &self.destination {
            Destination::Instance {
                project,
                zone,
                instance,
                interface,
                ..
            } => vec![
                ("project", project),
                ("zone", zone),
                ("instance", instance),
                ("interface", interface),
            ],
            Destination::Network {
                project,
                region,
                network,
                host,
                ..
            } => vec![
                ("project", project),
                ("region", region),
                ("network", network),
                ("host", host),
            ],
            Destination::Raw { query } => vec![("query", query)],
        };

        match fields.iter().find(|(_, value)| value.is_empty()) {
            Some((name, _)) => Err(TunnelError::InvalidTarget(format!("{} is empty", name))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(TunnelTarget::instance("p", "z", "i", "nic0", 22).validate().is_ok());
        let err = TunnelTarget::network("p", "r", "", "10.0.0.1", 22)
            .validate()
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid target: network is empty");
        assert!(TunnelTarget::raw("").validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let target = TunnelTarget::instance("p", "z", "i", "nic0", 22)
            .with_url_override("wss://localhost:8443")
            .with_tls(TlsPolicy::SkipVerify)
            .with_proxy(ProxyInfo::http("proxy", 3128));
        assert_eq!(target.url_override.as_deref(), Some("wss://localhost:8443"));
        assert_eq!(target.tls, TlsPolicy::SkipVerify);
        assert_eq!(target.proxy.map(|p| p.port), Some(3128));
    }

    #[test]
    fn test_toml_round_trip() {
        let targets = [
            TunnelTarget::instance("p", "z", "i", "nic0", 22),
            TunnelTarget::network("p", "r", "default", "10.0.0.1", 22),
            TunnelTarget::raw("project=p&port=22").with_tls(TlsPolicy::SkipVerify),
        ];
        for target in targets {
            let text = toml::to_string(&target).unwrap();
            let parsed: TunnelTarget = toml::from_str(&text).unwrap();
            assert_eq!(parsed, target);
        }

        let text = toml::to_string(&TunnelTarget::raw("project=p&port=22")).unwrap();
        assert!(text.contains("type = \"raw\""));
        assert!(text.contains("query = \"project=p&port=22\""));
    }
}
