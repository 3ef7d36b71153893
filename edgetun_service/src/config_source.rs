//! Source of the startup tunnel configuration.

use edgetun_uapi::{ConfigurationError, Key, Peer, PrivateKey, TunnelConfiguration};
use ipnet::IpNet;
use shared_utils::config::{PeerConfig, TunnelConfig};
use std::net::SocketAddr;

/// Supplies the tunnel configuration once, at startup.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<TunnelConfiguration, ConfigurationError>;
}

/// Builds the tunnel configuration from the `[tunnel]` section of the
/// service configuration file.
#[derive(Debug, Clone)]
pub struct TomlConfigSource {
    section: TunnelConfig,
}

impl TomlConfigSource {
    pub fn new(section: TunnelConfig) -> Self {
        Self { section }
    }
}

impl ConfigSource for TomlConfigSource {
    fn load(&self) -> Result<TunnelConfiguration, ConfigurationError> {
        let section = &self.section;
        let mut config = TunnelConfiguration::new(section.name.trim());
        config.listen_port = section.listen_port;

        if let Some(encoded) = &section.private_key {
            config.private_key = Some(PrivateKey::new(parse_key("tunnel.private_key", encoded)?));
        }

        for (i, peer) in section.peers.iter().enumerate() {
            config.peers.push(convert_peer(i, peer)?);
        }

        // Repeated ranges in the file are tolerated and collapsed
        config.dedup_network_entries();
        config.validate()?;
        Ok(config)
    }
}

fn convert_peer(i: usize, peer: &PeerConfig) -> Result<Peer, ConfigurationError> {
    let prefix = format!("tunnel.peers[{i}]");
    let mut converted = Peer::new(parse_key(&format!("{prefix}.public_key"), &peer.public_key)?);

    for range in &peer.allowed_ips {
        let net: IpNet = range.trim().parse().map_err(|_| invalid(
            &format!("{prefix}.allowed_ips"),
            format!("{range:?} is not a CIDR range"),
        ))?;
        converted.allowed_ips.push(net);
    }

    if let Some(endpoint) = &peer.endpoint {
        let addr: SocketAddr = endpoint.trim().parse().map_err(|_| invalid(
            &format!("{prefix}.endpoint"),
            format!("{endpoint:?} is not an address:port"),
        ))?;
        converted.endpoint = Some(addr);
    }

    converted.persistent_keepalive = peer.persistent_keepalive.filter(|s| *s != 0);
    Ok(converted)
}

fn parse_key(key: &str, encoded: &str) -> Result<Key, ConfigurationError> {
    Key::from_base64(encoded).ok_or_else(|| invalid(key, "expected a base64 encoded 32-byte key".to_string()))
}

fn invalid(key: &str, message: String) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        key: key.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_KEY: &str = "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=";

    fn section(peers: Vec<PeerConfig>) -> TunnelConfig {
        TunnelConfig {
            name: "ZitiTUN".to_string(),
            listen_port: 51820,
            private_key: Some("AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=".to_string()),
            peers,
            ..Default::default()
        }
    }

    fn peer(allowed_ips: &[&str]) -> PeerConfig {
        PeerConfig {
            public_key: PEER_KEY.to_string(),
            allowed_ips: allowed_ips.iter().map(|s| s.to_string()).collect(),
            endpoint: Some("192.0.2.1:51820".to_string()),
            persistent_keepalive: Some(0),
        }
    }

    #[test]
    fn converts_and_deduplicates_ranges() {
        let source = TomlConfigSource::new(section(vec![peer(&[
            "10.0.0.0/24",
            "10.0.0.5/24",
            "fd00::/64",
        ])]));

        let config = source.load().unwrap();

        assert_eq!(config.interface_name, "ZitiTUN");
        assert!(config.private_key.is_some());
        let peer = &config.peers[0];
        assert_eq!(peer.public_key.to_base64(), PEER_KEY);
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.persistent_keepalive, None);
        assert_eq!(peer.endpoint, Some("192.0.2.1:51820".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_values() {
        let source = TomlConfigSource::new(section(vec![peer(&["10.0.0.0/33"])]));
        assert!(matches!(
            source.load(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        let mut bad_key = peer(&[]);
        bad_key.public_key = "short".to_string();
        assert!(TomlConfigSource::new(section(vec![bad_key])).load().is_err());
    }

    #[test]
    fn rejects_duplicate_peers() {
        let source = TomlConfigSource::new(section(vec![peer(&[]), peer(&[])]));
        assert!(matches!(
            source.load(),
            Err(ConfigurationError::DuplicatePeer(_))
        ));
    }
}
