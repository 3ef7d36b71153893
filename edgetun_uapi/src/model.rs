//! Tunnel configuration data model.
//!
//! A [`TunnelConfiguration`] is a plain value. Reconfiguration never mutates
//! a configuration that has been handed out; [`TunnelConfiguration::apply`]
//! returns a new snapshot which the owner swaps in as a whole.

use crate::error::{ConfigurationError, ProtocolError, ProtocolResult};
use crate::messages::{GetScope, PeerUpdate, SetOperation};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::IpNet;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Length in bytes of public and private keys.
pub const KEY_LEN: usize = 32;

/// Longest interface name accepted (Linux IFNAMSIZ minus the terminator).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// A 32-byte curve key. Displayed as base64, sent on the wire as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parse the lowercase hex form used by the control protocol.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the base64 form used in configuration files.
    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = BASE64.decode(s.trim()).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Key(arr))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_base64())
    }
}

impl FromStr for Key {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_base64(s).ok_or_else(|| ProtocolError::invalid("key", s))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

/// The local private key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(Key);

impl PrivateKey {
    pub fn new(key: Key) -> Self {
        PrivateKey(key)
    }

    pub fn key(&self) -> &Key {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// A remote peer of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub public_key: Key,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
}

impl Peer {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    pub fn with_allowed_ip(mut self, net: IpNet) -> Self {
        self.add_allowed_ip(net);
        self
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = (seconds != 0).then_some(seconds);
        self
    }

    /// Add a range, masking host bits and skipping ranges already present.
    pub fn add_allowed_ip(&mut self, net: IpNet) {
        let net = net.trunc();
        if !self.allowed_ips.contains(&net) {
            self.allowed_ips.push(net);
        }
    }

    fn dedup_allowed_ips(&mut self) {
        let mut seen = HashSet::new();
        self.allowed_ips = self
            .allowed_ips
            .iter()
            .map(IpNet::trunc)
            .filter(|net| seen.insert(*net))
            .collect();
    }
}

/// Complete configuration of one tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfiguration {
    pub interface_name: String,
    pub listen_port: u16,
    #[serde(skip)]
    pub private_key: Option<PrivateKey>,
    pub peers: Vec<Peer>,
}

impl TunnelConfiguration {
    /// An empty configuration for the named interface.
    pub fn new(interface_name: impl Into<String>) -> Self {
        Self {
            interface_name: interface_name.into(),
            listen_port: 0,
            private_key: None,
            peers: Vec::new(),
        }
    }

    pub fn peer(&self, public_key: &Key) -> Option<&Peer> {
        self.peers.iter().find(|p| p.public_key == *public_key)
    }

    /// Check the invariants every applied snapshot must hold.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_interface_name(&self.interface_name)?;

        let mut keys = HashSet::new();
        for peer in &self.peers {
            if !keys.insert(peer.public_key) {
                return Err(ConfigurationError::DuplicatePeer(peer.public_key));
            }
        }
        Ok(())
    }

    /// Remove repeated allowed ranges inside each peer, keeping first occurrences.
    pub fn dedup_network_entries(&mut self) {
        for peer in &mut self.peers {
            peer.dedup_allowed_ips();
        }
    }

    /// Produce the snapshot that results from applying `ops` to this one.
    ///
    /// `self` is left untouched; on error nothing is produced.
    pub fn apply(&self, ops: &[SetOperation]) -> Result<TunnelConfiguration, ConfigurationError> {
        let mut next = self.clone();
        for op in ops {
            match op {
                SetOperation::PrivateKey(key) => next.private_key = key.clone(),
                SetOperation::ListenPort(port) => next.listen_port = *port,
                SetOperation::ReplacePeers => next.peers.clear(),
                SetOperation::Peer(update) => next.apply_peer(update),
            }
        }
        next.dedup_network_entries();
        next.validate()?;
        Ok(next)
    }

    fn apply_peer(&mut self, update: &PeerUpdate) {
        if update.remove {
            self.peers.retain(|p| p.public_key != update.public_key);
            return;
        }

        let index = match self
            .peers
            .iter()
            .position(|p| p.public_key == update.public_key)
        {
            Some(index) => index,
            None if update.update_only => return,
            None => {
                self.peers.push(Peer::new(update.public_key));
                self.peers.len() - 1
            }
        };

        let peer = &mut self.peers[index];
        if let Some(endpoint) = update.endpoint {
            peer.endpoint = Some(endpoint);
        }
        if let Some(seconds) = update.persistent_keepalive {
            peer.persistent_keepalive = (seconds != 0).then_some(seconds);
        }
        if update.replace_allowed_ips {
            peer.allowed_ips.clear();
        }
        for net in &update.allowed_ips {
            peer.add_allowed_ip(*net);
        }
    }

    /// Operations that turn any configuration into exactly this one.
    pub fn to_set_operations(&self) -> Vec<SetOperation> {
        let mut ops = vec![
            SetOperation::PrivateKey(self.private_key.clone()),
            SetOperation::ListenPort(self.listen_port),
            SetOperation::ReplacePeers,
        ];
        ops.extend(self.peers.iter().map(|p| SetOperation::Peer(PeerUpdate::from_peer(p))));
        ops
    }

    /// `key=value` pairs answering a get request.
    pub fn get_entries(&self, scope: GetScope) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        if scope == GetScope::All {
            if let Some(key) = &self.private_key {
                entries.push(("private_key".to_string(), key.key().to_hex()));
            }
            entries.push(("listen_port".to_string(), self.listen_port.to_string()));
        }

        for peer in &self.peers {
            entries.push(("public_key".to_string(), peer.public_key.to_hex()));
            if let Some(endpoint) = peer.endpoint {
                entries.push(("endpoint".to_string(), endpoint.to_string()));
            }
            if let Some(seconds) = peer.persistent_keepalive {
                entries.push((
                    "persistent_keepalive_interval".to_string(),
                    seconds.to_string(),
                ));
            }
            for net in &peer.allowed_ips {
                entries.push(("allowed_ip".to_string(), net.to_string()));
            }
        }
        entries
    }

    /// Rebuild a configuration from get response pairs. Unknown keys are ignored.
    pub fn from_get_entries(
        interface_name: &str,
        entries: &[(String, String)],
    ) -> ProtocolResult<Self> {
        let mut config = TunnelConfiguration::new(interface_name);
        let mut current: Option<Peer> = None;

        for (key, value) in entries {
            match (key.as_str(), current.as_mut()) {
                ("private_key", _) => {
                    config.private_key = parse_private_key(key, value)?;
                }
                ("listen_port", _) => {
                    config.listen_port = parse_number(key, value)?;
                }
                ("public_key", _) => {
                    if let Some(peer) = current.take() {
                        config.peers.push(peer);
                    }
                    current = Some(Peer::new(parse_hex_key(key, value)?));
                }
                ("endpoint", Some(peer)) => {
                    peer.endpoint = Some(parse_endpoint(key, value)?);
                }
                ("persistent_keepalive_interval", Some(peer)) => {
                    let seconds: u16 = parse_number(key, value)?;
                    peer.persistent_keepalive = (seconds != 0).then_some(seconds);
                }
                ("allowed_ip", Some(peer)) => {
                    peer.add_allowed_ip(parse_allowed_ip(key, value)?);
                }
                _ => {}
            }
        }

        if let Some(peer) = current.take() {
            config.peers.push(peer);
        }
        Ok(config)
    }
}

/// Interface names are also used to derive the control socket path.
pub fn validate_interface_name(name: &str) -> Result<(), ConfigurationError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";

    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidValue {
            key: "interface_name".to_string(),
            message: format!(
                "{name:?} must be 1-{MAX_INTERFACE_NAME_LEN} characters of [A-Za-z0-9._-]"
            ),
        })
    }
}

pub(crate) fn parse_hex_key(key: &str, value: &str) -> ProtocolResult<Key> {
    Key::from_hex(value).ok_or_else(|| ProtocolError::invalid(key, value))
}

pub(crate) fn parse_private_key(key: &str, value: &str) -> ProtocolResult<Option<PrivateKey>> {
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = parse_hex_key(key, value)?;
    Ok((!parsed.is_zero()).then(|| PrivateKey::new(parsed)))
}

pub(crate) fn parse_number<T: FromStr>(key: &str, value: &str) -> ProtocolResult<T> {
    value.parse().map_err(|_| ProtocolError::invalid(key, value))
}

pub(crate) fn parse_endpoint(key: &str, value: &str) -> ProtocolResult<SocketAddr> {
    value.parse().map_err(|_| ProtocolError::invalid(key, value))
}

pub(crate) fn parse_allowed_ip(key: &str, value: &str) -> ProtocolResult<IpNet> {
    value
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| ProtocolError::invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Key {
        Key::from_bytes([byte; KEY_LEN])
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn key_encodings() {
        let k = key(0xab);
        assert_eq!(Key::from_hex(&k.to_hex()), Some(k));
        assert_eq!(Key::from_base64(&k.to_base64()), Some(k));
        assert_eq!(Key::from_hex("abcd"), None);
        assert_eq!(Key::from_base64("not base64!"), None);
        assert!(Key::from_bytes([0; KEY_LEN]).is_zero());
    }

    #[test]
    fn private_key_is_redacted() {
        let pk = PrivateKey::new(key(7));
        let printed = format!("{:?}", pk);
        assert!(!printed.contains(&key(7).to_base64()));
    }

    #[test]
    fn allowed_ranges_are_masked_and_deduplicated() {
        let mut config = TunnelConfiguration::new("tun0");
        config.peers.push(Peer {
            public_key: key(1),
            allowed_ips: vec![net("10.0.0.1/24"), net("10.0.0.0/24"), net("fd00::/64")],
            endpoint: None,
            persistent_keepalive: None,
        });

        config.dedup_network_entries();

        assert_eq!(
            config.peers[0].allowed_ips,
            vec![net("10.0.0.0/24"), net("fd00::/64")]
        );
    }

    #[test]
    fn apply_leaves_original_untouched() {
        let original = TunnelConfiguration::new("tun0");
        let ops = vec![
            SetOperation::ListenPort(51820),
            SetOperation::Peer(PeerUpdate {
                allowed_ips: vec![net("10.0.0.0/24")],
                ..PeerUpdate::new(key(1))
            }),
        ];

        let next = original.apply(&ops).unwrap();

        assert_eq!(original.listen_port, 0);
        assert!(original.peers.is_empty());
        assert_eq!(next.listen_port, 51820);
        assert_eq!(next.peer(&key(1)).unwrap().allowed_ips, vec![net("10.0.0.0/24")]);
    }

    #[test]
    fn apply_peer_update_semantics() {
        let base = TunnelConfiguration::new("tun0")
            .apply(&[
                SetOperation::Peer(PeerUpdate {
                    allowed_ips: vec![net("10.0.0.0/24")],
                    persistent_keepalive: Some(25),
                    ..PeerUpdate::new(key(1))
                }),
                SetOperation::Peer(PeerUpdate::new(key(2))),
            ])
            .unwrap();

        // update_only never creates a peer
        let next = base
            .apply(&[SetOperation::Peer(PeerUpdate {
                update_only: true,
                ..PeerUpdate::new(key(3))
            })])
            .unwrap();
        assert_eq!(next.peers.len(), 2);

        // replace_allowed_ips clears before adding, keepalive 0 disables
        let next = base
            .apply(&[SetOperation::Peer(PeerUpdate {
                replace_allowed_ips: true,
                allowed_ips: vec![net("192.168.0.0/16")],
                persistent_keepalive: Some(0),
                ..PeerUpdate::new(key(1))
            })])
            .unwrap();
        let peer = next.peer(&key(1)).unwrap();
        assert_eq!(peer.allowed_ips, vec![net("192.168.0.0/16")]);
        assert_eq!(peer.persistent_keepalive, None);

        // remove drops the peer
        let next = base
            .apply(&[SetOperation::Peer(PeerUpdate {
                remove: true,
                ..PeerUpdate::new(key(2))
            })])
            .unwrap();
        assert!(next.peer(&key(2)).is_none());

        // replace_peers starts from an empty peer list
        let next = base.apply(&[SetOperation::ReplacePeers]).unwrap();
        assert!(next.peers.is_empty());
    }

    #[test]
    fn validate_rejects_duplicate_peers() {
        let mut config = TunnelConfiguration::new("tun0");
        config.peers.push(Peer::new(key(1)));
        config.peers.push(Peer::new(key(1)));

        assert_eq!(config.validate(), Err(ConfigurationError::DuplicatePeer(key(1))));
    }

    #[test]
    fn interface_names() {
        assert!(validate_interface_name("ZitiTUN").is_ok());
        assert!(validate_interface_name("wg-edge_0.1").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("../etc").is_err());
        assert!(validate_interface_name("a-very-long-interface").is_err());
    }

    #[test]
    fn get_entries_peers_scope_skips_interface_keys() {
        let config = TunnelConfiguration {
            private_key: Some(PrivateKey::new(key(9))),
            listen_port: 51820,
            ..TunnelConfiguration::new("tun0")
        };

        let all = config.get_entries(GetScope::All);
        assert!(all.iter().any(|(k, _)| k == "private_key"));
        assert!(config.get_entries(GetScope::Peers).is_empty());
    }

    #[test]
    fn from_get_entries_ignores_unknown_keys() {
        let entries = vec![
            ("listen_port".to_string(), "51820".to_string()),
            ("fwmark".to_string(), "0".to_string()),
            ("public_key".to_string(), key(1).to_hex()),
            ("rx_bytes".to_string(), "1024".to_string()),
            ("allowed_ip".to_string(), "10.0.0.0/24".to_string()),
            ("last_handshake_time_sec".to_string(), "0".to_string()),
        ];

        let config = TunnelConfiguration::from_get_entries("tun0", &entries).unwrap();

        assert_eq!(config.listen_port, 51820);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].allowed_ips, vec![net("10.0.0.0/24")]);
    }
}
