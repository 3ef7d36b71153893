//! Host firewall and routing policy
//!
//! The watcher computes a [`DesiredPolicy`] from the adapter identity and the
//! running configuration, and hands it to a [`FirewallInstaller`]. Rule
//! primitives live behind the trait; `NftFirewall` drives `nft` and `ip`.

use crate::command::{run_command, run_command_with_input, CommandError};
use crate::device::AdapterIdentity;
use async_trait::async_trait;
use edgetun_uapi::TunnelConfiguration;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

const NFT_TABLE: &str = "edgetun";

/// Result type for firewall operations
pub type FirewallResult<T> = Result<T, FirewallError>;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Firewall command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Firewall is not enabled")]
    NotEnabled,
}

/// Firewall and routing state the host should have for the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPolicy {
    pub interface: String,
    /// System index, or `None` while the adapter is absent
    pub index: Option<u32>,
    pub listen_port: u16,
    /// Union of all peers' allowed ranges
    pub routes: BTreeSet<IpNet>,
}

impl DesiredPolicy {
    pub fn compute(
        identity: &AdapterIdentity,
        present: bool,
        config: &TunnelConfiguration,
    ) -> Self {
        let routes = config
            .peers
            .iter()
            .flat_map(|peer| peer.allowed_ips.iter().copied())
            .collect();

        Self {
            interface: identity.name().to_string(),
            index: present.then(|| identity.index()),
            listen_port: config.listen_port,
            routes,
        }
    }

    /// nftables script replacing the `inet edgetun` table.
    ///
    /// Traffic to a routed range may only leave through the tunnel
    /// interface; the listen port accepts inbound UDP.
    pub fn nft_ruleset(&self) -> String {
        let mut script = String::new();
        let _ = writeln!(script, "table inet {NFT_TABLE}");
        let _ = writeln!(script, "delete table inet {NFT_TABLE}");
        let _ = writeln!(script, "table inet {NFT_TABLE} {{");

        let _ = writeln!(script, "  chain input {{");
        let _ = writeln!(script, "    type filter hook input priority 0; policy accept;");
        if self.listen_port != 0 {
            let _ = writeln!(script, "    udp dport {} accept", self.listen_port);
        }
        let _ = writeln!(script, "  }}");

        let _ = writeln!(script, "  chain output {{");
        let _ = writeln!(script, "    type filter hook output priority 0; policy accept;");
        let _ = writeln!(script, "    oifname \"{}\" accept", self.interface);
        for route in &self.routes {
            let family = match route {
                IpNet::V4(_) => "ip",
                IpNet::V6(_) => "ip6",
            };
            let _ = writeln!(script, "    {family} daddr {route} drop");
        }
        let _ = writeln!(script, "  }}");
        let _ = writeln!(script, "}}");
        script
    }
}

/// Installs and removes host policy for the tunnel.
#[async_trait]
pub trait FirewallInstaller: Send + Sync {
    /// Install the base policy for the adapter. Called once during startup.
    async fn enable(&self, identity: &AdapterIdentity) -> FirewallResult<()>;

    /// Bring host state in line with `policy`.
    async fn reconcile(&self, policy: &DesiredPolicy) -> FirewallResult<()>;

    /// Remove everything `enable` and `reconcile` installed.
    async fn disable(&self) -> FirewallResult<()>;
}

/// Installer that leaves the host untouched.
#[derive(Debug, Default)]
pub struct NoopFirewall;

#[async_trait]
impl FirewallInstaller for NoopFirewall {
    async fn enable(&self, identity: &AdapterIdentity) -> FirewallResult<()> {
        debug!("Firewall disabled by configuration, not installing rules for {}", identity.name());
        Ok(())
    }

    async fn reconcile(&self, _policy: &DesiredPolicy) -> FirewallResult<()> {
        Ok(())
    }

    async fn disable(&self) -> FirewallResult<()> {
        Ok(())
    }
}

/// nftables plus `ip route` installer.
#[derive(Debug, Default)]
pub struct NftFirewall {
    applied: Mutex<Option<DesiredPolicy>>,
}

impl NftFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn applied(&self) -> Option<DesiredPolicy> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, policy: Option<DesiredPolicy>) {
        *self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }

    async fn apply_rules(policy: &DesiredPolicy) -> FirewallResult<()> {
        run_command_with_input("nft", &["-f", "-"], Some(&policy.nft_ruleset())).await?;
        Ok(())
    }

    async fn sync_routes(previous: Option<&DesiredPolicy>, policy: &DesiredPolicy) -> FirewallResult<()> {
        if policy.index.is_none() {
            debug!("Adapter {} is absent, leaving routes alone", policy.interface);
            return Ok(());
        }

        let empty = BTreeSet::new();
        let before = previous
            .filter(|p| p.index.is_some())
            .map_or(&empty, |p| &p.routes);

        for stale in before.difference(&policy.routes) {
            let stale = stale.to_string();
            if let Err(e) = run_command("ip", &["route", "del", &stale, "dev", &policy.interface]).await {
                warn!("Failed to remove route {}: {}", stale, e);
            }
        }
        for route in &policy.routes {
            let route = route.to_string();
            run_command("ip", &["route", "replace", &route, "dev", &policy.interface]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallInstaller for NftFirewall {
    async fn enable(&self, identity: &AdapterIdentity) -> FirewallResult<()> {
        let base = DesiredPolicy {
            interface: identity.name().to_string(),
            index: Some(identity.index()),
            listen_port: 0,
            routes: BTreeSet::new(),
        };
        Self::apply_rules(&base).await?;
        self.record(Some(base));
        info!("Firewall table inet {} installed", NFT_TABLE);
        Ok(())
    }

    async fn reconcile(&self, policy: &DesiredPolicy) -> FirewallResult<()> {
        let previous = self.applied().ok_or(FirewallError::NotEnabled)?;
        if previous == *policy {
            debug!("Firewall already matches desired policy");
            return Ok(());
        }

        Self::apply_rules(policy).await?;
        Self::sync_routes(Some(&previous), policy).await?;
        self.record(Some(policy.clone()));
        info!(routes = policy.routes.len(), "Firewall reconciled");
        Ok(())
    }

    async fn disable(&self) -> FirewallResult<()> {
        if self.applied().is_none() {
            return Ok(());
        }
        run_command("nft", &["delete", "table", "inet", NFT_TABLE]).await?;
        self.record(None);
        info!("Firewall table inet {} removed", NFT_TABLE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetun_uapi::model::KEY_LEN;
    use edgetun_uapi::{Key, Peer};

    fn config() -> TunnelConfiguration {
        let mut config = TunnelConfiguration::new("ZitiTUN");
        config.listen_port = 51820;
        config.peers.push(
            Peer::new(Key::from_bytes([1; KEY_LEN]))
                .with_allowed_ip("10.0.0.0/24".parse().unwrap())
                .with_allowed_ip("fd00::/64".parse().unwrap()),
        );
        config.peers.push(
            Peer::new(Key::from_bytes([2; KEY_LEN])).with_allowed_ip("10.0.0.0/24".parse().unwrap()),
        );
        config
    }

    #[test]
    fn policy_merges_peer_ranges() {
        let identity = AdapterIdentity::new("ZitiTUN", 12);
        let policy = DesiredPolicy::compute(&identity, true, &config());

        assert_eq!(policy.index, Some(12));
        assert_eq!(policy.routes.len(), 2);

        let absent = DesiredPolicy::compute(&identity, false, &config());
        assert_eq!(absent.index, None);
        assert_ne!(policy, absent);
    }

    #[test]
    fn ruleset_confines_routed_ranges_to_tunnel() {
        let identity = AdapterIdentity::new("ZitiTUN", 12);
        let script = DesiredPolicy::compute(&identity, true, &config()).nft_ruleset();

        assert!(script.starts_with("table inet edgetun\ndelete table inet edgetun\n"));
        assert!(script.contains("udp dport 51820 accept"));
        assert!(script.contains("oifname \"ZitiTUN\" accept"));
        assert!(script.contains("ip daddr 10.0.0.0/24 drop"));
        assert!(script.contains("ip6 daddr fd00::/64 drop"));
    }

    #[tokio::test]
    async fn reconcile_before_enable_fails() {
        let identity = AdapterIdentity::new("ZitiTUN", 12);
        let policy = DesiredPolicy::compute(&identity, true, &config());
        let err = NftFirewall::new().reconcile(&policy).await.unwrap_err();
        assert!(matches!(err, FirewallError::NotEnabled));
    }
}
