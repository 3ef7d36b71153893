//! Interface change notification sources.

use super::{InterfaceId, WatcherError, WatcherEvent};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Delivers interface change events and answers index lookups.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Push events into `events` until `cancel` fires or the source fails.
    async fn run(
        &self,
        events: mpsc::Sender<WatcherEvent>,
        cancel: CancellationToken,
    ) -> Result<(), WatcherError>;

    /// Current system index of the interface called `name`.
    fn lookup(&self, name: &str) -> Option<u32>;
}

/// State of one interface in a table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceSnapshot {
    pub index: u32,
    pub flags: u32,
    pub addresses: BTreeSet<IpAddr>,
}

pub type InterfaceTable = HashMap<String, InterfaceSnapshot>;

/// Polls the interface table with `getifaddrs` and reports differences.
#[derive(Debug, Clone)]
pub struct PollingSource {
    poll_interval: Duration,
    ignore_patterns: Vec<String>,
}

impl PollingSource {
    pub fn new(poll_interval: Duration, ignore_patterns: Vec<String>) -> Self {
        Self {
            poll_interval,
            ignore_patterns,
        }
    }

    fn should_ignore(&self, name: &str) -> bool {
        self.ignore_patterns
            .iter()
            .any(|pattern| matches_pattern(pattern, name))
    }

    /// Current interface table, without ignored interfaces.
    pub fn snapshot(&self) -> Result<InterfaceTable, WatcherError> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| WatcherError::Source(format!("getifaddrs failed: {}", e)))?;

        let mut table = InterfaceTable::new();
        for ifaddr in addrs {
            if self.should_ignore(&ifaddr.interface_name) {
                continue;
            }

            let entry = table
                .entry(ifaddr.interface_name.clone())
                .or_insert_with(|| InterfaceSnapshot {
                    index: crate::adapter::interface_index(&ifaddr.interface_name).unwrap_or(0),
                    ..Default::default()
                });
            entry.flags |= ifaddr.flags.bits() as u32;

            if let Some(address) = ifaddr.address {
                if let Some(v4) = address.as_sockaddr_in() {
                    entry.addresses.insert(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
                } else if let Some(v6) = address.as_sockaddr_in6() {
                    entry.addresses.insert(IpAddr::V6(*SocketAddrV6::from(*v6).ip()));
                }
            }
        }
        Ok(table)
    }
}

#[async_trait]
impl NotificationSource for PollingSource {
    async fn run(
        &self,
        events: mpsc::Sender<WatcherEvent>,
        cancel: CancellationToken,
    ) -> Result<(), WatcherError> {
        let mut known = self.snapshot()?;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(interfaces = known.len(), "Interface polling started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Interface polling stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let current = self.snapshot()?;
                    for event in diff_tables(&known, &current) {
                        trace!("Interface event: {:?}", event);
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    known = current;
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        crate::adapter::interface_index(name)
    }
}

/// `pattern` matches `name` exactly, or as a prefix when it ends in `*`.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == pattern,
    }
}

/// Events that turn table `old` into table `new`.
pub fn diff_tables(old: &InterfaceTable, new: &InterfaceTable) -> Vec<WatcherEvent> {
    let mut events = Vec::new();

    for (name, snapshot) in old {
        if !new.contains_key(name) {
            events.push(WatcherEvent::InterfaceRemoved(InterfaceId::new(name, snapshot.index)));
        }
    }

    for (name, snapshot) in new {
        let id = InterfaceId::new(name, snapshot.index);
        match old.get(name) {
            None => events.push(WatcherEvent::InterfaceAdded(id)),
            Some(previous) if previous != snapshot => {
                events.push(WatcherEvent::InterfaceChanged(id))
            }
            Some(_) => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, u32, u32)]) -> InterfaceTable {
        entries
            .iter()
            .map(|(name, index, flags)| {
                (
                    name.to_string(),
                    InterfaceSnapshot {
                        index: *index,
                        flags: *flags,
                        addresses: BTreeSet::new(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn patterns() {
        assert!(matches_pattern("lo", "lo"));
        assert!(!matches_pattern("lo", "lo0"));
        assert!(matches_pattern("veth*", "veth12ab"));
        assert!(matches_pattern("*", "eth0"));
    }

    #[test]
    fn diff_reports_add_remove_change() {
        let old = table(&[("eth0", 2, 1), ("ZitiTUN", 5, 1)]);
        let new = table(&[("eth0", 2, 0), ("wlan0", 3, 1)]);

        let mut events = diff_tables(&old, &new);
        events.sort_by(|a, b| a.interface().name.cmp(&b.interface().name));

        assert_eq!(
            events,
            vec![
                WatcherEvent::InterfaceRemoved(InterfaceId::new("ZitiTUN", 5)),
                WatcherEvent::InterfaceChanged(InterfaceId::new("eth0", 2)),
                WatcherEvent::InterfaceAdded(InterfaceId::new("wlan0", 3)),
            ]
        );
    }

    #[test]
    fn recreated_adapter_is_a_change() {
        let old = table(&[("ZitiTUN", 5, 1)]);
        let new = table(&[("ZitiTUN", 9, 1)]);
        assert_eq!(
            diff_tables(&old, &new),
            vec![WatcherEvent::InterfaceChanged(InterfaceId::new("ZitiTUN", 9))]
        );
    }

    #[test]
    fn unchanged_table_is_quiet() {
        let t = table(&[("eth0", 2, 1)]);
        assert!(diff_tables(&t, &t).is_empty());
    }

    #[test]
    fn snapshot_skips_ignored_interfaces() {
        let source = PollingSource::new(Duration::from_secs(1), vec!["*".to_string()]);
        assert!(source.snapshot().unwrap().is_empty());
    }
}
