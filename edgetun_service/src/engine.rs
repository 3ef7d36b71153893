//! Default packet engine.
//!
//! `DiscardEngine` drains the adapter queue and accounts each packet against
//! the running peer set by destination address. It stands in for the
//! encrypting transport, which plugs in through [`PacketEngine`].

use crate::config_store::ConfigStore;
use crate::device::{DeviceError, DeviceResult, PacketEngine, PacketIo};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const MAX_PACKET_SIZE: usize = 65535;

#[derive(Debug, Default)]
pub struct EngineStats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    routed_packets: AtomicU64,
    unroutable_packets: AtomicU64,
}

impl EngineStats {
    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Packets whose destination falls inside some peer's allowed ranges
    pub fn routed_packets(&self) -> u64 {
        self.routed_packets.load(Ordering::Relaxed)
    }

    pub fn unroutable_packets(&self) -> u64 {
        self.unroutable_packets.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct DiscardEngine {
    stats: Arc<EngineStats>,
}

impl DiscardEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    fn account(&self, packet: &[u8], config: &ConfigStore) {
        self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.stats
            .rx_bytes
            .fetch_add(packet.len() as u64, Ordering::Relaxed);

        let routed = destination(packet).is_some_and(|dst| {
            config
                .snapshot()
                .peers
                .iter()
                .any(|peer| peer.allowed_ips.iter().any(|net| net.contains(&dst)))
        });

        let counter = if routed {
            &self.stats.routed_packets
        } else {
            &self.stats.unroutable_packets
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl PacketEngine for DiscardEngine {
    async fn run(
        &self,
        io: Arc<dyn PacketIo>,
        config: ConfigStore,
        cancel: CancellationToken,
    ) -> DeviceResult<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Packet engine cancelled");
                    return Ok(());
                }
                read = io.recv(&mut buf) => match read {
                    Ok(0) => {
                        return Err(DeviceError::Runtime("adapter returned end of stream".to_string()));
                    }
                    Ok(n) => self.account(&buf[..n], &config),
                    Err(e) => {
                        error!("Adapter read failed: {}", e);
                        return Err(DeviceError::Runtime(e.to_string()));
                    }
                },
            }
        }
    }
}

/// Destination address of an IPv4 or IPv6 packet.
fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let bytes: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(bytes)))
        }
        6 => {
            let bytes: [u8; 16] = packet.get(24..40)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}
