//! TUN adapter backed by the `tun` crate.

use crate::command::run_command;
use crate::device::{AdapterIdentity, AdapterProvider, DeviceError, DeviceResult, InterfaceHandle, PacketIo};
use async_trait::async_trait;
use ipnet::IpNet;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tun::{AsyncDevice, Configuration, Layer};

/// System index of the interface called `name`, if it exists.
pub fn interface_index(name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(name).ok()
}

/// Creates layer 3 TUN adapters.
#[derive(Debug, Clone, Default)]
pub struct TunAdapterProvider {
    mtu: Option<u16>,
    addresses: Vec<IpNet>,
}

impl TunAdapterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Addresses assigned to the adapter after creation
    pub fn with_addresses(mut self, addresses: Vec<IpNet>) -> Self {
        self.addresses = addresses;
        self
    }

    #[cfg(target_os = "linux")]
    async fn configure_link(&self, name: &str) -> DeviceResult<()> {
        let creation_error = |e: crate::command::CommandError| DeviceError::Creation {
            name: name.to_string(),
            message: e.to_string(),
        };

        for address in &self.addresses {
            let address = address.to_string();
            run_command("ip", &["addr", "add", &address, "dev", name])
                .await
                .map_err(creation_error)?;
        }
        run_command("ip", &["link", "set", "dev", name, "up"])
            .await
            .map_err(creation_error)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn configure_link(&self, name: &str) -> DeviceResult<()> {
        for address in &self.addresses {
            let address = address.to_string();
            let family = if address.contains(':') { "inet6" } else { "inet" };
            run_command("ifconfig", &[name, family, &address, "alias"])
                .await
                .map_err(|e| DeviceError::Creation {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl AdapterProvider for TunAdapterProvider {
    async fn create(&self, name: &str) -> DeviceResult<InterfaceHandle> {
        let mut tun_config = Configuration::default();
        tun_config.name(name);
        tun_config.layer(Layer::L3);
        tun_config.up();
        if let Some(mtu) = self.mtu {
            tun_config.mtu(i32::from(mtu));
        }

        #[cfg(target_os = "linux")]
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config).map_err(|e| DeviceError::Creation {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        debug!("TUN device {} opened", name);

        self.configure_link(name).await?;

        let index = match interface_index(name) {
            Some(index) => index,
            None => {
                warn!("No system index found for {}", name);
                0
            }
        };
        info!(index, "TUN adapter {} is up", name);

        let (reader, writer) = tokio::io::split(device);
        Ok(InterfaceHandle::new(
            AdapterIdentity::new(name, index),
            Arc::new(TunPacketIo {
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
            }),
        ))
    }
}

struct TunPacketIo {
    reader: Mutex<Option<ReadHalf<AsyncDevice>>>,
    writer: Mutex<Option<WriteHalf<AsyncDevice>>>,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "adapter is closed")
}

#[async_trait]
impl PacketIo for TunPacketIo {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.as_mut().ok_or_else(closed)?.read(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(closed)?;
        writer.write_all(packet).await?;
        Ok(packet.len())
    }

    fn close(&self) -> io::Result<()> {
        let busy = |_| io::Error::new(io::ErrorKind::WouldBlock, "adapter is still in use");
        let reader = self.reader.try_lock().map_err(busy)?.take();
        let writer = self.writer.try_lock().map_err(busy)?.take();
        drop((reader, writer));
        Ok(())
    }
}
