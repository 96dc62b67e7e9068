//! Packet devices the engine reads frames from and writes frames to

use crate::config::InterfaceConfig;
use async_trait::async_trait;
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait Device: Send + Sync {
    /// Read one packet into `buf`, returning its length
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Hand one packet to the host
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// Kernel TUN interface
pub struct TunDevice {
    reader: Mutex<ReadHalf<tun::AsyncDevice>>,
    writer: Mutex<WriteHalf<tun::AsyncDevice>>,
}

impl TunDevice {
    /// Create and bring up the interface
    pub fn create(config: &InterfaceConfig, address: Ipv4Addr, prefix: u8) -> io::Result<Self> {
        let netmask = Ipv4Addr::from(u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0));
        let mtu = i32::try_from(config.mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mtu too large"))?;

        let mut tun_config = tun::Configuration::default();
        tun_config.name(&config.name).address(address).netmask(netmask).mtu(mtu).up();
        #[cfg(target_os = "linux")]
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let (reader, writer) = tokio::io::split(device);
        tracing::info!("Interface {} up with {}/{}", config.name, address, prefix);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl Device for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(packet).await
    }
}

/// In-process device; the paired handle plays the host side
pub struct MemoryDevice {
    from_host: Mutex<mpsc::Receiver<Vec<u8>>>,
    to_host: mpsc::Sender<Vec<u8>>,
}

pub struct MemoryDeviceHandle {
    from_host: mpsc::Sender<Vec<u8>>,
    to_host: mpsc::Receiver<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new(buffer: usize) -> (Self, MemoryDeviceHandle) {
        let (from_host_tx, from_host_rx) = mpsc::channel(buffer.max(1));
        let (to_host_tx, to_host_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                from_host: Mutex::new(from_host_rx),
                to_host: to_host_tx,
            },
            MemoryDeviceHandle {
                from_host: from_host_tx,
                to_host: to_host_rx,
            },
        )
    }
}

#[async_trait]
impl Device for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .from_host
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.to_host
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl MemoryDeviceHandle {
    /// Packet the host sends into the overlay
    pub async fn inject(&self, packet: Vec<u8>) -> io::Result<()> {
        self.from_host
            .send(packet)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Next packet the overlay delivered to the host
    pub async fn delivered(&mut self) -> Option<Vec<u8>> {
        self.to_host.recv().await
    }
}
