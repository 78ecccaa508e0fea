//! Stream-packet transport: smoltcp over the on-chip MAC.
//!
//! UDP mode pushes every finalized packet at the configured server,
//! fire-and-forget. TCP mode serves exactly one client at a time: while a
//! connection is up there is no listener, so a second client gets reset;
//! after `MAX_SEND_ERRORS` consecutive send failures the connection is
//! closed and the port re-opened.

use crate::status;
use ardea_core::regmap::IpType;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpCidr, IpEndpoint, Ipv4Address};

/// Consecutive send failures before a TCP client is dropped.
pub const MAX_SEND_ERRORS: u32 = 10;

const UDP_TX_BUF: usize = 4_096;
const TCP_TX_BUF: usize = 4_096;

pub type Device = hal::ethernet::EthernetDMA<4, 4>;

/// Static buffer backing for the interface sockets.
pub struct NetStorage {
    sockets: [SocketStorage<'static>; 2],
    udp_rx_meta: [udp::PacketMetadata; 4],
    udp_rx: [u8; 128],
    udp_tx_meta: [udp::PacketMetadata; 8],
    udp_tx: [u8; UDP_TX_BUF],
    tcp_rx: [u8; 512],
    tcp_tx: [u8; TCP_TX_BUF],
}

impl NetStorage {
    pub const fn new() -> Self {
        Self {
            sockets: [SocketStorage::EMPTY; 2],
            udp_rx_meta: [udp::PacketMetadata::EMPTY; 4],
            udp_rx: [0; 128],
            udp_tx_meta: [udp::PacketMetadata::EMPTY; 8],
            udp_tx: [0; UDP_TX_BUF],
            tcp_rx: [0; 512],
            tcp_tx: [0; TCP_TX_BUF],
        }
    }
}

/// Network configuration snapshot taken from the registers at boot. The
/// transport mode is fixed until reboot.
#[derive(Clone, Copy, Debug)]
pub struct NetConfig {
    pub ip: u32,
    pub netmask: u32,
    pub gateway: u32,
    pub udp_server_ip: u32,
    pub udp_server_port: u16,
    pub udp_tx_port: u16,
    pub tcp_port: u16,
    pub mode: IpType,
}

fn ipv4(raw: u32) -> Ipv4Address {
    let b = raw.to_le_bytes();
    Ipv4Address::new(b[0], b[1], b[2], b[3])
}

#[derive(Clone, Copy, Default, Debug)]
pub struct NetStats {
    pub shipped: u32,
    pub send_errors: u32,
    pub tcp_accepts: u32,
    pub tcp_closes: u32,
}

pub struct Net {
    iface: Interface,
    device: Device,
    sockets: SocketSet<'static>,
    udp_handle: SocketHandle,
    tcp_handle: SocketHandle,
    config: NetConfig,
    tcp_was_active: bool,
    send_err_cnt: u32,
    pub stats: NetStats,
}

impl Net {
    pub fn new(
        mut device: Device,
        mac: EthernetAddress,
        storage: &'static mut NetStorage,
        config: NetConfig,
        now_ms: i64,
    ) -> Self {
        let mut iface_config = Config::new(HardwareAddress::Ethernet(mac));
        iface_config.random_seed = u64::from(config.ip);
        let mut iface = Interface::new(iface_config, &mut device, Instant::from_millis(now_ms));

        let prefix = config.netmask.count_ones() as u8;
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(ipv4(config.ip).into(), prefix));
        });
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(ipv4(config.gateway));

        let mut sockets = SocketSet::new(&mut storage.sockets[..]);

        let udp_socket = udp::Socket::new(
            udp::PacketBuffer::new(&mut storage.udp_rx_meta[..], &mut storage.udp_rx[..]),
            udp::PacketBuffer::new(&mut storage.udp_tx_meta[..], &mut storage.udp_tx[..]),
        );
        let udp_handle = sockets.add(udp_socket);

        let tcp_socket = tcp::Socket::new(
            tcp::SocketBuffer::new(&mut storage.tcp_rx[..]),
            tcp::SocketBuffer::new(&mut storage.tcp_tx[..]),
        );
        let tcp_handle = sockets.add(tcp_socket);

        let mut net = Self {
            iface,
            device,
            sockets,
            udp_handle,
            tcp_handle,
            config,
            tcp_was_active: false,
            send_err_cnt: 0,
            stats: NetStats::default(),
        };
        net.open_sockets();
        net
    }

    fn open_sockets(&mut self) {
        match self.config.mode {
            IpType::Udp => {
                let socket = self.sockets.get_mut::<udp::Socket>(self.udp_handle);
                if socket.bind(self.config.udp_tx_port).is_err() {
                    defmt::error!("udp bind failed on port {}", self.config.udp_tx_port);
                    status::network_error_raise();
                }
            }
            IpType::Tcp => self.tcp_listen(),
        }
    }

    fn tcp_listen(&mut self) {
        let socket = self.sockets.get_mut::<tcp::Socket>(self.tcp_handle);
        if !socket.is_open() {
            if socket.listen(self.config.tcp_port).is_err() {
                defmt::error!("tcp listen failed on port {}", self.config.tcp_port);
                status::network_error_raise();
            }
        }
    }

    /// Run interface housekeeping; returns true if socket state changed.
    pub fn poll(&mut self, now_ms: i64) -> bool {
        let changed = self.iface.poll(
            Instant::from_millis(now_ms),
            &mut self.device,
            &mut self.sockets,
        );
        if self.config.mode == IpType::Tcp {
            let active = {
                let socket = self.sockets.get_mut::<tcp::Socket>(self.tcp_handle);
                socket.is_active()
            };
            if active && !self.tcp_was_active {
                self.stats.tcp_accepts += 1;
                self.send_err_cnt = 0;
                defmt::info!("stream client connected");
            }
            if !active {
                // Connection gone (or never there): make sure the port is
                // open for the next client.
                self.tcp_listen();
            }
            self.tcp_was_active = active;
        }
        changed
    }

    /// Push one finalized stream packet at the configured sink.
    pub fn ship(&mut self, data: &[u8]) {
        match self.config.mode {
            IpType::Udp => self.ship_udp(data),
            IpType::Tcp => self.ship_tcp(data),
        }
    }

    fn ship_udp(&mut self, data: &[u8]) {
        let endpoint = IpEndpoint::new(
            ipv4(self.config.udp_server_ip).into(),
            self.config.udp_server_port,
        );
        let socket = self.sockets.get_mut::<udp::Socket>(self.udp_handle);
        match socket.send_slice(data, endpoint) {
            Ok(()) => self.stats.shipped += 1,
            Err(_) => {
                // Streaming is best effort; log rarely so a dead server
                // does not drown the console.
                self.stats.send_errors += 1;
                if self.stats.send_errors < 10 || self.stats.send_errors % 60_000 == 0 {
                    defmt::warn!("udp send failed ({})", self.stats.send_errors);
                }
            }
        }
    }

    fn ship_tcp(&mut self, data: &[u8]) {
        let mut close = false;
        {
            let socket = self.sockets.get_mut::<tcp::Socket>(self.tcp_handle);
            if !socket.is_active() || !socket.may_send() {
                return;
            }
            match socket.send_slice(data) {
                Ok(n) if n == data.len() => {
                    self.stats.shipped += 1;
                    self.send_err_cnt = 0;
                }
                _ => {
                    self.stats.send_errors += 1;
                    self.send_err_cnt += 1;
                    if self.send_err_cnt > MAX_SEND_ERRORS {
                        close = true;
                    }
                }
            }
            if close {
                defmt::warn!("closing stream client after send errors");
                socket.abort();
            }
        }
        if close {
            self.stats.tcp_closes += 1;
            self.send_err_cnt = 0;
            self.tcp_listen();
        }
    }
}
