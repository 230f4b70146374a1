//! Windows packet I/O: raw sockets, pcap capture and divert injection.
//!
//! ICMP ingress is selected by the configured mode hint: a raw socket, a
//! live pcap capture filtered down to ICMP towards the source address, or an
//! automatic probe of pcap availability with a raw-socket fallback. TCP
//! probes are injected as whole IP frames through the divert driver; replies
//! come back over a second pcap capture.

use crate::platform::sockets::RawProbeSink;
use crate::platform::EndpointConfig;
use crate::sink::{ProbeSink, TcpChannel};
use crate::source::{Framing, PacketSource};
use pathtrace_core::{IcmpMode, TraceError};
use pnet_packet::ipv4::MutableIpv4Packet;
use pnet_packet::ipv6::MutableIpv6Packet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};
use windivert::layer::NetworkLayer;
use windivert::prelude::{WinDivertFlags, WinDivertPacket};
use windivert::WinDivert;

/// Snap length for live captures.
const PCAP_SNAPLEN: i32 = 65535;

/// Capture buffer size (4 MiB).
const PCAP_BUFFER: i32 = 4 * 1024 * 1024;

/// Poll granularity of capture reads in milliseconds.
const PCAP_TIMEOUT_MS: i32 = 100;

const ETHERNET_HEADER_LEN: usize = 14;
const NULL_HEADER_LEN: usize = 4;

/// Raw ICMP socket ingress (socket mode).
///
/// Windows delivers the IPv4 header on raw ICMP reads. IPv6 raw sockets are
/// not usable for this; v6 traces require the pcap mode.
pub struct WinRawSource {
    socket: windows_sys::Win32::Networking::WinSock::SOCKET,
    closed: Mutex<bool>,
}

// The socket handle is only used through synchronized win32 calls.
unsafe impl Send for WinRawSource {}
unsafe impl Sync for WinRawSource {}

impl WinRawSource {
    pub fn open(src: IpAddr) -> Result<Self, TraceError> {
        use windows_sys::Win32::Networking::WinSock::{
            bind, setsockopt, socket, AF_INET, INVALID_SOCKET, IPPROTO_ICMP, SOCKADDR_IN,
            SOCKET_ERROR, SOCK_RAW, SOL_SOCKET, SO_RCVTIMEO,
        };

        let IpAddr::V4(src_v4) = src else {
            return Err(TraceError::Internal(
                "IPv6 raw sockets are unavailable on Windows; use the pcap mode".to_string(),
            ));
        };

        let s = unsafe { socket(AF_INET as i32, SOCK_RAW as i32, IPPROTO_ICMP) };
        if s == INVALID_SOCKET {
            return Err(TraceError::SocketCreation(std::io::Error::last_os_error()));
        }

        let sa = SOCKADDR_IN {
            sin_family: AF_INET,
            sin_port: 0,
            sin_addr: windows_sys::Win32::Networking::WinSock::IN_ADDR {
                S_un: windows_sys::Win32::Networking::WinSock::IN_ADDR_0 {
                    S_addr: u32::from_ne_bytes(src_v4.octets()),
                },
            },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            bind(
                s,
                &sa as *const _ as *const _,
                std::mem::size_of::<SOCKADDR_IN>() as i32,
            )
        };
        if rc == SOCKET_ERROR {
            let err = std::io::Error::last_os_error();
            unsafe { windows_sys::Win32::Networking::WinSock::closesocket(s) };
            return Err(TraceError::SocketBind { addr: src, source: err });
        }

        // Short receive timeout so the listener loop can observe cancellation.
        let timeout_ms: i32 = PCAP_TIMEOUT_MS;
        let rc = unsafe {
            setsockopt(
                s,
                SOL_SOCKET,
                SO_RCVTIMEO,
                &timeout_ms as *const i32 as *const u8,
                std::mem::size_of::<i32>() as i32,
            )
        };
        if rc == SOCKET_ERROR {
            unsafe { windows_sys::Win32::Networking::WinSock::closesocket(s) };
            return Err(TraceError::SocketCreation(std::io::Error::last_os_error()));
        }

        debug!("opened raw ICMP socket");
        Ok(Self {
            socket: s,
            closed: Mutex::new(false),
        })
    }
}

impl PacketSource for WinRawSource {
    fn framing(&self) -> Framing {
        Framing::Ip
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        use windows_sys::Win32::Networking::WinSock::{
            recvfrom, WSAGetLastError, SOCKADDR_IN, SOCKET_ERROR, WSAEMSGSIZE, WSAETIMEDOUT,
        };

        if *self.closed.lock().unwrap() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "socket closed",
            ));
        }

        let mut from: SOCKADDR_IN = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<SOCKADDR_IN>() as i32;
        let n = unsafe {
            recvfrom(
                self.socket,
                buf.as_mut_ptr(),
                buf.len() as i32,
                0,
                &mut from as *mut _ as *mut _,
                &mut from_len,
            )
        };

        if n == SOCKET_ERROR {
            let err = unsafe { WSAGetLastError() };
            if err == WSAETIMEDOUT || err == WSAEMSGSIZE {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"));
            }
            return Err(std::io::Error::from_raw_os_error(err));
        }

        let octets = unsafe { from.sin_addr.S_un.S_addr }.to_ne_bytes();
        let peer = IpAddr::V4(std::net::Ipv4Addr::from(octets));
        Ok((n as usize, peer))
    }

    fn close(&self) -> std::io::Result<()> {
        let mut closed = self.closed.lock().unwrap();
        if !*closed {
            unsafe { windows_sys::Win32::Networking::WinSock::closesocket(self.socket) };
            *closed = true;
        }
        Ok(())
    }
}

/// Finds the capture device owning `src`.
fn pcap_device_for(src: IpAddr) -> Result<pcap::Device, TraceError> {
    let devices = pcap::Device::list().map_err(|e| TraceError::CaptureOpen(e.to_string()))?;
    devices
        .into_iter()
        .find(|dev| dev.addresses.iter().any(|addr| addr.addr == src))
        .ok_or_else(|| {
            TraceError::CaptureOpen(format!("no capture device owns address {src}"))
        })
}

/// Opens an immediate-mode live capture with `filter` installed.
fn open_live_capture(
    src: IpAddr,
    filter: &str,
) -> Result<(pcap::Capture<pcap::Active>, pcap::Linktype), TraceError> {
    let device = pcap_device_for(src)?;
    let name = device.name.clone();
    let mut capture = pcap::Capture::from_device(device)
        .map_err(|e| TraceError::CaptureOpen(e.to_string()))?
        .immediate_mode(true)
        .snaplen(PCAP_SNAPLEN)
        .buffer_size(PCAP_BUFFER)
        .timeout(PCAP_TIMEOUT_MS)
        .open()
        .map_err(|e| TraceError::CaptureOpen(format!("open {name} failed: {e}")))?;
    capture
        .filter(filter, true)
        .map_err(|e| TraceError::CaptureOpen(format!("filter {filter:?} rejected: {e}")))?;
    let linktype = capture.get_datalink();
    debug!(device = %name, filter, "opened live capture");
    Ok((capture, linktype))
}

/// Live capture ingress delivering IP payloads.
pub struct PcapSource {
    capture: Mutex<pcap::Capture<pcap::Active>>,
    linktype: pcap::Linktype,
    v6: bool,
}

impl PcapSource {
    pub fn open_icmp(src: IpAddr) -> Result<Self, TraceError> {
        let v6 = src.is_ipv6();
        let (ip, proto) = if v6 { ("ip6", "icmp6") } else { ("ip", "icmp") };
        let filter = format!("{ip} and {proto} and dst host {src}");
        let (capture, linktype) = open_live_capture(src, &filter)?;
        Ok(Self {
            capture: Mutex::new(capture),
            linktype,
            v6,
        })
    }

    pub fn open_tcp(src: IpAddr, dest: IpAddr, dest_port: u16) -> Result<Self, TraceError> {
        let v6 = src.is_ipv6();
        let ip = if v6 { "ip6" } else { "ip" };
        let filter =
            format!("{ip} and tcp and src host {dest} and dst host {src} and src port {dest_port}");
        let (capture, linktype) = open_live_capture(src, &filter)?;
        Ok(Self {
            capture: Mutex::new(capture),
            linktype,
            v6,
        })
    }

    /// Strips the link-layer header off a captured frame.
    fn link_payload<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        match self.linktype {
            pcap::Linktype::ETHERNET => {
                if frame.len() < ETHERNET_HEADER_LEN {
                    return None;
                }
                let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
                if ethertype != 0x0800 && ethertype != 0x86DD {
                    return None;
                }
                Some(&frame[ETHERNET_HEADER_LEN..])
            }
            pcap::Linktype::NULL | pcap::Linktype::LOOP => {
                if frame.len() < NULL_HEADER_LEN {
                    return None;
                }
                Some(&frame[NULL_HEADER_LEN..])
            }
            pcap::Linktype::RAW => Some(frame),
            _ => None,
        }
    }

    fn peer_of(&self, packet: &[u8]) -> Option<IpAddr> {
        if self.v6 {
            if packet.len() < 40 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[8..24]);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        } else {
            if packet.len() < 20 {
                return None;
            }
            let octets: [u8; 4] = packet[12..16].try_into().ok()?;
            Some(IpAddr::V4(std::net::Ipv4Addr::from(octets)))
        }
    }
}

impl PacketSource for PcapSource {
    fn framing(&self) -> Framing {
        Framing::Ip
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        let mut capture = self.capture.lock().unwrap();
        loop {
            match capture.next_packet() {
                Ok(frame) => {
                    let Some(packet) = self.link_payload(frame.data) else {
                        continue;
                    };
                    let Some(peer) = self.peer_of(packet) else {
                        continue;
                    };
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    return Ok((len, peer));
                }
                Err(pcap::Error::TimeoutExpired) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "capture timeout",
                    ));
                }
                Err(err) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err.to_string(),
                    ));
                }
            }
        }
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// TCP probe channel: divert-driver injection out, pcap capture back.
pub struct DivertTcpChannel {
    handle: WinDivert<NetworkLayer>,
    capture: PcapSource,
    src: IpAddr,
    dest: IpAddr,
    ttl_lock: Mutex<()>,
}

impl DivertTcpChannel {
    pub fn open(cfg: &EndpointConfig) -> Result<Self, TraceError> {
        let capture = PcapSource::open_tcp(cfg.src, cfg.dest, cfg.dest_port)?;
        // The handle is used for injection only; "false" never matches
        // inbound traffic.
        let flags = WinDivertFlags::new().set_send_only();
        let handle = WinDivert::network("false", 0, flags)
            .map_err(|e| TraceError::CaptureOpen(format!("divert open failed: {e}")))?;
        Ok(Self {
            handle,
            capture,
            src: cfg.src,
            dest: cfg.dest,
            ttl_lock: Mutex::new(()),
        })
    }

    /// Wraps a TCP segment into a full IP frame with the given TTL.
    fn build_frame(&self, segment: &[u8], ttl: u8) -> Result<Vec<u8>, std::io::Error> {
        match (self.src, self.dest) {
            (IpAddr::V4(src), IpAddr::V4(dest)) => {
                let total = 20 + segment.len();
                let mut frame = vec![0u8; total];
                let mut ip = MutableIpv4Packet::new(&mut frame).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too small")
                })?;
                ip.set_version(4);
                ip.set_header_length(5);
                ip.set_total_length(total as u16);
                ip.set_ttl(ttl);
                ip.set_next_level_protocol(pnet_packet::ip::IpNextHeaderProtocols::Tcp);
                ip.set_source(src);
                ip.set_destination(dest);
                let checksum = pnet_packet::ipv4::checksum(&ip.to_immutable());
                ip.set_checksum(checksum);
                frame[20..].copy_from_slice(segment);
                Ok(frame)
            }
            (IpAddr::V6(src), IpAddr::V6(dest)) => {
                let total = 40 + segment.len();
                let mut frame = vec![0u8; total];
                let mut ip = MutableIpv6Packet::new(&mut frame).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too small")
                })?;
                ip.set_version(6);
                ip.set_payload_length(segment.len() as u16);
                ip.set_next_header(pnet_packet::ip::IpNextHeaderProtocols::Tcp);
                ip.set_hop_limit(ttl);
                ip.set_source(src);
                ip.set_destination(dest);
                frame[40..].copy_from_slice(segment);
                Ok(frame)
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address family mismatch",
            )),
        }
    }
}

impl PacketSource for DivertTcpChannel {
    fn framing(&self) -> Framing {
        self.capture.framing()
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        self.capture.recv(buf)
    }

    fn close(&self) -> std::io::Result<()> {
        self.capture.close()
    }
}

impl TcpChannel for DivertTcpChannel {
    fn send_syn(&self, segment: &[u8], ttl: u8) -> std::io::Result<Instant> {
        let _guard = self.ttl_lock.lock().unwrap();
        let frame = self.build_frame(segment, ttl)?;
        let mut packet = unsafe { WinDivertPacket::<NetworkLayer>::new(frame) };
        packet.address.set_outbound(true);
        let start = Instant::now();
        self.handle
            .send(&packet)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(start)
    }
}

/// Resolves the effective ingress mode from the hint.
///
/// Auto and forced-pcap both try the capture stack; a broken pcap install
/// degrades to the socket backend with a warning.
fn resolve_icmp_mode(cfg: &EndpointConfig) -> IcmpMode {
    match cfg.icmp_mode {
        IcmpMode::Socket => IcmpMode::Socket,
        IcmpMode::Pcap | IcmpMode::Auto => match pcap_device_for(cfg.src) {
            Ok(_) => IcmpMode::Pcap,
            Err(err) => {
                if cfg.icmp_mode == IcmpMode::Pcap {
                    warn!(error = %err, "pcap mode requested but unavailable, falling back to socket mode");
                }
                IcmpMode::Socket
            }
        },
    }
}

pub fn open_icmp_ingress(cfg: &EndpointConfig) -> Result<Arc<dyn PacketSource>, TraceError> {
    match resolve_icmp_mode(cfg) {
        IcmpMode::Pcap => Ok(Arc::new(PcapSource::open_icmp(cfg.src)?)),
        _ => Ok(Arc::new(WinRawSource::open(cfg.src)?)),
    }
}

pub fn open_icmp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    Ok(Arc::new(RawProbeSink::icmp(cfg.src)?))
}

pub fn open_udp_egress(cfg: &EndpointConfig) -> Result<Arc<dyn ProbeSink>, TraceError> {
    Ok(Arc::new(RawProbeSink::udp(cfg.src)?))
}

pub fn open_tcp_channel(cfg: &EndpointConfig) -> Result<Arc<dyn TcpChannel>, TraceError> {
    Ok(Arc::new(DivertTcpChannel::open(cfg)?))
}
