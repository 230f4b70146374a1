//! Raw-socket packet I/O, shared by the Unix backends and the Windows
//! socket mode.

use crate::sink::{ProbeSink, TcpChannel};
use crate::source::{Framing, PacketSource};
use pathtrace_core::TraceError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Poll granularity of blocking reads; bounds cancellation latency.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive buffer size for ingress sockets.
const RECV_BUFFER: usize = 1 << 20;

fn domain_for(v6: bool) -> Domain {
    if v6 {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}

fn raw_socket(v6: bool, protocol: Protocol, src: IpAddr) -> Result<Socket, TraceError> {
    let socket = Socket::new(domain_for(v6), Type::RAW, Some(protocol))
        .map_err(TraceError::SocketCreation)?;
    socket
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(TraceError::SocketCreation)?;
    socket
        .bind(&SockAddr::from(SocketAddr::new(src, 0)))
        .map_err(|source| TraceError::SocketBind { addr: src, source })?;
    Ok(socket)
}

fn recv_from(socket: &Socket, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
    let uninit: &mut [MaybeUninit<u8>] = unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
    };
    let (len, addr) = socket.recv_from(uninit)?;
    let peer = addr
        .as_socket()
        .map(|sa| sa.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-IP peer"))?;
    Ok((len, peer))
}

/// Raw ICMP socket ingress.
///
/// IPv4 reads include the IP header; the kernel strips it for ICMPv6.
pub struct IcmpSocketSource {
    socket: Socket,
    v6: bool,
}

impl IcmpSocketSource {
    pub fn open(src: IpAddr) -> Result<Self, TraceError> {
        let v6 = src.is_ipv6();
        let protocol = if v6 {
            Protocol::ICMPV6
        } else {
            Protocol::ICMPV4
        };
        let socket = raw_socket(v6, protocol, src)?;
        socket
            .set_recv_buffer_size(RECV_BUFFER)
            .map_err(TraceError::SocketCreation)?;
        Ok(Self { socket, v6 })
    }

    /// Wraps an already-configured descriptor (macOS DGRAM ping sockets).
    pub fn from_socket(socket: Socket, v6: bool) -> Self {
        Self { socket, v6 }
    }
}

impl PacketSource for IcmpSocketSource {
    fn framing(&self) -> Framing {
        if self.v6 {
            Framing::Transport
        } else {
            Framing::Ip
        }
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        recv_from(&self.socket, buf)
    }

    fn close(&self) -> std::io::Result<()> {
        // closed when the last Arc drops
        Ok(())
    }
}

/// Datagram egress with the TTL set under a per-sink lock.
///
/// With `header_included` the packet carries its own IPv4 header (UDP v4
/// probes encode the sequence in the Identification field) and the TTL
/// option set is skipped; the header already has it.
pub struct RawProbeSink {
    socket: Socket,
    v6: bool,
    header_included: bool,
    ttl_lock: Mutex<()>,
}

impl RawProbeSink {
    pub fn icmp(src: IpAddr) -> Result<Self, TraceError> {
        let v6 = src.is_ipv6();
        let protocol = if v6 {
            Protocol::ICMPV6
        } else {
            Protocol::ICMPV4
        };
        Ok(Self {
            socket: raw_socket(v6, protocol, src)?,
            v6,
            header_included: false,
            ttl_lock: Mutex::new(()),
        })
    }

    /// Wraps an already-configured descriptor (macOS DGRAM ping sockets).
    pub fn from_socket(socket: Socket, v6: bool) -> Self {
        Self {
            socket,
            v6,
            header_included: false,
            ttl_lock: Mutex::new(()),
        }
    }

    pub fn udp(src: IpAddr) -> Result<Self, TraceError> {
        let v6 = src.is_ipv6();
        let socket = raw_socket(v6, Protocol::UDP, src)?;
        if !v6 {
            socket
                .set_header_included(true)
                .map_err(TraceError::SocketCreation)?;
        }
        Ok(Self {
            socket,
            v6,
            header_included: !v6,
            ttl_lock: Mutex::new(()),
        })
    }
}

impl ProbeSink for RawProbeSink {
    fn send(&self, packet: &[u8], dst: IpAddr, ttl: u8) -> std::io::Result<Instant> {
        let _guard = self.ttl_lock.lock().unwrap();
        if !self.header_included {
            if self.v6 {
                self.socket.set_unicast_hops_v6(ttl as u32)?;
            } else {
                self.socket.set_ttl(ttl as u32)?;
            }
        }
        let start = Instant::now();
        self.socket
            .send_to(packet, &SockAddr::from(SocketAddr::new(dst, 0)))?;
        Ok(start)
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Raw TCP socket carrying SYN probes out and handshake replies back.
pub struct RawTcpChannel {
    socket: Socket,
    dest: IpAddr,
    v6: bool,
    ttl_lock: Mutex<()>,
}

impl RawTcpChannel {
    pub fn open(src: IpAddr, dest: IpAddr) -> Result<Self, TraceError> {
        let v6 = src.is_ipv6();
        let socket = raw_socket(v6, Protocol::TCP, src)?;
        socket
            .set_recv_buffer_size(RECV_BUFFER)
            .map_err(TraceError::SocketCreation)?;
        Ok(Self {
            socket,
            dest,
            v6,
            ttl_lock: Mutex::new(()),
        })
    }
}

impl PacketSource for RawTcpChannel {
    fn framing(&self) -> Framing {
        if self.v6 {
            Framing::Transport
        } else {
            Framing::Ip
        }
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
        recv_from(&self.socket, buf)
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TcpChannel for RawTcpChannel {
    fn send_syn(&self, segment: &[u8], ttl: u8) -> std::io::Result<Instant> {
        let _guard = self.ttl_lock.lock().unwrap();
        if self.v6 {
            self.socket.set_unicast_hops_v6(ttl as u32)?;
        } else {
            self.socket.set_ttl(ttl as u32)?;
        }
        let start = Instant::now();
        self.socket
            .send_to(segment, &SockAddr::from(SocketAddr::new(self.dest, 0)))?;
        Ok(start)
    }
}

