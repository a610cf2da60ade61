use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
use pnet::transport::{
    self, transport_channel, TransportChannelType::Layer4, TransportProtocol::Ipv4 as Ipv4Proto,
};
use rand::{thread_rng, Rng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::models::{ScanResult, ScanState};
use crate::probes::ProbeCatalogue;
use crate::utils;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const LIVENESS_TIMEOUT: Duration = Duration::from_millis(100);
const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_BUFFER_SIZE: usize = 4096;
const SYN_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const UDP_TIMEOUT: Duration = Duration::from_secs(2);
const UDP_BUFFER_SIZE: usize = 512;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

fn result(host: &str, port: u16, state: ScanState, service: String) -> ScanResult {
    ScanResult {
        host: host.to_string(),
        port,
        state,
        service,
    }
}

/// What the probe loop learned from an established connection
enum ServiceProbe {
    /// A match identified the service by name
    Identified(String),
    /// The peer answered but nothing matched; the raw banner is the result
    Banner(Vec<u8>),
    /// Every probe went unanswered
    Silent,
    /// The connection died mid-probe
    Reset,
}

/// Probe one port with a full TCP connect, then run service detection on
/// the open socket.
///
/// Dial errors classify the port directly: a timeout or unreachable network
/// is `Filtered`, an active refusal is `Closed`.
pub async fn connect_probe(host: &str, port: u16, catalogue: &ProbeCatalogue) -> ScanResult {
    let address = format!("{}:{}", host, port);

    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(address.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!("[connect:{}:{}] connection refused", host, port);
            return result(host, port, ScanState::Closed, String::new());
        }
        Ok(Err(e)) => {
            debug!("[connect:{}:{}] dial error: {}", host, port, e);
            return result(host, port, ScanState::Filtered, String::new());
        }
        Err(_) => {
            debug!("[connect:{}:{}] dial timed out", host, port);
            return result(host, port, ScanState::Filtered, String::new());
        }
    };

    match probe_service(stream, host, port, catalogue).await {
        ServiceProbe::Identified(name) => result(host, port, ScanState::Open, name),
        ServiceProbe::Banner(bytes) => {
            let banner = String::from_utf8_lossy(&bytes).into_owned();
            result(host, port, ScanState::Open, banner)
        }
        ServiceProbe::Silent => result(host, port, ScanState::Open, String::new()),
        ServiceProbe::Reset => result(host, port, ScanState::Closed, String::new()),
    }
}

/// Drive the catalogue's TCP probes, in file order, over one connection.
/// Dropping the stream closes the socket on every exit path.
async fn probe_service(
    mut stream: TcpStream,
    host: &str,
    port: u16,
    catalogue: &ProbeCatalogue,
) -> ServiceProbe {
    // A reverse proxy with no backend accepts the handshake and resets
    // immediately. A short peek flushes that out without consuming banner
    // bytes; having nothing queued yet is benign.
    let mut liveness = [0u8; 1];
    match timeout(LIVENESS_TIMEOUT, stream.peek(&mut liveness)).await {
        Err(_) => {}
        Ok(Ok(n)) if n > 0 => {}
        Ok(_) => {
            debug!("[connect:{}:{}] peer reset right after handshake", host, port);
            return ServiceProbe::Reset;
        }
    }

    let mut buffer = vec![0u8; PROBE_BUFFER_SIZE];
    for probe in catalogue.tcp_probes() {
        if !probe.data.is_empty() {
            if let Err(e) = stream.write_all(&probe.data).await {
                debug!(
                    "[connect:{}:{}] write failed during probe {}: {}",
                    host, port, probe.name, e
                );
                return ServiceProbe::Reset;
            }
        }

        let n = match timeout(PROBE_READ_TIMEOUT, stream.read(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(0)) => continue,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(
                    "[connect:{}:{}] read failed during probe {}: {}",
                    host, port, probe.name, e
                );
                return ServiceProbe::Reset;
            }
        };

        let response = &buffer[..n];
        for m in &probe.matches {
            if m.pattern.is_match(response) {
                debug!(
                    "[connect:{}:{}] probe {} identified service {}",
                    host, port, probe.name, m.service_name
                );
                return ServiceProbe::Identified(m.service_name.clone());
            }
        }
        // The peer answered but no pattern recognized it; the raw banner is
        // more useful than trying further probes on a consumed conversation.
        return ServiceProbe::Banner(response.to_vec());
    }

    ServiceProbe::Silent
}

/// Validate prerequisites for SYN scanning: a usable source interface and
/// permission to open a layer-4 raw channel. Called once per process; the
/// outcome is memoized by the task driver.
pub fn init_syn_scan() -> Result<()> {
    if utils::find_source_ipv4().is_none() {
        return Err(anyhow!("no usable network interface found for SYN scan"));
    }
    let protocol = Layer4(Ipv4Proto(IpNextHeaderProtocols::Tcp));
    transport_channel(4096, protocol)
        .map(|_| ())
        .map_err(|e| anyhow!("SYN scan requires root/administrator privileges: {}", e))
}

/// Probe one port with a half-open SYN scan.
///
/// Never populates `service`; SYN scanning operates below the application
/// layer.
pub async fn syn_probe(host: &str, port: u16) -> ScanResult {
    let Some(dst_ip) = utils::resolve_ipv4(host).await else {
        debug!("[syn:{}:{}] no IPv4 address for target", host, port);
        return result(host, port, ScanState::Filtered, String::new());
    };

    // The raw receive loop is blocking; keep it off the async workers.
    let state = tokio::task::spawn_blocking(move || raw_syn_probe(dst_ip, port))
        .await
        .unwrap_or(ScanState::Filtered);
    result(host, port, state, String::new())
}

/// Send a raw SYN and classify the port by the first relevant reply:
/// SYN-ACK means open, RST means closed, silence or any local failure
/// means filtered.
fn raw_syn_probe(dst_ip: Ipv4Addr, port: u16) -> ScanState {
    let Some(src_ip) = utils::find_source_ipv4() else {
        return ScanState::Filtered;
    };

    let protocol = Layer4(Ipv4Proto(IpNextHeaderProtocols::Tcp));
    let (mut tx, mut rx) = match transport_channel(4096, protocol) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("[syn:{}:{}] cannot open raw channel: {}", dst_ip, port, e);
            return ScanState::Filtered;
        }
    };

    let src_port = utils::random_source_port();
    let mut packet_buf = [0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
    build_syn_packet(&mut packet_buf, src_ip, dst_ip, src_port, port);

    let Some(packet) = Ipv4Packet::new(&packet_buf) else {
        return ScanState::Filtered;
    };
    if tx.send_to(packet, IpAddr::V4(dst_ip)).is_err() {
        return ScanState::Filtered;
    }
    debug!("[syn:{}:{}] SYN sent from source port {}", dst_ip, port, src_port);

    // Only replies from the probed endpoint back to our source port count,
    // the in-code equivalent of a capture filter on src/dst host and port.
    let deadline = Instant::now() + SYN_REPLY_TIMEOUT;
    let mut iter = transport::tcp_packet_iter(&mut rx);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("[syn:{}:{}] no reply before timeout", dst_ip, port);
            return ScanState::Filtered;
        }
        match iter.next_with_timeout(remaining) {
            Ok(Some((reply, addr))) => {
                if addr != IpAddr::V4(dst_ip)
                    || reply.get_source() != port
                    || reply.get_destination() != src_port
                {
                    continue;
                }
                let flags = reply.get_flags();
                debug!("[syn:{}:{}] reply flags {:#04x}", dst_ip, port, flags);
                if flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK != 0 {
                    return ScanState::Open;
                }
                if flags & TcpFlags::RST != 0 {
                    return ScanState::Closed;
                }
                // unexpected flags, keep listening until the deadline
            }
            Ok(None) => {}
            Err(e) => {
                debug!("[syn:{}:{}] receive error: {}", dst_ip, port, e);
                return ScanState::Filtered;
            }
        }
    }
}

/// Fill `buf` with a complete IPv4+TCP SYN packet. The TCP checksum covers
/// the IPv4 pseudo-header; the IP checksum is computed last.
fn build_syn_packet(buf: &mut [u8], src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) {
    let total_len = buf.len();
    {
        let mut tcp_header = MutableTcpPacket::new(&mut buf[IPV4_HEADER_LEN..]).unwrap();
        tcp_header.set_source(src_port);
        tcp_header.set_destination(dst_port);
        tcp_header.set_sequence(thread_rng().gen());
        tcp_header.set_acknowledgement(0);
        tcp_header.set_data_offset((TCP_HEADER_LEN / 4) as u8);
        tcp_header.set_flags(TcpFlags::SYN);
        tcp_header.set_window(64240);
        tcp_header.set_urgent_ptr(0);
        let checksum = tcp::ipv4_checksum(&tcp_header.to_immutable(), &src_ip, &dst_ip);
        tcp_header.set_checksum(checksum);
    }
    {
        let mut ip_header = MutableIpv4Packet::new(buf).unwrap();
        ip_header.set_version(4);
        ip_header.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip_header.set_total_length(total_len as u16);
        ip_header.set_ttl(64);
        ip_header.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip_header.set_source(src_ip);
        ip_header.set_destination(dst_ip);
        ip_header.set_identification(thread_rng().gen());
        ip_header.set_flags(Ipv4Flags::DontFragment);
        let checksum = ipv4::checksum(&ip_header.to_immutable());
        ip_header.set_checksum(checksum);
    }
}

/// Validate prerequisites for UDP scanning: basic name resolution works.
/// No elevated privileges are needed for datagram sockets.
pub async fn init_udp_scan() -> Result<()> {
    tokio::net::lookup_host("localhost:0")
        .await
        .map(|_| ())
        .context("UDP scan requires network resolution capability")
}

/// Probe one port with a UDP datagram.
///
/// UDP gives no handshake to lean on: a response means open, an ICMP
/// unreachable surfaced as a socket error means closed, and silence is the
/// ambiguous `Open|Filtered`. Never populates `service`.
pub async fn udp_probe(host: &str, port: u16) -> ScanResult {
    let state = udp_probe_state(host, port).await;
    result(host, port, state, String::new())
}

async fn udp_probe_state(host: &str, port: u16) -> ScanState {
    let address = format!("{}:{}", host, port);

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("[udp:{}:{}] bind error: {}", host, port, e);
            return ScanState::Closed;
        }
    };

    match timeout(UDP_TIMEOUT, socket.connect(address.as_str())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("[udp:{}:{}] connect error: {}", host, port, e);
            return ScanState::Closed;
        }
        Err(_) => return ScanState::OpenFiltered,
    }

    // single zero byte, enough to provoke a reply or an ICMP error
    if socket.send(&[0]).await.is_err() {
        return ScanState::OpenFiltered;
    }

    let mut buffer = [0u8; UDP_BUFFER_SIZE];
    match timeout(UDP_TIMEOUT, socket.recv(&mut buffer)).await {
        Err(_) => ScanState::OpenFiltered,
        Ok(Ok(n)) if n > 0 => {
            debug!("[udp:{}:{}] received {} byte response", host, port, n);
            ScanState::Open
        }
        Ok(Ok(_)) => ScanState::OpenFiltered,
        Ok(Err(e)) => {
            debug!("[udp:{}:{}] recv error: {}", host, port, e);
            ScanState::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::tcp::TcpPacket;
    use pnet::packet::Packet;

    #[test]
    fn syn_packet_is_well_formed() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(192, 0, 2, 80);
        let mut buf = [0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
        build_syn_packet(&mut buf, src, dst, 40123, 443);

        let ip = Ipv4Packet::new(&buf).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_ttl(), 64);
        assert_eq!(ip.get_source(), src);
        assert_eq!(ip.get_destination(), dst);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ip.get_total_length() as usize, buf.len());
        assert_eq!(ipv4::checksum(&ip), ip.get_checksum());

        let tcp_segment = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp_segment.get_source(), 40123);
        assert_eq!(tcp_segment.get_destination(), 443);
        assert_eq!(tcp_segment.get_flags(), TcpFlags::SYN);
        assert_eq!(
            tcp::ipv4_checksum(&tcp_segment, &src, &dst),
            tcp_segment.get_checksum()
        );
    }

    #[tokio::test]
    async fn udp_init_passes_on_loopback() {
        assert!(init_udp_scan().await.is_ok());
    }
}
