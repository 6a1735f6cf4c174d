//! ICMP echo-request listener.
//!
//! Reads raw IPv4 datagrams on a dedicated OS thread (pnet's receive iterator
//! is blocking) and bridges the source addresses of echo requests into tokio
//! through an unbounded channel.
//!
//! The channel is opened at layer 3 so every read yields the whole datagram,
//! IP header included. A layer-4 channel strips the header before the
//! iterator sees it, leaving nothing to filter on.

use async_trait::async_trait;
use pingwatch_core::{PacketSource, SourceCloser};
use pnet::packet::Packet;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::transport::TransportChannelType::Layer3;
use pnet::transport::{TransportReceiver, ipv4_packet_iter, transport_channel};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error};

/// Receive buffer for the raw socket.
const BUFFER_SIZE: usize = 4096;

/// How often the reader thread checks for shutdown while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Closed flag shared by the listener, its closer and the reader thread.
#[derive(Default)]
struct CloseState {
    closed: AtomicBool,
    wake: Notify,
}

impl CloseState {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Closes an `IcmpListener` from another task.
#[derive(Clone)]
pub struct IcmpCloser(Arc<CloseState>);

impl SourceCloser for IcmpCloser {
    fn close(&self) {
        self.0.close();
    }
}

/// Packet source yielding the senders of ICMP echo requests.
pub struct IcmpListener {
    local: Ipv4Addr,
    packets: mpsc::UnboundedReceiver<io::Result<IpAddr>>,
    state: Arc<CloseState>,
}

impl IcmpListener {
    /// Open a raw ICMP socket and start reading.
    ///
    /// Only echo requests addressed to `local` are reported, or every echo
    /// request when `local` is unspecified. Needs CAP_NET_RAW or root.
    pub fn bind(local: Ipv4Addr) -> io::Result<Self> {
        let protocol = Layer3(IpNextHeaderProtocols::Icmp);
        let (_tx, rx) = transport_channel(BUFFER_SIZE, protocol)?;

        let (packet_tx, packets) = mpsc::unbounded_channel();
        let state = Arc::new(CloseState::default());
        let thread_state = Arc::clone(&state);

        thread::Builder::new()
            .name("icmp-reader".to_string())
            .spawn(move || read_packets(rx, local, packet_tx, thread_state))?;

        Ok(Self {
            local,
            packets,
            state,
        })
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local
    }
}

#[async_trait]
impl PacketSource for IcmpListener {
    type Closer = IcmpCloser;

    async fn recv_source(&mut self) -> io::Result<IpAddr> {
        if self.state.is_closed() {
            return Err(closed_error());
        }

        tokio::select! {
            biased;
            _ = self.state.wake.notified() => Err(closed_error()),
            packet = self.packets.recv() => packet.unwrap_or_else(|| Err(closed_error())),
        }
    }

    fn closer(&self) -> IcmpCloser {
        IcmpCloser(Arc::clone(&self.state))
    }
}

impl Drop for IcmpListener {
    fn drop(&mut self) {
        // Lets the reader thread exit on its next poll
        self.state.close();
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "ICMP listener closed")
}

/// Reader thread body. Runs until closed, the receiver is dropped, or the
/// socket fails.
fn read_packets(
    mut rx: TransportReceiver,
    local: Ipv4Addr,
    packets: mpsc::UnboundedSender<io::Result<IpAddr>>,
    state: Arc<CloseState>,
) {
    let mut iter = ipv4_packet_iter(&mut rx);

    while !state.is_closed() {
        match iter.next_with_timeout(POLL_INTERVAL) {
            Ok(Some((packet, _))) => {
                if let Some(source) = echo_request_source(&packet, local) {
                    if packets.send(Ok(source)).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                if !state.is_closed() {
                    error!("ICMP read failed: {}", e);
                    let _ = packets.send(Err(e));
                }
                break;
            }
        }
    }

    debug!("ICMP reader stopped");
}

/// Source address of `packet` if it is an ICMP echo request for `local`.
fn echo_request_source(packet: &Ipv4Packet<'_>, local: Ipv4Addr) -> Option<IpAddr> {
    if packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    if !local.is_unspecified() && packet.get_destination() != local {
        return None;
    }

    let icmp = IcmpPacket::new(packet.payload())?;
    if icmp.get_icmp_type() != IcmpTypes::EchoRequest {
        return None;
    }
    Some(IpAddr::V4(packet.get_source()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp::{IcmpType, MutableIcmpPacket};
    use pnet::packet::ip::IpNextHeaderProtocol;
    use pnet::packet::ipv4::MutableIpv4Packet;

    const HEADER_LEN: usize = 20;
    const ICMP_LEN: usize = 8;

    fn datagram(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: IpNextHeaderProtocol,
        icmp_type: IcmpType,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + ICMP_LEN];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((HEADER_LEN + ICMP_LEN) as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(protocol);
            ip.set_source(source);
            ip.set_destination(destination);
        }
        let mut icmp = MutableIcmpPacket::new(&mut buf[HEADER_LEN..]).unwrap();
        icmp.set_icmp_type(icmp_type);
        buf
    }

    fn source(buf: &[u8], local: Ipv4Addr) -> Option<IpAddr> {
        echo_request_source(&Ipv4Packet::new(buf).unwrap(), local)
    }

    const PEER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    // ==================== Filtering ====================

    #[test]
    fn test_echo_request_accepted() {
        let buf = datagram(PEER, LOCAL, IpNextHeaderProtocols::Icmp, IcmpTypes::EchoRequest);
        assert_eq!(source(&buf, LOCAL), Some(IpAddr::V4(PEER)));
    }

    #[test]
    fn test_unspecified_local_accepts_any_destination() {
        let buf = datagram(
            PEER,
            Ipv4Addr::new(198, 51, 100, 1),
            IpNextHeaderProtocols::Icmp,
            IcmpTypes::EchoRequest,
        );
        assert_eq!(source(&buf, Ipv4Addr::UNSPECIFIED), Some(IpAddr::V4(PEER)));
    }

    #[test]
    fn test_other_destination_rejected() {
        let buf = datagram(
            PEER,
            Ipv4Addr::new(198, 51, 100, 1),
            IpNextHeaderProtocols::Icmp,
            IcmpTypes::EchoRequest,
        );
        assert_eq!(source(&buf, LOCAL), None);
    }

    #[test]
    fn test_echo_reply_rejected() {
        let buf = datagram(PEER, LOCAL, IpNextHeaderProtocols::Icmp, IcmpTypes::EchoReply);
        assert_eq!(source(&buf, LOCAL), None);
    }

    #[test]
    fn test_non_icmp_rejected() {
        let buf = datagram(PEER, LOCAL, IpNextHeaderProtocols::Udp, IcmpTypes::EchoRequest);
        assert_eq!(source(&buf, LOCAL), None);
    }

    #[test]
    fn test_truncated_icmp_rejected() {
        let mut buf = datagram(PEER, LOCAL, IpNextHeaderProtocols::Icmp, IcmpTypes::EchoRequest);
        buf.truncate(HEADER_LEN + 2);
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
            ip.set_total_length((HEADER_LEN + 2) as u16);
        }
        assert_eq!(source(&buf, LOCAL), None);
    }

    // ==================== Closing ====================

    fn detached_listener() -> (IcmpListener, mpsc::UnboundedSender<io::Result<IpAddr>>) {
        let (tx, packets) = mpsc::unbounded_channel();
        let listener = IcmpListener {
            local: Ipv4Addr::UNSPECIFIED,
            packets,
            state: Arc::new(CloseState::default()),
        };
        (listener, tx)
    }

    #[tokio::test]
    async fn test_recv_forwards_sources() {
        let (mut listener, tx) = detached_listener();
        tx.send(Ok(IpAddr::V4(PEER))).unwrap();
        assert_eq!(listener.recv_source().await.unwrap(), IpAddr::V4(PEER));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (mut listener, _tx) = detached_listener();
        let closer = listener.closer();

        let pending = tokio::spawn(async move { listener.recv_source().await });
        tokio::task::yield_now().await;
        closer.close();

        let err = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_recv_after_close_fails() {
        let (mut listener, tx) = detached_listener();
        tx.send(Ok(IpAddr::V4(PEER))).unwrap();
        listener.closer().close();

        let err = listener.recv_source().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_reader_gone_reports_closed() {
        let (mut listener, tx) = detached_listener();
        drop(tx);
        let err = listener.recv_source().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
