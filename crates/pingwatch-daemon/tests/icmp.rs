//! Raw-socket tests for the ICMP listener.
//!
//! Sends real echo requests over loopback and reads them back through
//! `IcmpListener`. Opening raw sockets needs CAP_NET_RAW or root; without it
//! these tests return early.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use pingwatch_core::{PacketSource, SourceCloser};
use pingwatch_daemon::IcmpListener;
use pnet::packet::Packet;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::transport::TransportChannelType::Layer4;
use pnet::transport::TransportProtocol::Ipv4;
use pnet::transport::{TransportSender, transport_channel};
use tokio::time::timeout;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn permission_denied(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied
}

/// Listener on loopback, or None when raw sockets are not allowed.
fn bind_or_skip() -> Option<IcmpListener> {
    match IcmpListener::bind(Ipv4Addr::LOCALHOST) {
        Ok(listener) => Some(listener),
        Err(e) if permission_denied(&e) => {
            eprintln!("skipping raw socket test: {e}");
            None
        }
        Err(e) => panic!("Failed to open ICMP listener: {e}"),
    }
}

fn sender() -> TransportSender {
    let (tx, _rx) = transport_channel(1024, Layer4(Ipv4(IpNextHeaderProtocols::Icmp)))
        .expect("listener opened, so the sender should too");
    tx
}

/// Echo request with `payload_len` bytes of payload and a valid checksum.
fn echo_request(payload_len: usize, sequence: u16) -> Vec<u8> {
    let mut buf = vec![0u8; MutableEchoRequestPacket::minimum_packet_size() + payload_len];
    let mut packet = MutableEchoRequestPacket::new(&mut buf).unwrap();
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_identifier(0x7077);
    packet.set_sequence_number(sequence);
    let checksum = icmp::checksum(&IcmpPacket::new(packet.packet()).unwrap());
    packet.set_checksum(checksum);
    buf
}

fn ping(tx: &mut TransportSender, payload_len: usize, sequence: u16) {
    let buf = echo_request(payload_len, sequence);
    tx.send_to(IcmpPacket::new(&buf).unwrap(), LOOPBACK)
        .expect("send echo request");
}

async fn next_source(listener: &mut IcmpListener) -> IpAddr {
    timeout(Duration::from_secs(3), listener.recv_source())
        .await
        .expect("echo request should be reported")
        .expect("listener should stay open")
}

// ==================== Receive path ====================

#[tokio::test]
async fn test_loopback_echo_request_reported() {
    let Some(mut listener) = bind_or_skip() else {
        return;
    };
    let mut tx = sender();

    ping(&mut tx, 56, 1);

    assert_eq!(next_source(&mut listener).await, LOOPBACK);
}

#[tokio::test]
async fn test_empty_payload_does_not_stop_listener() {
    let Some(mut listener) = bind_or_skip() else {
        return;
    };
    let mut tx = sender();

    // 8-byte ICMP message, shorter than an IPv4 header on its own
    ping(&mut tx, 0, 1);
    assert_eq!(next_source(&mut listener).await, LOOPBACK);

    ping(&mut tx, 56, 2);
    assert_eq!(next_source(&mut listener).await, LOOPBACK);
}

#[tokio::test]
async fn test_close_after_traffic() {
    let Some(mut listener) = bind_or_skip() else {
        return;
    };
    let mut tx = sender();
    let closer = listener.closer();

    ping(&mut tx, 16, 1);
    assert_eq!(next_source(&mut listener).await, LOOPBACK);

    closer.close();
    let err = listener.recv_source().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);
}
