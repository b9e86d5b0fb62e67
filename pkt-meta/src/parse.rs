// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Filling an envelope from a raw Ethernet frame.

use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use tracing::trace;

use crate::envelope::{
    Ipv4Meta, Ipv6Meta, MetadataEnvelope, PacketEvents, TcpFlags, TcpMeta, UdpMeta,
};

use tracectl::trace_target;
trace_target!("pkt-meta", LevelFilter::INFO, &["pkt-meta"]);

const IPV4_DF: u16 = 0x4000;
const IPV4_MF: u16 = 0x2000;
const IPV4_MIN_HEADER_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Frame(#[from] etherparse::err::packet::SliceError),
    #[error("frame carries no network layer")]
    NoNetworkLayer,
    #[error("network layer is neither IPv4 nor IPv6")]
    UnsupportedNetworkLayer,
}

fn clamp(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

impl MetadataEnvelope {
    /// Parse the L3 and L4 headers of an Ethernet frame.
    ///
    /// # Errors
    ///
    /// Fails if the headers are truncated or inconsistent, or if the frame
    /// has no IP layer.
    pub fn parse(frame: &[u8]) -> Result<Self, ParseError> {
        let headers = PacketHeaders::from_ethernet_slice(frame).inspect_err(|e| {
            trace!("Failed to parse frame of {} bytes: {e}", frame.len());
        })?;

        let (mut env, ip_payload_len) = match headers.net {
            Some(NetHeaders::Ipv4(ip, exts)) => {
                let mut events = PacketEvents::empty();
                let mut frag = ip.fragment_offset.value();
                if ip.dont_fragment {
                    frag |= IPV4_DF;
                }
                if ip.more_fragments {
                    frag |= IPV4_MF;
                }
                if ip.more_fragments || ip.fragment_offset.value() != 0 {
                    events |= PacketEvents::FRAGMENTED;
                }
                if ip.header_checksum != ip.calc_header_checksum() {
                    events |= PacketEvents::BAD_L3_CHECKSUM;
                }
                if ip.header_len() > IPV4_MIN_HEADER_LEN {
                    events |= PacketEvents::IPV4_OPTIONS;
                }
                // with an AH header, `protocol` names the extension
                let proto = match &headers.transport {
                    Some(TransportHeader::Tcp(_)) => crate::IpProto::TCP,
                    Some(TransportHeader::Udp(_)) => crate::IpProto::UDP,
                    Some(TransportHeader::Icmpv4(_)) => crate::IpProto::ICMP,
                    _ => exts.auth.as_ref().map_or(ip.protocol.0, |ah| ah.next_header.0),
                };
                let meta = Ipv4Meta {
                    src: ip.source,
                    dst: ip.destination,
                    ident: ip.identification,
                    frag,
                    tos: (ip.dscp.value() << 2) | ip.ecn.value(),
                    ttl: ip.time_to_live,
                    proto,
                    pad: 0,
                };
                let payload = usize::from(ip.total_len)
                    .saturating_sub(ip.header_len())
                    .saturating_sub(exts.header_len());
                (MetadataEnvelope::ipv4(meta).with_events(events), payload)
            }
            Some(NetHeaders::Ipv6(ip, exts)) => {
                let mut events = PacketEvents::empty();
                if exts.header_len() > 0 {
                    events |= PacketEvents::IPV6_EXTENSIONS;
                }
                let proto = match &headers.transport {
                    Some(TransportHeader::Tcp(_)) => crate::IpProto::TCP,
                    Some(TransportHeader::Udp(_)) => crate::IpProto::UDP,
                    Some(TransportHeader::Icmpv6(_)) => crate::IpProto::ICMPV6,
                    _ => ip.next_header.0,
                };
                let meta = Ipv6Meta {
                    src: ip.source,
                    dst: ip.destination,
                    flow_label: ip.flow_label.value(),
                    hop_limit: ip.hop_limit,
                    traffic_class: ip.traffic_class,
                    proto,
                    pad: 0,
                };
                let payload = usize::from(ip.payload_length).saturating_sub(exts.header_len());
                (MetadataEnvelope::ipv6(meta).with_events(events), payload)
            }
            Some(_) => return Err(ParseError::UnsupportedNetworkLayer),
            None => return Err(ParseError::NoNetworkLayer),
        };

        match headers.transport {
            Some(TransportHeader::Tcp(tcp)) => {
                let mut meta = TcpMeta {
                    src_port: tcp.source_port,
                    dst_port: tcp.destination_port,
                    payload_len: clamp(ip_payload_len.saturating_sub(tcp.header_len())),
                    l4_len: clamp(ip_payload_len),
                    window: tcp.window_size,
                    ..Default::default()
                };
                meta.set_flags(tcp_flags(&tcp));
                env = env.with_tcp(meta);
            }
            Some(TransportHeader::Udp(udp)) => {
                env = env.with_udp(UdpMeta {
                    src_port: udp.source_port,
                    dst_port: udp.destination_port,
                    payload_len: udp.length.saturating_sub(8),
                    l4_len: udp.length,
                });
            }
            Some(_) => {}
            None if env.events().contains(PacketEvents::FRAGMENTED) => {}
            None => env = env.with_events(PacketEvents::UNKNOWN_L4),
        }
        Ok(env)
    }
}

fn tcp_flags(tcp: &etherparse::TcpHeader) -> TcpFlags {
    let mut flags = TcpFlags::empty();
    flags.set(TcpFlags::FIN, tcp.fin);
    flags.set(TcpFlags::SYN, tcp.syn);
    flags.set(TcpFlags::RST, tcp.rst);
    flags.set(TcpFlags::PSH, tcp.psh);
    flags.set(TcpFlags::ACK, tcp.ack);
    flags.set(TcpFlags::URG, tcp.urg);
    flags.set(TcpFlags::ECE, tcp.ece);
    flags.set(TcpFlags::CWR, tcp.cwr);
    flags
}
