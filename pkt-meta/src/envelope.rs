// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The metadata envelope.

use std::net::{Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;

bitflags! {
    /// Which sub-records of a [`MetadataEnvelope`] hold meaningful data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetadataSet: u32 {
        const IPV4 = 1 << 0;
        const IPV6 = 1 << 1;
        const TCP = 1 << 2;
        const UDP = 1 << 3;
    }
}

bitflags! {
    /// Conditions noticed while parsing the frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketEvents: u32 {
        /// The IP packet is a fragment; no transport header was read.
        const FRAGMENTED = 1 << 0;
        /// The IPv4 header checksum does not match.
        const BAD_L3_CHECKSUM = 1 << 1;
        /// The transport protocol is neither TCP nor UDP.
        const UNKNOWN_L4 = 1 << 2;
        const IPV4_OPTIONS = 1 << 3;
        const IPV6_EXTENSIONS = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
        const ECE = 1 << 6;
        const CWR = 1 << 7;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv4Meta {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub ident: u16,
    /// Flags and fragment offset, as in the header.
    pub frag: u16,
    pub tos: u8,
    pub ttl: u8,
    pub proto: u8,
    pub(crate) pad: u8,
}

impl Ipv4Meta {
    #[must_use]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    #[must_use]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv6Meta {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub flow_label: u32,
    pub hop_limit: u8,
    pub traffic_class: u8,
    /// Protocol of the payload after any extension headers.
    pub proto: u8,
    pub(crate) pad: u8,
}

impl Ipv6Meta {
    #[must_use]
    pub fn src_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.src)
    }

    #[must_use]
    pub fn dst_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.dst)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpMeta {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u16,
    /// Header plus payload.
    pub l4_len: u16,
    pub window: u16,
    pub(crate) flags: u8,
    pub(crate) pad: u8,
}

impl TcpMeta {
    #[must_use]
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_retain(self.flags)
    }

    pub fn set_flags(&mut self, flags: TcpFlags) {
        self.flags = flags.bits();
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UdpMeta {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u16,
    pub l4_len: u16,
}

/// Parsed L3/L4 fields of one packet.
///
/// Exactly one of the IPv4 and IPv6 records is valid, and at most one of the
/// TCP and UDP records, as told by the marker. The accessors only hand out
/// records whose marker bit is set; the others hold unspecified values.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataEnvelope {
    marker: MetadataSet,
    events: PacketEvents,
    ipv4: Ipv4Meta,
    ipv6: Ipv6Meta,
    tcp: TcpMeta,
    udp: UdpMeta,
}

static_assertions::assert_impl_all!(MetadataEnvelope: Copy, Send, Sync);

impl MetadataEnvelope {
    #[must_use]
    pub fn ipv4(ip: Ipv4Meta) -> Self {
        Self {
            marker: MetadataSet::IPV4,
            ipv4: ip,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn ipv6(ip: Ipv6Meta) -> Self {
        Self {
            marker: MetadataSet::IPV6,
            ipv6: ip,
            ..Default::default()
        }
    }

    /// Attach a TCP record, replacing any transport record.
    #[must_use]
    pub fn with_tcp(mut self, tcp: TcpMeta) -> Self {
        self.marker.remove(MetadataSet::UDP);
        self.marker.insert(MetadataSet::TCP);
        self.tcp = tcp;
        self
    }

    /// Attach a UDP record, replacing any transport record.
    #[must_use]
    pub fn with_udp(mut self, udp: UdpMeta) -> Self {
        self.marker.remove(MetadataSet::TCP);
        self.marker.insert(MetadataSet::UDP);
        self.udp = udp;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: PacketEvents) -> Self {
        self.events |= events;
        self
    }

    /// The marker, with any bits that break the envelope invariants removed.
    ///
    /// Envelopes may come from another process, so the raw marker is not trusted.
    #[must_use]
    pub fn marker(&self) -> MetadataSet {
        let mut marker = self.marker & MetadataSet::all();
        if marker.contains(MetadataSet::IPV4 | MetadataSet::IPV6) {
            marker.remove(MetadataSet::IPV4 | MetadataSet::IPV6);
        }
        if marker.contains(MetadataSet::TCP | MetadataSet::UDP) {
            marker.remove(MetadataSet::TCP | MetadataSet::UDP);
        }
        if !marker.intersects(MetadataSet::IPV4 | MetadataSet::IPV6) {
            marker = MetadataSet::empty();
        }
        marker
    }

    #[must_use]
    pub fn events(&self) -> PacketEvents {
        self.events
    }

    #[must_use]
    pub fn ipv4_meta(&self) -> Option<&Ipv4Meta> {
        self.marker()
            .contains(MetadataSet::IPV4)
            .then_some(&self.ipv4)
    }

    #[must_use]
    pub fn ipv6_meta(&self) -> Option<&Ipv6Meta> {
        self.marker()
            .contains(MetadataSet::IPV6)
            .then_some(&self.ipv6)
    }

    #[must_use]
    pub fn tcp_meta(&self) -> Option<&TcpMeta> {
        self.marker().contains(MetadataSet::TCP).then_some(&self.tcp)
    }

    #[must_use]
    pub fn udp_meta(&self) -> Option<&UdpMeta> {
        self.marker().contains(MetadataSet::UDP).then_some(&self.udp)
    }

    /// Protocol number of the transport layer, if there is a network layer.
    #[must_use]
    pub fn ip_proto(&self) -> Option<u8> {
        self.ipv4_meta()
            .map(|ip| ip.proto)
            .or_else(|| self.ipv6_meta().map(|ip| ip.proto))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v4() -> Ipv4Meta {
        Ipv4Meta {
            src: [10, 0, 0, 1],
            dst: [10, 0, 0, 2],
            ttl: 64,
            proto: 6,
            ..Default::default()
        }
    }

    #[test]
    fn accessors_follow_marker() {
        let env = MetadataEnvelope::ipv4(v4()).with_tcp(TcpMeta {
            src_port: 1234,
            dst_port: 80,
            ..Default::default()
        });
        assert_eq!(env.ipv4_meta().map(Ipv4Meta::src_addr), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(env.ipv6_meta().is_none());
        assert_eq!(env.tcp_meta().map(|t| t.dst_port), Some(80));
        assert!(env.udp_meta().is_none());
        assert_eq!(env.ip_proto(), Some(6));
    }

    #[test]
    fn transport_records_are_exclusive() {
        let env = MetadataEnvelope::ipv4(v4())
            .with_tcp(TcpMeta::default())
            .with_udp(UdpMeta {
                dst_port: 53,
                ..Default::default()
            });
        assert!(env.tcp_meta().is_none());
        assert_eq!(env.udp_meta().map(|u| u.dst_port), Some(53));
    }

    #[test]
    fn inconsistent_marker_exposes_nothing_ambiguous() {
        let mut env = MetadataEnvelope::ipv4(v4());
        env.marker = MetadataSet::IPV4 | MetadataSet::IPV6 | MetadataSet::TCP;
        assert!(env.ipv4_meta().is_none());
        assert!(env.ipv6_meta().is_none());
        assert!(env.tcp_meta().is_none());

        env.marker = MetadataSet::from_bits_retain(0xffff_0000);
        assert_eq!(env.marker(), MetadataSet::empty());
    }

    #[test]
    fn tcp_flags_round_trip() {
        let mut tcp = TcpMeta::default();
        tcp.set_flags(TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(tcp.flags(), TcpFlags::SYN | TcpFlags::ACK);
    }
}
