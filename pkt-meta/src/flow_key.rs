// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::envelope::MetadataEnvelope;

/// IANA protocol numbers for the transports the data path knows.
pub struct IpProto;

impl IpProto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// The identifying tuple of a flow.
///
/// IPv4 addresses occupy the first four bytes of the address fields; the
/// remaining bytes are zero. `ip_version` tells the two apart.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowKey {
    src: [u8; 16],
    dst: [u8; 16],
    src_port: u16,
    dst_port: u16,
    proto: u8,
    ip_version: u8,
    pad: [u8; 2],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FlowKey>(), 40);

impl FlowKey {
    /// Build a key from its parts.
    ///
    /// Mixed address families have no flow; the destination is then taken
    /// as the unspecified address of the source family.
    #[must_use]
    pub fn new(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, proto: u8) -> Self {
        let mut key = FlowKey {
            src_port,
            dst_port,
            proto,
            ..Default::default()
        };
        match (src, dst) {
            (IpAddr::V4(s), d) => {
                key.ip_version = 4;
                key.src[..4].copy_from_slice(&s.octets());
                if let IpAddr::V4(d) = d {
                    key.dst[..4].copy_from_slice(&d.octets());
                }
            }
            (IpAddr::V6(s), d) => {
                key.ip_version = 6;
                key.src = s.octets();
                if let IpAddr::V6(d) = d {
                    key.dst = d.octets();
                }
            }
        }
        key
    }

    /// Key of the flow the envelope belongs to. `None` without a network layer.
    #[must_use]
    pub fn from_envelope(env: &MetadataEnvelope) -> Option<Self> {
        let (src_port, dst_port) = if let Some(tcp) = env.tcp_meta() {
            (tcp.src_port, tcp.dst_port)
        } else if let Some(udp) = env.udp_meta() {
            (udp.src_port, udp.dst_port)
        } else {
            (0, 0)
        };
        if let Some(ip) = env.ipv4_meta() {
            return Some(Self::new(
                ip.src_addr().into(),
                ip.dst_addr().into(),
                src_port,
                dst_port,
                ip.proto,
            ));
        }
        env.ipv6_meta().map(|ip| {
            Self::new(
                ip.src_addr().into(),
                ip.dst_addr().into(),
                src_port,
                dst_port,
                ip.proto,
            )
        })
    }

    /// The same flow seen from the other direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        FlowKey {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..*self
        }
    }

    #[must_use]
    pub fn src_addr(&self) -> IpAddr {
        self.addr(&self.src)
    }

    #[must_use]
    pub fn dst_addr(&self) -> IpAddr {
        self.addr(&self.dst)
    }

    #[must_use]
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    #[must_use]
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    #[must_use]
    pub fn proto(&self) -> u8 {
        self.proto
    }

    fn addr(&self, raw: &[u8; 16]) -> IpAddr {
        if self.ip_version == 4 {
            IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
        } else {
            IpAddr::V6(Ipv6Addr::from(*raw))
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src_addr(),
            self.src_port,
            self.dst_addr(),
            self.dst_port,
            self.proto
        )
    }
}

impl std::fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlowKey({self})")
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use super::FlowKey;
    use bolero::{Driver, TypeGenerator};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    impl TypeGenerator for FlowKey {
        fn generate<D: Driver>(d: &mut D) -> Option<Self> {
            let (src, dst): (IpAddr, IpAddr) = if d.produce::<bool>()? {
                (
                    Ipv4Addr::from(d.produce::<u32>()?).into(),
                    Ipv4Addr::from(d.produce::<u32>()?).into(),
                )
            } else {
                (
                    Ipv6Addr::from(d.produce::<u128>()?).into(),
                    Ipv6Addr::from(d.produce::<u128>()?).into(),
                )
            };
            Some(FlowKey::new(
                src,
                dst,
                d.produce()?,
                d.produce()?,
                d.produce()?,
            ))
        }
    }
}
