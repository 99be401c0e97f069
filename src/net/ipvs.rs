//! IPVS generic-netlink adapter.
//!
//! Speaks the kernel's "IPVS" genetlink family directly: service and
//! destination CRUD plus the global timeout config. Attribute numbering
//! follows include/uapi/linux/ip_vs.h.

use async_trait::async_trait;
use futures::StreamExt;
use genetlink::GenetlinkHandle;
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_generic::{GenlFamily, GenlHeader, GenlMessage};
use netlink_packet_utils::nla::{DefaultNla, Nla, NlaBuffer, NlasIterator};
use netlink_packet_utils::parsers::{parse_string, parse_u16, parse_u16_be, parse_u32};
use netlink_packet_utils::{DecodeError, Emitable, Parseable, ParseableParametrized};
use std::net::IpAddr;
use std::time::Duration;

use crate::net::error::{KernelError, KernelResult};
use crate::net::IpFamily;

// ── Service flag bits (ip_vs.h) ───────────────────────────────────────

pub const IP_VS_SVC_F_PERSISTENT: u32 = 0x0001;
pub const IP_VS_SVC_F_HASHED: u32 = 0x0002;
pub const IP_VS_SVC_F_SCHED1: u32 = 0x0008;
pub const IP_VS_SVC_F_SCHED2: u32 = 0x0010;
pub const IP_VS_SVC_F_SCHED3: u32 = 0x0020;

/// Bits that describe scheduler behavior (sh-fallback / sh-port).
pub const SCHED_FLAGS_MASK: u32 = IP_VS_SVC_F_SCHED1 | IP_VS_SVC_F_SCHED2 | IP_VS_SVC_F_SCHED3;

pub const ROUND_ROBIN: &str = "rr";

// ── Forwarding methods (connection flags, low bits) ───────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMethod {
    Masquerade,
    Tunnel,
    DirectRoute,
}

impl ForwardMethod {
    fn to_u32(self) -> u32 {
        match self {
            ForwardMethod::Masquerade => 0,
            ForwardMethod::Tunnel => 2,
            ForwardMethod::DirectRoute => 3,
        }
    }

    fn from_u32(v: u32) -> Self {
        match v & 0x0007 {
            2 => ForwardMethod::Tunnel,
            3 => ForwardMethod::DirectRoute,
            _ => ForwardMethod::Masquerade,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn number(self) -> u16 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Sctp => 132,
        }
    }

    pub fn from_number(n: u16) -> Option<Self> {
        match n {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            132 => Some(Protocol::Sctp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a virtual service: either an (addr, proto, port) triple or a
/// firewall mark, always scoped to an address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VsKey {
    Addr(IpFamily, Protocol, IpAddr, u16),
    FwMark(IpFamily, u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualServer {
    pub family: IpFamily,
    pub protocol: Option<Protocol>,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub fwmark: u32,
    pub scheduler: String,
    pub flags: u32,
    /// Persistence timeout in seconds (meaningful when persistent).
    pub timeout: u32,
    pub netmask: u32,
}

impl VirtualServer {
    pub fn key(&self) -> Option<VsKey> {
        if self.fwmark != 0 {
            return Some(VsKey::FwMark(self.family, self.fwmark));
        }
        match (self.address, self.protocol) {
            (Some(addr), Some(proto)) => Some(VsKey::Addr(self.family, proto, addr, self.port)),
            _ => None,
        }
    }

    pub fn persistent(&self) -> bool {
        self.flags & IP_VS_SVC_F_PERSISTENT != 0
    }

    pub fn set_persistence(&mut self, persistent: bool, timeout: u32) {
        if persistent {
            self.flags |= IP_VS_SVC_F_PERSISTENT;
            self.timeout = timeout;
        } else {
            self.flags &= !IP_VS_SVC_F_PERSISTENT;
            self.timeout = 0;
        }
    }

    pub fn sched_flags(&self) -> u32 {
        self.flags & SCHED_FLAGS_MASK
    }

    pub fn set_sched_flags(&mut self, sched_flags: u32) {
        self.flags = (self.flags & !SCHED_FLAGS_MASK) | (sched_flags & SCHED_FLAGS_MASK);
    }

    fn identity_attrs(&self) -> Vec<SvcAttr> {
        let mut attrs = vec![SvcAttr::AddressFamily(self.family.af())];
        if self.fwmark != 0 {
            attrs.push(SvcAttr::FwMark(self.fwmark));
        } else {
            if let Some(proto) = self.protocol {
                attrs.push(SvcAttr::Protocol(proto.number()));
            }
            if let Some(addr) = self.address {
                attrs.push(SvcAttr::Address(ip_bytes(addr)));
            }
            attrs.push(SvcAttr::Port(self.port));
        }
        attrs
    }

    fn full_attrs(&self) -> Vec<SvcAttr> {
        let mut attrs = self.identity_attrs();
        attrs.push(SvcAttr::Scheduler(self.scheduler.clone()));
        attrs.push(SvcAttr::Flags {
            flags: self.flags,
            mask: u32::MAX,
        });
        attrs.push(SvcAttr::Timeout(self.timeout));
        attrs.push(SvcAttr::Netmask(self.netmask));
        attrs
    }

    fn from_attrs(attrs: &[SvcAttr]) -> KernelResult<Self> {
        let mut family = None;
        let mut vs = VirtualServer {
            family: IpFamily::V4,
            protocol: None,
            address: None,
            port: 0,
            fwmark: 0,
            scheduler: String::new(),
            flags: 0,
            timeout: 0,
            netmask: 0,
        };
        let mut raw_addr = None;
        for attr in attrs {
            match attr {
                SvcAttr::AddressFamily(af) => family = IpFamily::from_af(*af),
                SvcAttr::Protocol(p) => vs.protocol = Protocol::from_number(*p),
                SvcAttr::Address(bytes) => raw_addr = Some(bytes.clone()),
                SvcAttr::Port(p) => vs.port = *p,
                SvcAttr::FwMark(m) => vs.fwmark = *m,
                SvcAttr::Scheduler(s) => vs.scheduler = s.clone(),
                SvcAttr::Flags { flags, .. } => vs.flags = *flags & !IP_VS_SVC_F_HASHED,
                SvcAttr::Timeout(t) => vs.timeout = *t,
                SvcAttr::Netmask(n) => vs.netmask = *n,
                SvcAttr::Other(_) => {}
            }
        }
        let family = family
            .ok_or_else(|| KernelError::Parse("ipvs service without address family".into()))?;
        vs.family = family;
        if let Some(bytes) = raw_addr {
            vs.address = Some(addr_from_bytes(&bytes, family)?);
        }
        Ok(vs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealServer {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub forward_method: ForwardMethod,
    pub active_conns: u32,
    pub inactive_conns: u32,
}

impl RealServer {
    pub fn new(address: IpAddr, port: u16, weight: u32, forward_method: ForwardMethod) -> Self {
        Self {
            address,
            port,
            weight,
            forward_method,
            active_conns: 0,
            inactive_conns: 0,
        }
    }

    /// Connections the kernel is still tracking against this server.
    pub fn total_conns(&self) -> u32 {
        self.active_conns + self.inactive_conns
    }

    fn to_attrs(&self) -> Vec<DestAttr> {
        vec![
            DestAttr::Address(ip_bytes(self.address)),
            DestAttr::Port(self.port),
            DestAttr::FwdMethod(self.forward_method.to_u32()),
            DestAttr::Weight(self.weight),
            DestAttr::UpperThreshold(0),
            DestAttr::LowerThreshold(0),
        ]
    }

    fn from_attrs(attrs: &[DestAttr], service_family: IpFamily) -> KernelResult<Self> {
        let mut family = service_family;
        let mut raw_addr = None;
        let mut rs = RealServer {
            address: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            weight: 0,
            forward_method: ForwardMethod::Masquerade,
            active_conns: 0,
            inactive_conns: 0,
        };
        for attr in attrs {
            match attr {
                DestAttr::Address(bytes) => raw_addr = Some(bytes.clone()),
                DestAttr::Port(p) => rs.port = *p,
                DestAttr::FwdMethod(m) => rs.forward_method = ForwardMethod::from_u32(*m),
                DestAttr::Weight(w) => rs.weight = *w,
                DestAttr::ActiveConns(c) => rs.active_conns = *c,
                DestAttr::InactConns(c) => rs.inactive_conns = *c,
                DestAttr::AddressFamily(af) => {
                    if let Some(f) = IpFamily::from_af(*af) {
                        family = f;
                    }
                }
                _ => {}
            }
        }
        let bytes =
            raw_addr.ok_or_else(|| KernelError::Parse("ipvs destination without address".into()))?;
        rs.address = addr_from_bytes(&bytes, family)?;
        Ok(rs)
    }
}

impl IpFamily {
    pub fn from_af(af: u16) -> Option<Self> {
        if af == IpFamily::V4.af() {
            Some(IpFamily::V4)
        } else if af == IpFamily::V6.af() {
            Some(IpFamily::V6)
        } else {
            None
        }
    }
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn addr_from_bytes(bytes: &[u8], family: IpFamily) -> KernelResult<IpAddr> {
    match (family, bytes.len()) {
        (IpFamily::V4, 4) => Ok(IpAddr::from(<[u8; 4]>::try_from(bytes).unwrap())),
        // The kernel pads addresses to the size of nf_inet_addr.
        (IpFamily::V4, 16) => Ok(IpAddr::from(<[u8; 4]>::try_from(&bytes[..4]).unwrap())),
        (IpFamily::V6, 16) => Ok(IpAddr::from(<[u8; 16]>::try_from(bytes).unwrap())),
        _ => Err(KernelError::Parse(format!(
            "ipvs address of {} bytes for {}",
            bytes.len(),
            family
        ))),
    }
}

// ── Generic netlink plumbing ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum IpvsCommand {
    NewService = 1,
    SetService = 2,
    DelService = 3,
    GetService = 4,
    NewDest = 5,
    SetDest = 6,
    DelDest = 7,
    GetDest = 8,
    SetConfig = 12,
    Flush = 17,
}

impl IpvsCommand {
    fn from_u8(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => IpvsCommand::NewService,
            2 => IpvsCommand::SetService,
            3 => IpvsCommand::DelService,
            4 => IpvsCommand::GetService,
            5 => IpvsCommand::NewDest,
            6 => IpvsCommand::SetDest,
            7 => IpvsCommand::DelDest,
            8 => IpvsCommand::GetDest,
            12 => IpvsCommand::SetConfig,
            17 => IpvsCommand::Flush,
            other => {
                return Err(DecodeError::from(format!(
                    "unknown ipvs command: {}",
                    other
                )))
            }
        })
    }
}

const IPVS_CMD_ATTR_SERVICE: u16 = 1;
const IPVS_CMD_ATTR_DEST: u16 = 2;
const IPVS_CMD_ATTR_TIMEOUT_TCP: u16 = 4;
const IPVS_CMD_ATTR_TIMEOUT_TCP_FIN: u16 = 5;
const IPVS_CMD_ATTR_TIMEOUT_UDP: u16 = 6;

#[derive(Debug, Clone, PartialEq)]
enum IpvsCtrlAttr {
    Service(Vec<SvcAttr>),
    Dest(Vec<DestAttr>),
    TimeoutTcp(u32),
    TimeoutTcpFin(u32),
    TimeoutUdp(u32),
    Other(DefaultNla),
}

impl Nla for IpvsCtrlAttr {
    fn value_len(&self) -> usize {
        match self {
            IpvsCtrlAttr::Service(nlas) => nlas.as_slice().buffer_len(),
            IpvsCtrlAttr::Dest(nlas) => nlas.as_slice().buffer_len(),
            IpvsCtrlAttr::TimeoutTcp(_)
            | IpvsCtrlAttr::TimeoutTcpFin(_)
            | IpvsCtrlAttr::TimeoutUdp(_) => 4,
            IpvsCtrlAttr::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            IpvsCtrlAttr::Service(_) => IPVS_CMD_ATTR_SERVICE,
            IpvsCtrlAttr::Dest(_) => IPVS_CMD_ATTR_DEST,
            IpvsCtrlAttr::TimeoutTcp(_) => IPVS_CMD_ATTR_TIMEOUT_TCP,
            IpvsCtrlAttr::TimeoutTcpFin(_) => IPVS_CMD_ATTR_TIMEOUT_TCP_FIN,
            IpvsCtrlAttr::TimeoutUdp(_) => IPVS_CMD_ATTR_TIMEOUT_UDP,
            IpvsCtrlAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            IpvsCtrlAttr::Service(nlas) => nlas.as_slice().emit(buffer),
            IpvsCtrlAttr::Dest(nlas) => nlas.as_slice().emit(buffer),
            IpvsCtrlAttr::TimeoutTcp(v)
            | IpvsCtrlAttr::TimeoutTcpFin(v)
            | IpvsCtrlAttr::TimeoutUdp(v) => buffer[..4].copy_from_slice(&v.to_ne_bytes()),
            IpvsCtrlAttr::Other(nla) => nla.emit_value(buffer),
        }
    }

    fn is_nested(&self) -> bool {
        matches!(self, IpvsCtrlAttr::Service(_) | IpvsCtrlAttr::Dest(_))
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for IpvsCtrlAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_CMD_ATTR_SERVICE => {
                let mut nlas = Vec::new();
                for nla in NlasIterator::new(payload) {
                    nlas.push(SvcAttr::parse(&nla?)?);
                }
                IpvsCtrlAttr::Service(nlas)
            }
            IPVS_CMD_ATTR_DEST => {
                let mut nlas = Vec::new();
                for nla in NlasIterator::new(payload) {
                    nlas.push(DestAttr::parse(&nla?)?);
                }
                IpvsCtrlAttr::Dest(nlas)
            }
            IPVS_CMD_ATTR_TIMEOUT_TCP => IpvsCtrlAttr::TimeoutTcp(parse_u32(payload)?),
            IPVS_CMD_ATTR_TIMEOUT_TCP_FIN => IpvsCtrlAttr::TimeoutTcpFin(parse_u32(payload)?),
            IPVS_CMD_ATTR_TIMEOUT_UDP => IpvsCtrlAttr::TimeoutUdp(parse_u32(payload)?),
            _ => IpvsCtrlAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

const IPVS_SVC_ATTR_AF: u16 = 1;
const IPVS_SVC_ATTR_PROTOCOL: u16 = 2;
const IPVS_SVC_ATTR_ADDR: u16 = 3;
const IPVS_SVC_ATTR_PORT: u16 = 4;
const IPVS_SVC_ATTR_FWMARK: u16 = 5;
const IPVS_SVC_ATTR_SCHED_NAME: u16 = 6;
const IPVS_SVC_ATTR_FLAGS: u16 = 7;
const IPVS_SVC_ATTR_TIMEOUT: u16 = 8;
const IPVS_SVC_ATTR_NETMASK: u16 = 9;

#[derive(Debug, Clone, PartialEq)]
enum SvcAttr {
    AddressFamily(u16),
    Protocol(u16),
    Address(Vec<u8>),
    Port(u16),
    FwMark(u32),
    Scheduler(String),
    Flags { flags: u32, mask: u32 },
    Timeout(u32),
    Netmask(u32),
    Other(DefaultNla),
}

impl Nla for SvcAttr {
    fn value_len(&self) -> usize {
        match self {
            SvcAttr::AddressFamily(_) | SvcAttr::Protocol(_) | SvcAttr::Port(_) => 2,
            SvcAttr::Address(bytes) => bytes.len(),
            SvcAttr::FwMark(_) | SvcAttr::Timeout(_) | SvcAttr::Netmask(_) => 4,
            SvcAttr::Scheduler(s) => s.len() + 1,
            SvcAttr::Flags { .. } => 8,
            SvcAttr::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            SvcAttr::AddressFamily(_) => IPVS_SVC_ATTR_AF,
            SvcAttr::Protocol(_) => IPVS_SVC_ATTR_PROTOCOL,
            SvcAttr::Address(_) => IPVS_SVC_ATTR_ADDR,
            SvcAttr::Port(_) => IPVS_SVC_ATTR_PORT,
            SvcAttr::FwMark(_) => IPVS_SVC_ATTR_FWMARK,
            SvcAttr::Scheduler(_) => IPVS_SVC_ATTR_SCHED_NAME,
            SvcAttr::Flags { .. } => IPVS_SVC_ATTR_FLAGS,
            SvcAttr::Timeout(_) => IPVS_SVC_ATTR_TIMEOUT,
            SvcAttr::Netmask(_) => IPVS_SVC_ATTR_NETMASK,
            SvcAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            SvcAttr::AddressFamily(v) | SvcAttr::Protocol(v) => {
                buffer[..2].copy_from_slice(&v.to_ne_bytes())
            }
            // Ports travel in network byte order.
            SvcAttr::Port(v) => buffer[..2].copy_from_slice(&v.to_be_bytes()),
            SvcAttr::Address(bytes) => buffer[..bytes.len()].copy_from_slice(bytes),
            SvcAttr::FwMark(v) | SvcAttr::Timeout(v) | SvcAttr::Netmask(v) => {
                buffer[..4].copy_from_slice(&v.to_ne_bytes())
            }
            SvcAttr::Scheduler(s) => {
                buffer[..s.len()].copy_from_slice(s.as_bytes());
                buffer[s.len()] = 0;
            }
            SvcAttr::Flags { flags, mask } => {
                buffer[..4].copy_from_slice(&flags.to_ne_bytes());
                buffer[4..8].copy_from_slice(&mask.to_ne_bytes());
            }
            SvcAttr::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for SvcAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_SVC_ATTR_AF => SvcAttr::AddressFamily(parse_u16(payload)?),
            IPVS_SVC_ATTR_PROTOCOL => SvcAttr::Protocol(parse_u16(payload)?),
            IPVS_SVC_ATTR_ADDR => SvcAttr::Address(payload.to_vec()),
            IPVS_SVC_ATTR_PORT => SvcAttr::Port(parse_u16_be(payload)?),
            IPVS_SVC_ATTR_FWMARK => SvcAttr::FwMark(parse_u32(payload)?),
            IPVS_SVC_ATTR_SCHED_NAME => SvcAttr::Scheduler(parse_string(payload)?),
            IPVS_SVC_ATTR_FLAGS => {
                if payload.len() < 8 {
                    return Err(DecodeError::from("ipvs flags attribute too short"));
                }
                SvcAttr::Flags {
                    flags: u32::from_ne_bytes(payload[..4].try_into().unwrap()),
                    mask: u32::from_ne_bytes(payload[4..8].try_into().unwrap()),
                }
            }
            IPVS_SVC_ATTR_TIMEOUT => SvcAttr::Timeout(parse_u32(payload)?),
            IPVS_SVC_ATTR_NETMASK => SvcAttr::Netmask(parse_u32(payload)?),
            _ => SvcAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

const IPVS_DEST_ATTR_ADDR: u16 = 1;
const IPVS_DEST_ATTR_PORT: u16 = 2;
const IPVS_DEST_ATTR_FWD_METHOD: u16 = 3;
const IPVS_DEST_ATTR_WEIGHT: u16 = 4;
const IPVS_DEST_ATTR_U_THRESH: u16 = 5;
const IPVS_DEST_ATTR_L_THRESH: u16 = 6;
const IPVS_DEST_ATTR_ACTIVE_CONNS: u16 = 7;
const IPVS_DEST_ATTR_INACT_CONNS: u16 = 8;
const IPVS_DEST_ATTR_ADDR_FAMILY: u16 = 11;

#[derive(Debug, Clone, PartialEq)]
enum DestAttr {
    Address(Vec<u8>),
    Port(u16),
    FwdMethod(u32),
    Weight(u32),
    UpperThreshold(u32),
    LowerThreshold(u32),
    ActiveConns(u32),
    InactConns(u32),
    AddressFamily(u16),
    Other(DefaultNla),
}

impl Nla for DestAttr {
    fn value_len(&self) -> usize {
        match self {
            DestAttr::Address(bytes) => bytes.len(),
            DestAttr::Port(_) | DestAttr::AddressFamily(_) => 2,
            DestAttr::FwdMethod(_)
            | DestAttr::Weight(_)
            | DestAttr::UpperThreshold(_)
            | DestAttr::LowerThreshold(_)
            | DestAttr::ActiveConns(_)
            | DestAttr::InactConns(_) => 4,
            DestAttr::Other(nla) => nla.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            DestAttr::Address(_) => IPVS_DEST_ATTR_ADDR,
            DestAttr::Port(_) => IPVS_DEST_ATTR_PORT,
            DestAttr::FwdMethod(_) => IPVS_DEST_ATTR_FWD_METHOD,
            DestAttr::Weight(_) => IPVS_DEST_ATTR_WEIGHT,
            DestAttr::UpperThreshold(_) => IPVS_DEST_ATTR_U_THRESH,
            DestAttr::LowerThreshold(_) => IPVS_DEST_ATTR_L_THRESH,
            DestAttr::ActiveConns(_) => IPVS_DEST_ATTR_ACTIVE_CONNS,
            DestAttr::InactConns(_) => IPVS_DEST_ATTR_INACT_CONNS,
            DestAttr::AddressFamily(_) => IPVS_DEST_ATTR_ADDR_FAMILY,
            DestAttr::Other(nla) => nla.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            DestAttr::Address(bytes) => buffer[..bytes.len()].copy_from_slice(bytes),
            DestAttr::Port(v) => buffer[..2].copy_from_slice(&v.to_be_bytes()),
            DestAttr::AddressFamily(v) => buffer[..2].copy_from_slice(&v.to_ne_bytes()),
            DestAttr::FwdMethod(v)
            | DestAttr::Weight(v)
            | DestAttr::UpperThreshold(v)
            | DestAttr::LowerThreshold(v)
            | DestAttr::ActiveConns(v)
            | DestAttr::InactConns(v) => buffer[..4].copy_from_slice(&v.to_ne_bytes()),
            DestAttr::Other(nla) => nla.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for DestAttr {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            IPVS_DEST_ATTR_ADDR => DestAttr::Address(payload.to_vec()),
            IPVS_DEST_ATTR_PORT => DestAttr::Port(parse_u16_be(payload)?),
            IPVS_DEST_ATTR_FWD_METHOD => DestAttr::FwdMethod(parse_u32(payload)?),
            IPVS_DEST_ATTR_WEIGHT => DestAttr::Weight(parse_u32(payload)?),
            IPVS_DEST_ATTR_U_THRESH => DestAttr::UpperThreshold(parse_u32(payload)?),
            IPVS_DEST_ATTR_L_THRESH => DestAttr::LowerThreshold(parse_u32(payload)?),
            IPVS_DEST_ATTR_ACTIVE_CONNS => DestAttr::ActiveConns(parse_u32(payload)?),
            IPVS_DEST_ATTR_INACT_CONNS => DestAttr::InactConns(parse_u32(payload)?),
            IPVS_DEST_ATTR_ADDR_FAMILY => DestAttr::AddressFamily(parse_u16(payload)?),
            _ => DestAttr::Other(DefaultNla::parse(buf)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct IpvsCtrl {
    cmd: IpvsCommand,
    nlas: Vec<IpvsCtrlAttr>,
}

impl GenlFamily for IpvsCtrl {
    fn family_name() -> &'static str {
        "IPVS"
    }

    fn command(&self) -> u8 {
        self.cmd as u8
    }

    fn version(&self) -> u8 {
        1
    }
}

impl Emitable for IpvsCtrl {
    fn buffer_len(&self) -> usize {
        self.nlas.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.nlas.as_slice().emit(buffer)
    }
}

impl ParseableParametrized<[u8], GenlHeader> for IpvsCtrl {
    fn parse_with_param(buf: &[u8], header: GenlHeader) -> Result<Self, DecodeError> {
        let mut nlas = Vec::new();
        for nla in NlasIterator::new(buf) {
            nlas.push(IpvsCtrlAttr::parse(&nla?)?);
        }
        Ok(Self {
            cmd: IpvsCommand::from_u8(header.cmd)?,
            nlas,
        })
    }
}

// ── Backend trait and the real handle ─────────────────────────────────

/// The IPVS surface the proxy reconciler programs against. Implemented by
/// the genetlink handle in production and by a recording fake in tests.
#[async_trait]
pub trait IpvsBackend: Send + Sync {
    async fn get_services(&mut self) -> KernelResult<Vec<VirtualServer>>;
    async fn get_destinations(&mut self, vs: &VirtualServer) -> KernelResult<Vec<RealServer>>;
    async fn new_service(&mut self, vs: &VirtualServer) -> KernelResult<()>;
    async fn update_service(&mut self, vs: &VirtualServer) -> KernelResult<()>;
    async fn del_service(&mut self, vs: &VirtualServer) -> KernelResult<()>;
    async fn new_destination(&mut self, vs: &VirtualServer, rs: &RealServer) -> KernelResult<()>;
    async fn update_destination(&mut self, vs: &VirtualServer, rs: &RealServer)
        -> KernelResult<()>;
    async fn del_destination(&mut self, vs: &VirtualServer, rs: &RealServer) -> KernelResult<()>;
    async fn set_timeouts(
        &mut self,
        tcp: Duration,
        tcp_fin: Duration,
        udp: Duration,
    ) -> KernelResult<()>;
    async fn flush(&mut self) -> KernelResult<()>;
}

/// Handle to the kernel's IPVS generic-netlink family. One per process,
/// used exclusively from the proxy reconciler.
pub struct IpvsHandle {
    handle: GenetlinkHandle,
    _conn_task: tokio::task::JoinHandle<()>,
}

impl IpvsHandle {
    pub fn new() -> KernelResult<Self> {
        let (conn, handle, _) = genetlink::new_connection()
            .map_err(|e| KernelError::Genetlink(format!("connection failed: {}", e)))?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    async fn request_ack(&mut self, cmd: IpvsCommand, nlas: Vec<IpvsCtrlAttr>) -> KernelResult<()> {
        let mut msg = NetlinkMessage::from(GenlMessage::from_payload(IpvsCtrl { cmd, nlas }));
        msg.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        let mut responses = self
            .handle
            .request(msg)
            .await
            .map_err(|e| KernelError::Genetlink(e.to_string()))?;

        while let Some(result) = responses.next().await {
            let response = result.map_err(|e| KernelError::Genetlink(e.to_string()))?;
            match response.payload {
                NetlinkPayload::Error(err) if err.code != 0 => {
                    return Err(map_ipvs_errno(-err.code));
                }
                NetlinkPayload::Error(_) | NetlinkPayload::Ack(_) | NetlinkPayload::Done => {
                    return Ok(())
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn request_dump(
        &mut self,
        cmd: IpvsCommand,
        nlas: Vec<IpvsCtrlAttr>,
    ) -> KernelResult<Vec<IpvsCtrl>> {
        let mut msg = NetlinkMessage::from(GenlMessage::from_payload(IpvsCtrl { cmd, nlas }));
        msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut responses = self
            .handle
            .request(msg)
            .await
            .map_err(|e| KernelError::Genetlink(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(result) = responses.next().await {
            let response = result.map_err(|e| KernelError::Genetlink(e.to_string()))?;
            match response.payload {
                NetlinkPayload::InnerMessage(genl) => out.push(genl.payload),
                NetlinkPayload::Error(err) if err.code != 0 => {
                    return Err(map_ipvs_errno(-err.code));
                }
                NetlinkPayload::Done => break,
                _ => {}
            }
        }
        Ok(out)
    }
}

fn map_ipvs_errno(errno: i32) -> KernelError {
    if errno == nix::libc::EEXIST {
        KernelError::IpvsServerExists
    } else if errno == nix::libc::ENOENT || errno == nix::libc::ESRCH {
        KernelError::IpvsEntryNotFound
    } else {
        KernelError::Genetlink(format!(
            "ipvs request failed: {}",
            std::io::Error::from_raw_os_error(errno)
        ))
    }
}

#[async_trait]
impl IpvsBackend for IpvsHandle {
    async fn get_services(&mut self) -> KernelResult<Vec<VirtualServer>> {
        let replies = self.request_dump(IpvsCommand::GetService, Vec::new()).await?;
        let mut services = Vec::new();
        for reply in replies {
            for nla in &reply.nlas {
                if let IpvsCtrlAttr::Service(attrs) = nla {
                    services.push(VirtualServer::from_attrs(attrs)?);
                }
            }
        }
        Ok(services)
    }

    async fn get_destinations(&mut self, vs: &VirtualServer) -> KernelResult<Vec<RealServer>> {
        let replies = self
            .request_dump(
                IpvsCommand::GetDest,
                vec![IpvsCtrlAttr::Service(vs.identity_attrs())],
            )
            .await?;
        let mut dests = Vec::new();
        for reply in replies {
            for nla in &reply.nlas {
                if let IpvsCtrlAttr::Dest(attrs) = nla {
                    dests.push(RealServer::from_attrs(attrs, vs.family)?);
                }
            }
        }
        Ok(dests)
    }

    async fn new_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
        self.request_ack(
            IpvsCommand::NewService,
            vec![IpvsCtrlAttr::Service(vs.full_attrs())],
        )
        .await
    }

    async fn update_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
        self.request_ack(
            IpvsCommand::SetService,
            vec![IpvsCtrlAttr::Service(vs.full_attrs())],
        )
        .await
    }

    async fn del_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
        match self
            .request_ack(
                IpvsCommand::DelService,
                vec![IpvsCtrlAttr::Service(vs.identity_attrs())],
            )
            .await
        {
            // Already gone; converged.
            Ok(()) | Err(KernelError::IpvsEntryNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn new_destination(&mut self, vs: &VirtualServer, rs: &RealServer) -> KernelResult<()> {
        self.request_ack(
            IpvsCommand::NewDest,
            vec![
                IpvsCtrlAttr::Service(vs.identity_attrs()),
                IpvsCtrlAttr::Dest(rs.to_attrs()),
            ],
        )
        .await
    }

    async fn update_destination(
        &mut self,
        vs: &VirtualServer,
        rs: &RealServer,
    ) -> KernelResult<()> {
        self.request_ack(
            IpvsCommand::SetDest,
            vec![
                IpvsCtrlAttr::Service(vs.identity_attrs()),
                IpvsCtrlAttr::Dest(rs.to_attrs()),
            ],
        )
        .await
    }

    async fn del_destination(&mut self, vs: &VirtualServer, rs: &RealServer) -> KernelResult<()> {
        match self
            .request_ack(
                IpvsCommand::DelDest,
                vec![
                    IpvsCtrlAttr::Service(vs.identity_attrs()),
                    IpvsCtrlAttr::Dest(vec![
                        DestAttr::Address(ip_bytes(rs.address)),
                        DestAttr::Port(rs.port),
                    ]),
                ],
            )
            .await
        {
            Ok(()) | Err(KernelError::IpvsEntryNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_timeouts(
        &mut self,
        tcp: Duration,
        tcp_fin: Duration,
        udp: Duration,
    ) -> KernelResult<()> {
        // 0 keeps the kernel default for that protocol.
        self.request_ack(
            IpvsCommand::SetConfig,
            vec![
                IpvsCtrlAttr::TimeoutTcp(tcp.as_secs() as u32),
                IpvsCtrlAttr::TimeoutTcpFin(tcp_fin.as_secs() as u32),
                IpvsCtrlAttr::TimeoutUdp(udp.as_secs() as u32),
            ],
        )
        .await
    }

    async fn flush(&mut self) -> KernelResult<()> {
        self.request_ack(IpvsCommand::Flush, Vec::new()).await
    }
}
