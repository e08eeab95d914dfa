// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN attributes as TLVs within a [`Message`](crate::stun::message::Message).
//!
//! Typed attributes convert to and from [`RawAttribute`] through the
//! [`Attribute`] trait.  Unknown attribute types stay as `RawAttribute`s.

use std::convert::TryFrom;
use std::convert::TryInto;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::agent::AgentError;
use crate::stun::message::MAGIC_COOKIE;

use byteorder::{BigEndian, ByteOrder};

// 0x0000 is reserved
pub const MAPPED_ADDRESS: AttributeType = AttributeType(0x0001);
// 0x0002..0x0005 are reserved from classic STUN
pub const USERNAME: AttributeType = AttributeType(0x0006);
// 0x0007 is reserved, was PASSWORD
pub const MESSAGE_INTEGRITY: AttributeType = AttributeType(0x0008);
pub const ERROR_CODE: AttributeType = AttributeType(0x0009);
pub const UNKNOWN_ATTRIBUTES: AttributeType = AttributeType(0x000A);
// RFC 5766 (TURN)
pub const LIFETIME: AttributeType = AttributeType(0x000D);
pub const XOR_RELAYED_ADDRESS: AttributeType = AttributeType(0x0016);
pub const REQUESTED_TRANSPORT: AttributeType = AttributeType(0x0019);
pub const REALM: AttributeType = AttributeType(0x0014);
pub const NONCE: AttributeType = AttributeType(0x0015);
pub const XOR_MAPPED_ADDRESS: AttributeType = AttributeType(0x0020);

pub const SOFTWARE: AttributeType = AttributeType(0x8022);
pub const ALTERNATE_SERVER: AttributeType = AttributeType(0x8023);
pub const FINGERPRINT: AttributeType = AttributeType(0x8028);

// RFC 8445
pub const PRIORITY: AttributeType = AttributeType(0x0024);
pub const USE_CANDIDATE: AttributeType = AttributeType(0x0025);

pub const ICE_CONTROLLED: AttributeType = AttributeType(0x0029);
pub const ICE_CONTROLLING: AttributeType = AttributeType(0x002A);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AttributeType(u16);

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#x}: {})", self.0, self.0, self.name())
    }
}

impl AttributeType {
    pub fn new(val: u16) -> Self {
        Self(val)
    }

    pub fn name(self) -> &'static str {
        match self {
            MAPPED_ADDRESS => "MAPPED-ADDRESS",
            USERNAME => "USERNAME",
            MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ERROR_CODE => "ERROR-CODE",
            UNKNOWN_ATTRIBUTES => "UNKNOWN-ATTRIBUTES",
            LIFETIME => "LIFETIME",
            XOR_RELAYED_ADDRESS => "XOR-RELAYED-ADDRESS",
            REQUESTED_TRANSPORT => "REQUESTED-TRANSPORT",
            REALM => "REALM",
            NONCE => "NONCE",
            XOR_MAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            SOFTWARE => "SOFTWARE",
            ALTERNATE_SERVER => "ALTERNATE-SERVER",
            FINGERPRINT => "FINGERPRINT",
            PRIORITY => "PRIORITY",
            USE_CANDIDATE => "USE-CANDIDATE",
            ICE_CONTROLLED => "ICE-CONTROLLED",
            ICE_CONTROLLING => "ICE-CONTROLLING",
            _ => "unknown",
        }
    }

    /// Check if comprehension is required for an `AttributeType`.  All
    /// integer attribute values < 0x8000 require comprehension.
    ///
    /// # Examples
    ///
    /// ```
    /// # use icelink::stun::attribute::AttributeType;
    /// assert_eq!(AttributeType::new(0x0).comprehension_required(), true);
    /// assert_eq!(AttributeType::new(0x8000).comprehension_required(), false);
    /// ```
    pub fn comprehension_required(self) -> bool {
        self.0 < 0x8000
    }
}
impl From<u16> for AttributeType {
    fn from(f: u16) -> Self {
        Self::new(f)
    }
}
impl From<AttributeType> for u16 {
    fn from(f: AttributeType) -> Self {
        f.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttributeHeader {
    pub atype: AttributeType,
    pub length: u16,
}

impl AttributeHeader {
    fn parse(data: &[u8]) -> Result<Self, AgentError> {
        if data.len() < 4 {
            return Err(AgentError::NotEnoughData);
        }
        Ok(Self {
            atype: BigEndian::read_u16(&data[0..2]).into(),
            length: BigEndian::read_u16(&data[2..4]),
        })
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut ret = vec![0; 4];
        BigEndian::write_u16(&mut ret[0..2], self.atype.into());
        BigEndian::write_u16(&mut ret[2..4], self.length);
        ret
    }
}
impl From<AttributeHeader> for Vec<u8> {
    fn from(f: AttributeHeader) -> Self {
        f.to_bytes()
    }
}
impl TryFrom<&[u8]> for AttributeHeader {
    type Error = AgentError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        AttributeHeader::parse(value)
    }
}

pub trait Attribute: std::fmt::Debug + std::any::Any {
    /// Retrieve the `AttributeType` of an `Attribute`
    fn get_type(&self) -> AttributeType;

    /// Retrieve the length of an `Attribute`.  This is not the padded
    /// length as stored in a `Message`
    fn get_length(&self) -> u16;

    /// Helper to cast to an std::any::Any
    fn as_any(&self) -> &dyn std::any::Any
    where
        Self: Sized,
    {
        self
    }

    /// Convert an `Attribute` to a `RawAttribute`
    fn to_raw(&self) -> RawAttribute;

    /// Convert an `Attribute` from a `RawAttribute`
    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub header: AttributeHeader,
    pub value: Vec<u8>,
}

macro_rules! display_attr {
    ($this:ident, $CamelType:ty, $default:ident) => {{
        if let Ok(attr) = <$CamelType>::from_raw($this) {
            format!("{}", attr)
        } else {
            $default
        }
    }};
}

impl std::fmt::Display for RawAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // try to get a more specialised display
        let malformed_str = format!(
            "{}(Malformed): len: {}, data: {:?})",
            self.get_type(),
            self.header.length,
            self.value
        );
        let display_str = match self.get_type() {
            SOFTWARE => display_attr!(self, Software, malformed_str),
            UNKNOWN_ATTRIBUTES => display_attr!(self, UnknownAttributes, malformed_str),
            ERROR_CODE => display_attr!(self, ErrorCode, malformed_str),
            USERNAME => display_attr!(self, Username, malformed_str),
            REALM => display_attr!(self, Realm, malformed_str),
            NONCE => display_attr!(self, Nonce, malformed_str),
            XOR_MAPPED_ADDRESS => display_attr!(self, XorMappedAddress, malformed_str),
            XOR_RELAYED_ADDRESS => display_attr!(self, XorRelayedAddress, malformed_str),
            REQUESTED_TRANSPORT => display_attr!(self, RequestedTransport, malformed_str),
            LIFETIME => display_attr!(self, Lifetime, malformed_str),
            PRIORITY => display_attr!(self, Priority, malformed_str),
            USE_CANDIDATE => display_attr!(self, UseCandidate, malformed_str),
            ICE_CONTROLLED => display_attr!(self, IceControlled, malformed_str),
            ICE_CONTROLLING => display_attr!(self, IceControlling, malformed_str),
            MESSAGE_INTEGRITY => display_attr!(self, MessageIntegrity, malformed_str),
            FINGERPRINT => display_attr!(self, Fingerprint, malformed_str),
            _ => format!(
                "RawAttribute (type: {:?}, len: {}, data: {:?})",
                self.header.atype, self.header.length, &self.value
            ),
        };
        write!(f, "{}", display_str)
    }
}

impl Attribute for RawAttribute {
    fn get_length(&self) -> u16 {
        self.header.length
    }

    fn get_type(&self) -> AttributeType {
        self.header.atype
    }

    fn to_raw(&self) -> RawAttribute {
        self.clone()
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        Ok(raw.clone())
    }
}

impl RawAttribute {
    pub fn new(atype: AttributeType, data: &[u8]) -> Self {
        Self {
            header: AttributeHeader {
                atype,
                length: data.len() as u16,
            },
            value: data.to_vec(),
        }
    }

    /// Deserialize a `RawAttribute` from bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// # use icelink::stun::attribute::{RawAttribute, Attribute, AttributeType};
    /// let data = &[0, 1, 0, 2, 5, 6, 0, 0];
    /// let attr = RawAttribute::from_bytes(data).unwrap();
    /// assert_eq!(attr.get_type(), AttributeType::new(1));
    /// assert_eq!(attr.get_length(), 2);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self, AgentError> {
        let header = AttributeHeader::parse(data)?;
        // the advertised length is larger than actual data -> error
        if header.length > (data.len() - 4) as u16 {
            return Err(AgentError::InvalidSize);
        }
        let mut data = data[4..].to_vec();
        data.truncate(header.length as usize);
        Ok(Self {
            header,
            value: data,
        })
    }

    /// Serialize a `RawAttribute` to bytes, padded to a 4-byte boundary.
    ///
    /// # Examples
    ///
    /// ```
    /// # use icelink::stun::attribute::{RawAttribute, Attribute, AttributeType};
    /// let attr = RawAttribute::new(AttributeType::new(1), &[5, 6]);
    /// assert_eq!(attr.to_bytes(), &[0, 1, 0, 2, 5, 6, 0, 0]);
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret: Vec<u8> = self.header.into();
        ret.extend(&self.value);
        let len = ret.len();
        if len % 4 != 0 {
            ret.resize(len + 4 - (len % 4), 0);
        }
        ret
    }
}
impl From<RawAttribute> for Vec<u8> {
    fn from(f: RawAttribute) -> Self {
        f.to_bytes()
    }
}

impl TryFrom<&[u8]> for RawAttribute {
    type Error = AgentError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        RawAttribute::from_bytes(value)
    }
}

macro_rules! attr_conversions {
    ($CamelType:ty) => {
        impl TryFrom<&RawAttribute> for $CamelType {
            type Error = AgentError;

            fn try_from(value: &RawAttribute) -> Result<Self, Self::Error> {
                <$CamelType>::from_raw(value)
            }
        }

        impl From<$CamelType> for RawAttribute {
            fn from(f: $CamelType) -> Self {
                f.to_raw()
            }
        }
    };
}

macro_rules! string_attr {
    ($CamelType:ident, $atype:ident, $max:literal) => {
        #[derive(Debug, Clone)]
        pub struct $CamelType {
            value: String,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn get_length(&self) -> u16 {
                self.value.len() as u16
            }

            fn to_raw(&self) -> RawAttribute {
                RawAttribute::new(self.get_type(), self.value.as_bytes())
            }

            fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
                if raw.header.atype != $atype {
                    return Err(AgentError::WrongImplementation);
                }
                if raw.value.len() > $max {
                    return Err(AgentError::TooBig);
                }
                Ok(Self {
                    value: std::str::from_utf8(&raw.value)
                        .map_err(|_| AgentError::Malformed)?
                        .to_owned(),
                })
            }
        }

        impl $CamelType {
            pub fn new(value: &str) -> Result<Self, AgentError> {
                if value.len() > $max {
                    return Err(AgentError::InvalidSize);
                }
                // TODO: SASLPrep RFC4013 requirements
                Ok(Self {
                    value: value.to_owned(),
                })
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: '{}'", self.get_type(), self.value)
            }
        }

        attr_conversions!($CamelType);
    };
}

string_attr!(Username, USERNAME, 513);
string_attr!(Software, SOFTWARE, 763);
string_attr!(Realm, REALM, 763);
string_attr!(Nonce, NONCE, 763);

impl Username {
    pub fn username(&self) -> &str {
        &self.value
    }
}
impl Software {
    pub fn software(&self) -> &str {
        &self.value
    }
}
impl Realm {
    pub fn realm(&self) -> &str {
        &self.value
    }
}
impl Nonce {
    pub fn nonce(&self) -> &str {
        &self.value
    }
}

#[derive(Debug, Clone)]
pub struct ErrorCode {
    code: u16,
    reason: String,
}
impl Attribute for ErrorCode {
    fn get_type(&self) -> AttributeType {
        ERROR_CODE
    }

    fn get_length(&self) -> u16 {
        self.reason.len() as u16 + 4
    }

    fn to_raw(&self) -> RawAttribute {
        let mut data = Vec::with_capacity(self.get_length() as usize);
        data.push(0u8);
        data.push(0u8);
        data.push((self.code / 100) as u8);
        data.push((self.code % 100) as u8);
        data.extend(self.reason.as_bytes());
        RawAttribute::new(self.get_type(), &data)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        if raw.header.atype != ERROR_CODE {
            return Err(AgentError::WrongImplementation);
        }
        if raw.value.len() < 4 {
            return Err(AgentError::NotEnoughData);
        }
        if raw.value.len() > 763 + 4 {
            return Err(AgentError::TooBig);
        }
        let code_h = (raw.value[2] & 0x7) as u16;
        let code_tens = raw.value[3] as u16;
        if !(3..7).contains(&code_h) || code_tens > 99 {
            return Err(AgentError::Malformed);
        }
        let code = code_h * 100 + code_tens;
        Ok(Self {
            code,
            reason: std::str::from_utf8(&raw.value[4..])
                .map_err(|_| AgentError::Malformed)?
                .to_owned(),
        })
    }
}
impl ErrorCode {
    pub fn new(code: u16, reason: &str) -> Result<Self, AgentError> {
        if !(300..700).contains(&code) {
            return Err(AgentError::Malformed);
        }
        Ok(Self {
            code,
            reason: reason.to_owned(),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn default_reason_for_code(code: u16) -> &'static str {
        match code {
            301 => "Try Alternate",
            400 => "Bad Request",
            401 => "Unauthorized",
            420 => "Unknown Attribute",
            438 => "Stale Nonce",
            441 => "Wrong Credentials",
            442 => "Unsupported Transport Protocol",
            486 => "Allocation Quota Reached",
            500 => "Server Error",
            // RFC 8445
            ROLE_CONFLICT => "Role Conflict",
            _ => "Unknown",
        }
    }
}

pub const ROLE_CONFLICT: u16 = 487;

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} '{}'", self.get_type(), self.code, self.reason)
    }
}
attr_conversions!(ErrorCode);

#[derive(Debug, Clone)]
pub struct UnknownAttributes {
    attributes: Vec<AttributeType>,
}
impl Attribute for UnknownAttributes {
    fn get_type(&self) -> AttributeType {
        UNKNOWN_ATTRIBUTES
    }

    fn get_length(&self) -> u16 {
        (self.attributes.len() as u16) * 2
    }

    fn to_raw(&self) -> RawAttribute {
        let mut data = Vec::with_capacity(self.get_length() as usize);
        for attr in &self.attributes {
            let mut encoded = vec![0; 2];
            BigEndian::write_u16(&mut encoded, (*attr).into());
            data.extend(encoded);
        }
        RawAttribute::new(self.get_type(), &data)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        if raw.header.atype != UNKNOWN_ATTRIBUTES {
            return Err(AgentError::WrongImplementation);
        }
        if raw.value.len() % 2 != 0 {
            /* all attributes are 16-bits */
            return Err(AgentError::Malformed);
        }
        let mut attrs = vec![];
        for attr in raw.value.chunks_exact(2) {
            attrs.push(BigEndian::read_u16(attr).into());
        }
        Ok(Self { attributes: attrs })
    }
}
impl UnknownAttributes {
    pub fn new(attrs: &[AttributeType]) -> Self {
        Self {
            attributes: attrs.to_vec(),
        }
    }

    pub fn add_attribute(&mut self, attr: AttributeType) {
        if !self.has_attribute(attr) {
            self.attributes.push(attr);
        }
    }

    pub fn has_attribute(&self, attr: AttributeType) -> bool {
        self.attributes.iter().any(|&a| a == attr)
    }
}

impl std::fmt::Display for UnknownAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.get_type(), self.attributes)
    }
}
attr_conversions!(UnknownAttributes);

macro_rules! bytewise_xor {
    ($size:literal, $a:expr, $b:expr, $default:literal) => {{
        let mut arr = [$default; $size];
        for (i, item) in arr.iter_mut().enumerate() {
            *item = $a[i] ^ $b[i];
        }
        arr
    }};
}

// XOR-encoded socket address encoding shared by XOR-MAPPED-ADDRESS and
// XOR-RELAYED-ADDRESS.  The address is stored XOR-ed as the transaction
// id is needed to recover the original value.
fn xor_addr(addr: SocketAddr, transaction: u128) -> SocketAddr {
    match addr {
        SocketAddr::V4(addr) => {
            let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
            let const_octets = MAGIC_COOKIE.to_be_bytes();
            let addr_octets = addr.ip().octets();
            let octets = bytewise_xor!(4, const_octets, addr_octets, 0);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        SocketAddr::V6(addr) => {
            let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
            let const_octets = ((MAGIC_COOKIE as u128) << 96
                | (transaction & 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff))
                .to_be_bytes();
            let addr_octets = addr.ip().octets();
            let octets = bytewise_xor!(16, const_octets, addr_octets, 0);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
    }
}

fn xor_addr_to_raw(atype: AttributeType, addr: SocketAddr) -> RawAttribute {
    match addr {
        SocketAddr::V4(addr) => {
            let mut buf = [0; 8];
            buf[1] = 0x1;
            BigEndian::write_u16(&mut buf[2..4], addr.port());
            BigEndian::write_u32(&mut buf[4..8], u32::from(*addr.ip()));
            RawAttribute::new(atype, &buf)
        }
        SocketAddr::V6(addr) => {
            let mut buf = [0; 20];
            buf[1] = 0x2;
            BigEndian::write_u16(&mut buf[2..4], addr.port());
            BigEndian::write_u128(&mut buf[4..20], u128::from(*addr.ip()));
            RawAttribute::new(atype, &buf)
        }
    }
}

fn xor_addr_from_raw(value: &[u8]) -> Result<SocketAddr, AgentError> {
    if value.len() < 4 {
        return Err(AgentError::NotEnoughData);
    }
    let port = BigEndian::read_u16(&value[2..4]);
    let addr = match value[1] {
        0x1 => {
            // ipv4
            match value.len() {
                n if n < 8 => return Err(AgentError::NotEnoughData),
                8 => (),
                _ => return Err(AgentError::TooBig),
            }
            IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(&value[4..8])))
        }
        0x2 => {
            // ipv6
            match value.len() {
                n if n < 20 => return Err(AgentError::NotEnoughData),
                20 => (),
                _ => return Err(AgentError::TooBig),
            }
            let mut octets = [0; 16];
            octets.clone_from_slice(&value[4..]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(AgentError::Malformed),
    };
    Ok(SocketAddr::new(addr, port))
}

macro_rules! xor_addr_attr {
    ($CamelType:ident, $atype:ident) => {
        #[derive(Debug, Clone)]
        pub struct $CamelType {
            addr: SocketAddr,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn get_length(&self) -> u16 {
                match self.addr {
                    SocketAddr::V4(_) => 8,
                    SocketAddr::V6(_) => 20,
                }
            }

            fn to_raw(&self) -> RawAttribute {
                xor_addr_to_raw(self.get_type(), self.addr)
            }

            fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
                if raw.header.atype != $atype {
                    return Err(AgentError::WrongImplementation);
                }
                Ok(Self {
                    addr: xor_addr_from_raw(&raw.value)?,
                })
            }
        }

        impl $CamelType {
            pub fn new(addr: SocketAddr, transaction: u128) -> Result<Self, AgentError> {
                Ok(Self {
                    addr: xor_addr(addr, transaction),
                })
            }

            pub fn addr(&self, transaction: u128) -> SocketAddr {
                xor_addr(self.addr, transaction)
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self.addr {
                    SocketAddr::V4(_) => write!(f, "{}: {:?}", self.get_type(), self.addr(0x0)),
                    SocketAddr::V6(addr) => write!(f, "{}: XOR({:?})", self.get_type(), addr),
                }
            }
        }

        attr_conversions!($CamelType);
    };
}

xor_addr_attr!(XorMappedAddress, XOR_MAPPED_ADDRESS);
xor_addr_attr!(XorRelayedAddress, XOR_RELAYED_ADDRESS);

macro_rules! u32_attr {
    ($CamelType:ident, $atype:ident, $field:ident) => {
        #[derive(Debug)]
        pub struct $CamelType {
            $field: u32,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn get_length(&self) -> u16 {
                4
            }

            fn to_raw(&self) -> RawAttribute {
                let mut buf = [0; 4];
                BigEndian::write_u32(&mut buf[0..4], self.$field);
                RawAttribute::new(self.get_type(), &buf)
            }

            fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
                if raw.header.atype != $atype {
                    return Err(AgentError::WrongImplementation);
                }
                match raw.value.len() {
                    n if n < 4 => return Err(AgentError::NotEnoughData),
                    4 => (),
                    _ => return Err(AgentError::TooBig),
                }
                Ok(Self {
                    $field: BigEndian::read_u32(&raw.value[..4]),
                })
            }
        }

        impl $CamelType {
            pub fn new($field: u32) -> Self {
                Self { $field }
            }

            pub fn $field(&self) -> u32 {
                self.$field
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: {}", self.get_type(), self.$field)
            }
        }

        attr_conversions!($CamelType);
    };
}

u32_attr!(Priority, PRIORITY, priority);
u32_attr!(Lifetime, LIFETIME, lifetime);

macro_rules! tie_breaker_attr {
    ($CamelType:ident, $atype:ident) => {
        #[derive(Debug)]
        pub struct $CamelType {
            tie_breaker: u64,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn get_length(&self) -> u16 {
                8
            }

            fn to_raw(&self) -> RawAttribute {
                let mut buf = [0; 8];
                BigEndian::write_u64(&mut buf[..8], self.tie_breaker);
                RawAttribute::new(self.get_type(), &buf)
            }

            fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
                if raw.header.atype != $atype {
                    return Err(AgentError::WrongImplementation);
                }
                match raw.value.len() {
                    n if n < 8 => return Err(AgentError::NotEnoughData),
                    8 => (),
                    _ => return Err(AgentError::TooBig),
                }
                Ok(Self {
                    tie_breaker: BigEndian::read_u64(&raw.value),
                })
            }
        }

        impl $CamelType {
            pub fn new(tie_breaker: u64) -> Self {
                Self { tie_breaker }
            }

            pub fn tie_breaker(&self) -> u64 {
                self.tie_breaker
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: {}", self.get_type(), self.tie_breaker)
            }
        }

        attr_conversions!($CamelType);
    };
}

tie_breaker_attr!(IceControlled, ICE_CONTROLLED);
tie_breaker_attr!(IceControlling, ICE_CONTROLLING);

#[derive(Debug, Default)]
pub struct UseCandidate {}

impl Attribute for UseCandidate {
    fn get_type(&self) -> AttributeType {
        USE_CANDIDATE
    }

    fn get_length(&self) -> u16 {
        0
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(self.get_type(), &[])
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        if raw.header.atype != USE_CANDIDATE {
            return Err(AgentError::WrongImplementation);
        }
        if !raw.value.is_empty() {
            return Err(AgentError::TooBig);
        }
        Ok(Self {})
    }
}

impl UseCandidate {
    pub fn new() -> Self {
        Self {}
    }
}

impl std::fmt::Display for UseCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_type())
    }
}
attr_conversions!(UseCandidate);

/// REQUESTED-TRANSPORT for TURN Allocate requests, RFC 5766 Section 14.7.
#[derive(Debug)]
pub struct RequestedTransport {
    protocol: u8,
}

impl Attribute for RequestedTransport {
    fn get_type(&self) -> AttributeType {
        REQUESTED_TRANSPORT
    }

    fn get_length(&self) -> u16 {
        4
    }

    fn to_raw(&self) -> RawAttribute {
        let mut buf = [0; 4];
        buf[0] = self.protocol;
        RawAttribute::new(self.get_type(), &buf)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        if raw.header.atype != REQUESTED_TRANSPORT {
            return Err(AgentError::WrongImplementation);
        }
        match raw.value.len() {
            n if n < 4 => return Err(AgentError::NotEnoughData),
            4 => (),
            _ => return Err(AgentError::TooBig),
        }
        Ok(Self {
            protocol: raw.value[0],
        })
    }
}

impl RequestedTransport {
    pub const UDP: u8 = 17;

    pub fn new(protocol: u8) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }
}

impl std::fmt::Display for RequestedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.protocol)
    }
}
attr_conversions!(RequestedTransport);

#[derive(Debug)]
pub struct MessageIntegrity {
    hmac: [u8; 20],
}

impl Attribute for MessageIntegrity {
    fn get_type(&self) -> AttributeType {
        MESSAGE_INTEGRITY
    }

    fn get_length(&self) -> u16 {
        20
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(self.get_type(), &self.hmac)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        if raw.header.atype != MESSAGE_INTEGRITY {
            return Err(AgentError::WrongImplementation);
        }
        match raw.value.len() {
            n if n < 20 => return Err(AgentError::NotEnoughData),
            20 => (),
            _ => return Err(AgentError::TooBig),
        }
        // size checked above
        let boxed: Box<[u8; 20]> = raw.value.clone().into_boxed_slice().try_into().unwrap();
        Ok(Self { hmac: *boxed })
    }
}

impl MessageIntegrity {
    pub fn new(hmac: [u8; 20]) -> Self {
        Self { hmac }
    }

    pub fn hmac(&self) -> &[u8; 20] {
        &self.hmac
    }
}

impl std::fmt::Display for MessageIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: 0x", self.get_type())?;
        for val in self.hmac.iter() {
            write!(f, "{:02x}", val)?;
        }
        Ok(())
    }
}
attr_conversions!(MessageIntegrity);

#[derive(Debug, Clone)]
pub struct Fingerprint {
    fingerprint: [u8; 4],
}

impl Attribute for Fingerprint {
    fn get_type(&self) -> AttributeType {
        FINGERPRINT
    }

    fn get_length(&self) -> u16 {
        4
    }

    fn to_raw(&self) -> RawAttribute {
        let buf = bytewise_xor!(4, self.fingerprint, Fingerprint::XOR_CONSTANT, 0);
        RawAttribute::new(self.get_type(), &buf)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, AgentError> {
        if raw.header.atype != FINGERPRINT {
            return Err(AgentError::WrongImplementation);
        }
        match raw.value.len() {
            n if n < 4 => return Err(AgentError::NotEnoughData),
            4 => (),
            _ => return Err(AgentError::TooBig),
        }
        // size checked above
        let boxed: Box<[u8; 4]> = raw.value.clone().into_boxed_slice().try_into().unwrap();
        let fingerprint = bytewise_xor!(4, *boxed, Fingerprint::XOR_CONSTANT, 0);
        Ok(Self { fingerprint })
    }
}

impl Fingerprint {
    // RFC 5389 Section 15.5, "STUN" in ascii
    pub const XOR_CONSTANT: [u8; 4] = [0x53, 0x54, 0x55, 0x4E];

    pub fn new(fingerprint: [u8; 4]) -> Self {
        Self { fingerprint }
    }

    pub fn fingerprint(&self) -> &[u8; 4] {
        &self.fingerprint
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: 0x", self.get_type())?;
        for val in self.fingerprint.iter() {
            write!(f, "{:02x}", val)?;
        }
        Ok(())
    }
}
attr_conversions!(Fingerprint);

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn raw_attribute_construct() {
        init();
        let a = RawAttribute::new(1.into(), &[80, 160]);
        assert_eq!(a.get_type(), 1.into());
        let bytes = a.to_bytes();
        assert_eq!(bytes, &[0, 1, 0, 2, 80, 160, 0, 0]);
        let b = RawAttribute::from_bytes(&bytes).unwrap();
        assert_eq!(b.get_type(), 1.into());
    }

    #[test]
    fn raw_attribute_invalid_length() {
        init();
        // advertised length longer than the data
        let res = RawAttribute::from_bytes(&[0, 1, 0, 6, 80, 160]);
        assert!(matches!(res, Err(AgentError::InvalidSize)));
    }

    #[test]
    fn username() {
        init();
        let s = "woohoo!";
        let user = Username::new(s).unwrap();
        assert_eq!(user.get_type(), USERNAME);
        assert_eq!(user.username(), s);
        let raw: RawAttribute = user.into();
        let user2 = Username::try_from(&raw).unwrap();
        assert_eq!(user2.get_type(), USERNAME);
        assert_eq!(user2.username(), s);
    }

    #[test]
    fn realm_nonce() {
        init();
        let realm = Realm::new("example.org").unwrap();
        let raw: RawAttribute = realm.into();
        assert_eq!(Realm::try_from(&raw).unwrap().realm(), "example.org");
        let nonce = Nonce::new("adl7W7PeDU4hKE72jdaQvbAMcr6h39sm").unwrap();
        let raw: RawAttribute = nonce.into();
        assert_eq!(
            Nonce::try_from(&raw).unwrap().nonce(),
            "adl7W7PeDU4hKE72jdaQvbAMcr6h39sm"
        );
    }

    #[test]
    fn error_code() {
        init();
        let codes = vec![300, 401, 487, 699];
        for code in codes.into_iter() {
            let reason = ErrorCode::default_reason_for_code(code);
            let err = ErrorCode::new(code, reason).unwrap();
            assert_eq!(err.get_type(), ERROR_CODE);
            assert_eq!(err.code(), code);
            assert_eq!(err.reason(), reason);
            let raw: RawAttribute = err.into();
            let err2 = ErrorCode::try_from(&raw).unwrap();
            assert_eq!(err2.get_type(), ERROR_CODE);
            assert_eq!(err2.code(), code);
            assert_eq!(err2.reason(), reason);
        }
    }

    #[test]
    fn unknown_attributes() {
        init();
        let mut unknown = UnknownAttributes::new(&[REALM]);
        unknown.add_attribute(ALTERNATE_SERVER);
        // duplicates ignored
        unknown.add_attribute(ALTERNATE_SERVER);
        assert_eq!(unknown.get_type(), UNKNOWN_ATTRIBUTES);
        assert!(unknown.has_attribute(REALM));
        assert!(unknown.has_attribute(ALTERNATE_SERVER));
        assert!(!unknown.has_attribute(NONCE));
        let raw: RawAttribute = unknown.into();
        let unknown2 = UnknownAttributes::try_from(&raw).unwrap();
        assert_eq!(unknown2.get_type(), UNKNOWN_ATTRIBUTES);
        assert!(unknown2.has_attribute(REALM));
        assert!(unknown2.has_attribute(ALTERNATE_SERVER));
        assert!(!unknown2.has_attribute(NONCE));
    }

    #[test]
    fn xor_mapped_address() {
        init();
        let transaction_id = 0x9876_5432_1098_7654_3210_9876;
        let addrs: &[SocketAddr] = &[
            "192.168.0.1:40000".parse().unwrap(),
            "[fe80::1:2:3]:40000".parse().unwrap(),
        ];
        for addr in addrs {
            let mapped = XorMappedAddress::new(*addr, transaction_id).unwrap();
            assert_eq!(mapped.get_type(), XOR_MAPPED_ADDRESS);
            assert_eq!(mapped.addr(transaction_id), *addr);
            let raw: RawAttribute = mapped.into();
            let mapped2 = XorMappedAddress::try_from(&raw).unwrap();
            assert_eq!(mapped2.get_type(), XOR_MAPPED_ADDRESS);
            assert_eq!(mapped2.addr(transaction_id), *addr);
        }
    }

    #[test]
    fn xor_mapped_address_really_xors() {
        init();
        let transaction_id = 0x9876_5432_1098_7654_3210_9876;
        let addr: SocketAddr = "192.168.0.1:40000".parse().unwrap();
        let raw = XorMappedAddress::new(addr, transaction_id).unwrap().to_raw();
        // the wire form must not contain the plain port or address
        assert_ne!(BigEndian::read_u16(&raw.value[2..4]), addr.port());
        assert_ne!(
            IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(&raw.value[4..8]))),
            addr.ip()
        );
    }

    #[test]
    fn xor_relayed_address() {
        init();
        let transaction_id = 0x1234_5678_9abc_def0_1234_5678;
        let addr: SocketAddr = "198.51.100.3:49152".parse().unwrap();
        let relayed = XorRelayedAddress::new(addr, transaction_id).unwrap();
        assert_eq!(relayed.get_type(), XOR_RELAYED_ADDRESS);
        let raw: RawAttribute = relayed.into();
        let relayed2 = XorRelayedAddress::try_from(&raw).unwrap();
        assert_eq!(relayed2.addr(transaction_id), addr);
    }

    #[test]
    fn priority() {
        init();
        let val = 100;
        let priority = Priority::new(val);
        assert_eq!(priority.get_type(), PRIORITY);
        assert_eq!(priority.priority(), val);
        let raw: RawAttribute = priority.into();
        let mapped2 = Priority::try_from(&raw).unwrap();
        assert_eq!(mapped2.get_type(), PRIORITY);
        assert_eq!(mapped2.priority(), val);
    }

    #[test]
    fn lifetime() {
        init();
        let lifetime = Lifetime::new(600);
        let raw: RawAttribute = lifetime.into();
        assert_eq!(Lifetime::try_from(&raw).unwrap().lifetime(), 600);
    }

    #[test]
    fn requested_transport() {
        init();
        let rt = RequestedTransport::new(RequestedTransport::UDP);
        assert_eq!(rt.get_type(), REQUESTED_TRANSPORT);
        let raw: RawAttribute = rt.into();
        assert_eq!(
            RequestedTransport::try_from(&raw).unwrap().protocol(),
            RequestedTransport::UDP
        );
    }

    #[test]
    fn use_candidate() {
        init();
        let use_candidate = UseCandidate::new();
        assert_eq!(use_candidate.get_type(), USE_CANDIDATE);
        let raw: RawAttribute = use_candidate.into();
        let mapped2 = UseCandidate::try_from(&raw).unwrap();
        assert_eq!(mapped2.get_type(), USE_CANDIDATE);
    }

    #[test]
    fn ice_controlling() {
        init();
        let tb = 100;
        let attr = IceControlling::new(tb);
        assert_eq!(attr.get_type(), ICE_CONTROLLING);
        assert_eq!(attr.tie_breaker(), tb);
        let raw: RawAttribute = attr.into();
        let mapped2 = IceControlling::try_from(&raw).unwrap();
        assert_eq!(mapped2.get_type(), ICE_CONTROLLING);
        assert_eq!(mapped2.tie_breaker(), tb);
    }

    #[test]
    fn ice_controlled() {
        init();
        let tb = 100;
        let attr = IceControlled::new(tb);
        assert_eq!(attr.get_type(), ICE_CONTROLLED);
        assert_eq!(attr.tie_breaker(), tb);
        let raw: RawAttribute = attr.into();
        let mapped2 = IceControlled::try_from(&raw).unwrap();
        assert_eq!(mapped2.get_type(), ICE_CONTROLLED);
        assert_eq!(mapped2.tie_breaker(), tb);
    }

    #[test]
    fn fingerprint() {
        init();
        let val = [1; 4];
        let attr = Fingerprint::new(val);
        assert_eq!(attr.get_type(), FINGERPRINT);
        assert_eq!(attr.fingerprint(), &val);
        let raw: RawAttribute = attr.clone().into();
        // wire form is XOR-ed with the STUN constant
        assert_eq!(
            raw.value,
            bytewise_xor!(4, val, Fingerprint::XOR_CONSTANT, 0)
        );
        let mapped2 = Fingerprint::try_from(&raw).unwrap();
        assert_eq!(mapped2.get_type(), FINGERPRINT);
        assert_eq!(mapped2.fingerprint(), &val);
    }

    #[test]
    fn message_integrity() {
        init();
        let val = [1; 20];
        let attr = MessageIntegrity::new(val);
        assert_eq!(attr.get_type(), MESSAGE_INTEGRITY);
        assert_eq!(attr.hmac(), &val);
        let raw: RawAttribute = attr.into();
        let mapped2 = MessageIntegrity::try_from(&raw).unwrap();
        assert_eq!(mapped2.get_type(), MESSAGE_INTEGRITY);
        assert_eq!(mapped2.hmac(), &val);
    }
}
