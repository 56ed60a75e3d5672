//! Typed STUN attributes used by ICE

use crate::{AttrContext, AttrError, BuildError, MessageBuilder, MAGIC_COOKIE};
use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

type HmacSha1 = Hmac<Sha1>;

const MAPPED_ADDRESS: u16 = 0x0001;
const USERNAME: u16 = 0x0006;
const MESSAGE_INTEGRITY: u16 = 0x0008;
const ERROR_CODE: u16 = 0x0009;
const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const PRIORITY: u16 = 0x0024;
const USE_CANDIDATE: u16 = 0x0025;
const SOFTWARE: u16 = 0x8022;
const FINGERPRINT: u16 = 0x8028;
const ICE_CONTROLLED: u16 = 0x8029;
const ICE_CONTROLLING: u16 = 0x802A;

/// XORed into the CRC-32 of the message for the FINGERPRINT attribute
const FINGERPRINT_XOR: u32 = 0x5354554e;

pub(crate) fn is_known_attribute(typ: u16) -> bool {
    matches!(
        typ,
        MAPPED_ADDRESS
            | USERNAME
            | MESSAGE_INTEGRITY
            | ERROR_CODE
            | UNKNOWN_ATTRIBUTES
            | XOR_MAPPED_ADDRESS
            | PRIORITY
            | USE_CANDIDATE
            | SOFTWARE
            | FINGERPRINT
            | ICE_CONTROLLED
            | ICE_CONTROLLING
    )
}

pub trait Attribute: Sized {
    const TYPE: u16;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError>;
    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError>;
}

/// Attribute which requires key material to decode or encode
pub trait KeyedAttribute: Sized {
    const TYPE: u16;
    type Key;

    fn decode_keyed(ctx: AttrContext<'_>, key: &Self::Key) -> Result<Self, AttrError>;
    fn encode_keyed(&self, builder: &mut MessageBuilder, key: &Self::Key)
        -> Result<(), BuildError>;
}

// ==== address attributes ====

fn encode_address(addr: SocketAddr, xor: Option<&AddrXor>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);

    buf.put_u8(0);
    buf.put_u8(match addr {
        SocketAddr::V4(_) => 0x01,
        SocketAddr::V6(_) => 0x02,
    });
    buf.put_u16(addr.port() ^ xor.map_or(0, AddrXor::port_mask));

    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            if let Some(xor) = xor {
                for (o, m) in octets.iter_mut().zip(xor.v4_mask()) {
                    *o ^= m;
                }
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            if let Some(xor) = xor {
                for (o, m) in octets.iter_mut().zip(xor.v6_mask()) {
                    *o ^= m;
                }
            }
            buf.put_slice(&octets);
        }
    }

    buf
}

fn decode_address(mut value: &[u8], xor: Option<&AddrXor>) -> Result<SocketAddr, AttrError> {
    if value.len() < 8 {
        return Err(AttrError::InvalidLength);
    }

    value.advance(1);
    let family = value.get_u8();
    let port = value.get_u16() ^ xor.map_or(0, AddrXor::port_mask);

    let ip = match family {
        0x01 => {
            if value.len() != 4 {
                return Err(AttrError::InvalidLength);
            }
            let mut octets = [0u8; 4];
            value.copy_to_slice(&mut octets);
            if let Some(xor) = xor {
                for (o, m) in octets.iter_mut().zip(xor.v4_mask()) {
                    *o ^= m;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            if value.len() != 16 {
                return Err(AttrError::InvalidLength);
            }
            let mut octets = [0u8; 16];
            value.copy_to_slice(&mut octets);
            if let Some(xor) = xor {
                for (o, m) in octets.iter_mut().zip(xor.v6_mask()) {
                    *o ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(AttrError::InvalidValue),
    };

    Ok(SocketAddr::new(ip, port))
}

struct AddrXor {
    transaction_id: [u8; 12],
}

impl AddrXor {
    fn port_mask(&self) -> u16 {
        (MAGIC_COOKIE >> 16) as u16
    }

    fn v4_mask(&self) -> [u8; 4] {
        MAGIC_COOKIE.to_be_bytes()
    }

    fn v6_mask(&self) -> [u8; 16] {
        let mut mask = [0u8; 16];
        mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        mask[4..].copy_from_slice(&self.transaction_id);
        mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedAddress(pub SocketAddr);

impl Attribute for MappedAddress {
    const TYPE: u16 = MAPPED_ADDRESS;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        decode_address(ctx.value(), None).map(Self)
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, &encode_address(self.0, None))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorMappedAddress(pub SocketAddr);

impl Attribute for XorMappedAddress {
    const TYPE: u16 = XOR_MAPPED_ADDRESS;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let xor = AddrXor {
            transaction_id: *ctx.transaction_id().as_bytes(),
        };
        decode_address(ctx.value(), Some(&xor)).map(Self)
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        let xor = AddrXor {
            transaction_id: *builder.transaction_id().as_bytes(),
        };
        builder.push_raw_attr(Self::TYPE, &encode_address(self.0, Some(&xor)))
    }
}

// ==== text attributes ====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Username(pub String);

impl Username {
    pub fn new(username: &str) -> Self {
        Self(username.into())
    }
}

impl Attribute for Username {
    const TYPE: u16 = USERNAME;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let s = std::str::from_utf8(ctx.value()).map_err(|_| AttrError::InvalidUtf8)?;
        Ok(Self(s.into()))
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, self.0.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Software(pub String);

impl Software {
    pub fn new(software: &str) -> Self {
        Self(software.into())
    }
}

impl Attribute for Software {
    const TYPE: u16 = SOFTWARE;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let s = std::str::from_utf8(ctx.value()).map_err(|_| AttrError::InvalidUtf8)?;
        Ok(Self(s.into()))
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, self.0.as_bytes())
    }
}

// ==== ICE attributes ====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority(pub u32);

impl Attribute for Priority {
    const TYPE: u16 = PRIORITY;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let value: [u8; 4] = ctx.value().try_into().map_err(|_| AttrError::InvalidLength)?;
        Ok(Self(u32::from_be_bytes(value)))
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, &self.0.to_be_bytes())
    }
}

/// Zero length flag attribute marking a nomination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCandidate;

impl Attribute for UseCandidate {
    const TYPE: u16 = USE_CANDIDATE;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        if !ctx.value().is_empty() {
            return Err(AttrError::InvalidLength);
        }
        Ok(Self)
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, &[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceControlling(pub u64);

impl Attribute for IceControlling {
    const TYPE: u16 = ICE_CONTROLLING;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let value: [u8; 8] = ctx.value().try_into().map_err(|_| AttrError::InvalidLength)?;
        Ok(Self(u64::from_be_bytes(value)))
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, &self.0.to_be_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceControlled(pub u64);

impl Attribute for IceControlled {
    const TYPE: u16 = ICE_CONTROLLED;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let value: [u8; 8] = ctx.value().try_into().map_err(|_| AttrError::InvalidLength)?;
        Ok(Self(u64::from_be_bytes(value)))
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        builder.push_raw_attr(Self::TYPE, &self.0.to_be_bytes())
    }
}

// ==== error & unknown attributes ====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub number: u16,
    pub reason: String,
}

impl ErrorCode {
    pub fn new(number: u16, reason: &str) -> Self {
        Self {
            number,
            reason: reason.into(),
        }
    }
}

impl Attribute for ErrorCode {
    const TYPE: u16 = ERROR_CODE;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let value = ctx.value();
        if value.len() < 4 {
            return Err(AttrError::InvalidLength);
        }

        let class = u16::from(value[2] & 0x07);
        let number = u16::from(value[3]);
        if number >= 100 {
            return Err(AttrError::InvalidValue);
        }

        let reason = std::str::from_utf8(&value[4..]).map_err(|_| AttrError::InvalidUtf8)?;

        Ok(Self {
            number: class * 100 + number,
            reason: reason.into(),
        })
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        let mut value = Vec::with_capacity(4 + self.reason.len());
        value.put_u16(0);
        value.put_u8((self.number / 100) as u8);
        value.put_u8((self.number % 100) as u8);
        value.put_slice(self.reason.as_bytes());

        builder.push_raw_attr(Self::TYPE, &value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttributes(pub Vec<u16>);

impl Attribute for UnknownAttributes {
    const TYPE: u16 = UNKNOWN_ATTRIBUTES;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let value = ctx.value();
        if value.len() % 2 != 0 {
            return Err(AttrError::InvalidLength);
        }

        Ok(Self(
            value
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ))
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        let mut value = Vec::with_capacity(self.0.len() * 2);
        for typ in &self.0 {
            value.put_u16(*typ);
        }

        builder.push_raw_attr(Self::TYPE, &value)
    }
}

// ==== integrity & fingerprint ====

/// Key for the MESSAGE-INTEGRITY HMAC. ICE uses the short-term credential
/// mechanism, so the key is the raw password of whichever side the message
/// class dictates.
pub struct MessageIntegrityKey(Vec<u8>);

impl MessageIntegrityKey {
    pub fn new_raw(key: Cow<'_, [u8]>) -> Self {
        Self(key.into_owned())
    }
}

/// HMAC-SHA1 over the message up to (and excluding) this attribute, with the
/// header length patched to cover the attribute itself. Everything appended
/// afterwards (FINGERPRINT) is outside the HMAC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessageIntegrity;

const MESSAGE_INTEGRITY_TLV_LENGTH: usize = 4 + 20;

impl KeyedAttribute for MessageIntegrity {
    const TYPE: u16 = MESSAGE_INTEGRITY;
    type Key = MessageIntegrityKey;

    fn decode_keyed(ctx: AttrContext<'_>, key: &Self::Key) -> Result<Self, AttrError> {
        if ctx.value().len() != 20 {
            return Err(AttrError::InvalidLength);
        }

        let covered = ctx.message_up_to_attr(MESSAGE_INTEGRITY_TLV_LENGTH);

        let mut mac =
            HmacSha1::new_from_slice(&key.0).expect("HMAC-SHA1 accepts keys of any size");
        mac.update(&covered);

        mac.verify_slice(ctx.value())
            .map_err(|_| AttrError::IntegrityMismatch)?;

        Ok(Self)
    }

    fn encode_keyed(
        &self,
        builder: &mut MessageBuilder,
        key: &Self::Key,
    ) -> Result<(), BuildError> {
        let covered = builder.message_with_additional_length(MESSAGE_INTEGRITY_TLV_LENGTH);

        let mut mac =
            HmacSha1::new_from_slice(&key.0).expect("HMAC-SHA1 accepts keys of any size");
        mac.update(covered);
        let digest = mac.finalize().into_bytes();

        builder.push_raw_attr(Self::TYPE, &digest)
    }
}

/// CRC-32 of the message up to this attribute XORed with 0x5354554e
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint;

const FINGERPRINT_TLV_LENGTH: usize = 4 + 4;

fn fingerprint_crc(covered: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(covered) ^ FINGERPRINT_XOR
}

impl Attribute for Fingerprint {
    const TYPE: u16 = FINGERPRINT;

    fn decode(ctx: AttrContext<'_>) -> Result<Self, AttrError> {
        let value: [u8; 4] = ctx.value().try_into().map_err(|_| AttrError::InvalidLength)?;

        let covered = ctx.message_up_to_attr(FINGERPRINT_TLV_LENGTH);

        if fingerprint_crc(&covered) != u32::from_be_bytes(value) {
            return Err(AttrError::FingerprintMismatch);
        }

        Ok(Self)
    }

    fn encode(&self, builder: &mut MessageBuilder) -> Result<(), BuildError> {
        let covered = builder.message_with_additional_length(FINGERPRINT_TLV_LENGTH);
        let crc = fingerprint_crc(covered);

        builder.push_raw_attr(Self::TYPE, &crc.to_be_bytes())
    }
}
