#![warn(unreachable_pub)]

//! STUN message types as used by ICE connectivity checks (RFC 5389 subset)

use bytes::{Buf, BufMut};
use std::fmt;
use thiserror::Error;

pub mod attributes;

use attributes::{Attribute, KeyedAttribute};

pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Size of the fixed STUN message header
pub const MESSAGE_HEADER_LENGTH: usize = 20;

/// 96-bit STUN transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn new(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// STUN message class, encoded in bits 4 & 8 of the message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

/// STUN method. Only Binding is used by ICE's STUN usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Binding,
    Other(u16),
}

impl Method {
    fn to_u16(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Other(m) => m,
        }
    }

    fn from_u16(m: u16) -> Self {
        match m {
            0x001 => Method::Binding,
            m => Method::Other(m),
        }
    }
}

fn encode_type(class: Class, method: Method) -> u16 {
    let m = method.to_u16();

    // M11..M7 | C1 | M6..M4 | C0 | M3..M0
    let (c1, c0) = match class {
        Class::Request => (0, 0),
        Class::Indication => (0, 1),
        Class::Success => (1, 0),
        Class::Error => (1, 1),
    };

    ((m & 0xF80) << 2) | (c1 << 8) | ((m & 0x070) << 1) | (c0 << 4) | (m & 0x00F)
}

fn decode_type(typ: u16) -> (Class, Method) {
    let class = match ((typ >> 8) & 1, (typ >> 4) & 1) {
        (0, 0) => Class::Request,
        (0, 1) => Class::Indication,
        (1, 0) => Class::Success,
        _ => Class::Error,
    };

    let method = ((typ >> 2) & 0xF80) | ((typ >> 1) & 0x070) | (typ & 0x00F);

    (class, Method::from_u16(method))
}

/// Quick check whether a datagram looks like a STUN message, without parsing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsStunMessageInfo {
    Yes { length: usize },
    No,
}

pub fn is_stun_message(buf: &[u8]) -> IsStunMessageInfo {
    if buf.len() < MESSAGE_HEADER_LENGTH {
        return IsStunMessageInfo::No;
    }

    // Top two bits of the message type are always zero
    if buf[0] & 0xC0 != 0 {
        return IsStunMessageInfo::No;
    }

    if buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return IsStunMessageInfo::No;
    }

    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;

    if length % 4 != 0 || MESSAGE_HEADER_LENGTH + length > buf.len() {
        return IsStunMessageInfo::No;
    }

    IsStunMessageInfo::Yes {
        length: MESSAGE_HEADER_LENGTH + length,
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is too short to contain a STUN header")]
    TooShort,
    #[error("not a STUN message")]
    NotStun,
    #[error("message length field does not match the buffer")]
    InvalidLength,
    #[error("attribute is truncated")]
    TruncatedAttribute,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttrError {
    #[error("attribute value has an invalid length")]
    InvalidLength,
    #[error("attribute value is malformed")]
    InvalidValue,
    #[error("attribute value is not valid UTF-8")]
    InvalidUtf8,
    #[error("MESSAGE-INTEGRITY does not match")]
    IntegrityMismatch,
    #[error("FINGERPRINT does not match")]
    FingerprintMismatch,
}

struct RawAttr {
    typ: u16,
    /// Offset of the attribute's TLV header inside the message
    offset: usize,
    value_start: usize,
    value_len: usize,
}

/// A parsed STUN message. Keeps the raw bytes around so MESSAGE-INTEGRITY and
/// FINGERPRINT can be verified over the original wire representation.
pub struct Message {
    buf: Vec<u8>,
    class: Class,
    method: Method,
    transaction_id: TransactionId,
    attrs: Vec<RawAttr>,
}

impl Message {
    pub fn parse(buf: Vec<u8>) -> Result<Self, ParseError> {
        if buf.len() < MESSAGE_HEADER_LENGTH {
            return Err(ParseError::TooShort);
        }

        let mut cursor = &buf[..];

        let typ = cursor.get_u16();

        if typ & 0xC000 != 0 {
            return Err(ParseError::NotStun);
        }

        let length = cursor.get_u16() as usize;

        if cursor.get_u32() != MAGIC_COOKIE {
            return Err(ParseError::NotStun);
        }

        if length % 4 != 0 || MESSAGE_HEADER_LENGTH + length != buf.len() {
            return Err(ParseError::InvalidLength);
        }

        let mut tid = [0u8; 12];
        cursor.copy_to_slice(&mut tid);

        let (class, method) = decode_type(typ);

        let mut attrs = Vec::new();
        let mut offset = MESSAGE_HEADER_LENGTH;

        while offset < buf.len() {
            if buf.len() - offset < 4 {
                return Err(ParseError::TruncatedAttribute);
            }

            let typ = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let value_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let value_start = offset + 4;
            let padded_len = (value_len + 3) & !3;

            if value_start + padded_len > buf.len() {
                return Err(ParseError::TruncatedAttribute);
            }

            attrs.push(RawAttr {
                typ,
                offset,
                value_start,
                value_len,
            });

            offset = value_start + padded_len;
        }

        Ok(Self {
            buf,
            class,
            method,
            transaction_id: TransactionId::new(tid),
            attrs,
        })
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Look up and decode an attribute. Returns `None` if the attribute is not
    /// present, `Some(Err(..))` if it is present but malformed.
    pub fn attribute<A: Attribute>(&self) -> Option<Result<A, AttrError>> {
        let raw = self.attrs.iter().find(|a| a.typ == A::TYPE)?;

        Some(A::decode(AttrContext {
            msg: &self.buf,
            transaction_id: self.transaction_id,
            attr_offset: raw.offset,
            value: &self.buf[raw.value_start..raw.value_start + raw.value_len],
        }))
    }

    /// Like [`attribute`](Self::attribute) for attributes which need key
    /// material to decode (MESSAGE-INTEGRITY).
    pub fn attribute_with<A: KeyedAttribute>(&self, key: &A::Key) -> Option<Result<A, AttrError>> {
        let raw = self.attrs.iter().find(|a| a.typ == A::TYPE)?;

        Some(A::decode_keyed(
            AttrContext {
                msg: &self.buf,
                transaction_id: self.transaction_id,
                attr_offset: raw.offset,
                value: &self.buf[raw.value_start..raw.value_start + raw.value_len],
            },
            key,
        ))
    }

    /// Whether an attribute of the given type is present
    pub fn has_attribute(&self, typ: u16) -> bool {
        self.attrs.iter().any(|a| a.typ == typ)
    }

    /// Comprehension-required (type < 0x8000) attributes this crate does not
    /// implement. A request containing any of these must be rejected with a
    /// 420 error response listing them.
    pub fn unknown_comprehension_required(&self) -> Vec<u16> {
        self.attrs
            .iter()
            .map(|a| a.typ)
            .filter(|&t| t < 0x8000 && !attributes::is_known_attribute(t))
            .collect()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("class", &self.class)
            .field("method", &self.method)
            .field("transaction_id", &self.transaction_id)
            .field("attributes", &self.attrs.len())
            .finish()
    }
}

/// Context handed to attribute decoders, carrying everything position or
/// transaction dependent attributes (XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY,
/// FINGERPRINT) need.
pub struct AttrContext<'m> {
    msg: &'m [u8],
    transaction_id: TransactionId,
    attr_offset: usize,
    value: &'m [u8],
}

impl<'m> AttrContext<'m> {
    pub fn value(&self) -> &'m [u8] {
        self.value
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// The raw message up to this attribute, with the header's length field
    /// patched as if the message ended `additional` bytes after this
    /// attribute's TLV header. Used by MESSAGE-INTEGRITY & FINGERPRINT which
    /// are computed over the preceding bytes with an adjusted length.
    pub fn message_up_to_attr(&self, additional: usize) -> Vec<u8> {
        let mut msg = self.msg[..self.attr_offset].to_vec();
        let patched = (self.attr_offset - MESSAGE_HEADER_LENGTH + additional) as u16;
        msg[2..4].copy_from_slice(&patched.to_be_bytes());
        msg
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("attribute value too large for a STUN message")]
    ValueTooLarge,
}

/// Incrementally builds a STUN message. Attributes are serialized in insertion
/// order, so MESSAGE-INTEGRITY must be added after all covered attributes and
/// FINGERPRINT last.
pub struct MessageBuilder {
    buf: Vec<u8>,
    transaction_id: TransactionId,
}

impl MessageBuilder {
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let mut buf = Vec::with_capacity(128);

        buf.put_u16(encode_type(class, method));
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(transaction_id.as_bytes());

        Self {
            buf,
            transaction_id,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn add_attr(&mut self, attr: &impl Attribute) -> Result<(), BuildError> {
        attr.encode(self)
    }

    pub fn add_attr_with<A: KeyedAttribute>(
        &mut self,
        attr: &A,
        key: &A::Key,
    ) -> Result<(), BuildError> {
        attr.encode_keyed(self, key)
    }

    /// Append a raw TLV attribute with padding to the 4-byte boundary
    pub fn push_raw_attr(&mut self, typ: u16, value: &[u8]) -> Result<(), BuildError> {
        let len = u16::try_from(value.len()).map_err(|_| BuildError::ValueTooLarge)?;

        self.buf.put_u16(typ);
        self.buf.put_u16(len);
        self.buf.put_slice(value);

        let padding = (4 - value.len() % 4) % 4;
        self.buf.put_bytes(0, padding);

        Ok(())
    }

    /// The message serialized so far, with the length field patched as if it
    /// ended `additional` bytes past the current end
    pub fn message_with_additional_length(&mut self, additional: usize) -> &[u8] {
        let patched = (self.buf.len() - MESSAGE_HEADER_LENGTH + additional) as u16;
        self.buf[2..4].copy_from_slice(&patched.to_be_bytes());
        &self.buf
    }

    pub fn finish(mut self) -> Vec<u8> {
        let length = (self.buf.len() - MESSAGE_HEADER_LENGTH) as u16;
        self.buf[2..4].copy_from_slice(&length.to_be_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::*;
    use std::borrow::Cow;
    use std::net::SocketAddr;

    fn addr_v4() -> SocketAddr {
        "192.0.2.1:32853".parse().unwrap()
    }

    fn addr_v6() -> SocketAddr {
        "[2001:db8::5]:40000".parse().unwrap()
    }

    #[test]
    fn type_encoding_binding_classes() {
        assert_eq!(encode_type(Class::Request, Method::Binding), 0x0001);
        assert_eq!(encode_type(Class::Indication, Method::Binding), 0x0011);
        assert_eq!(encode_type(Class::Success, Method::Binding), 0x0101);
        assert_eq!(encode_type(Class::Error, Method::Binding), 0x0111);

        for typ in [0x0001u16, 0x0011, 0x0101, 0x0111] {
            let (class, method) = decode_type(typ);
            assert_eq!(method, Method::Binding);
            assert_eq!(encode_type(class, method), typ);
        }
    }

    #[test]
    fn roundtrip_all_ice_attributes() {
        let tid = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Request, Method::Binding, tid);
        builder.add_attr(&Username::new("remote:local")).unwrap();
        builder.add_attr(&Priority(0x6E7F00FF)).unwrap();
        builder.add_attr(&UseCandidate).unwrap();
        builder.add_attr(&IceControlling(0x1111_2222_3333_4444)).unwrap();
        builder.add_attr(&XorMappedAddress(addr_v4())).unwrap();
        builder.add_attr(&MappedAddress(addr_v6())).unwrap();
        builder.add_attr(&Software::new("quell")).unwrap();
        builder
            .add_attr_with(
                &MessageIntegrity::default(),
                &MessageIntegrityKey::new_raw(Cow::Borrowed(b"the-password")),
            )
            .unwrap();
        builder.add_attr(&Fingerprint).unwrap();

        let bytes = builder.finish();

        assert!(matches!(
            is_stun_message(&bytes),
            IsStunMessageInfo::Yes { length } if length == bytes.len()
        ));

        let msg = Message::parse(bytes).unwrap();

        assert_eq!(msg.class(), Class::Request);
        assert_eq!(msg.method(), Method::Binding);
        assert_eq!(msg.transaction_id(), tid);

        assert_eq!(msg.attribute::<Username>().unwrap().unwrap().0, "remote:local");
        assert_eq!(msg.attribute::<Priority>().unwrap().unwrap().0, 0x6E7F00FF);
        assert!(msg.attribute::<UseCandidate>().is_some());
        assert_eq!(
            msg.attribute::<IceControlling>().unwrap().unwrap().0,
            0x1111_2222_3333_4444
        );
        assert_eq!(msg.attribute::<XorMappedAddress>().unwrap().unwrap().0, addr_v4());
        assert_eq!(msg.attribute::<MappedAddress>().unwrap().unwrap().0, addr_v6());
        assert!(msg.attribute::<Fingerprint>().unwrap().is_ok());
        assert!(msg
            .attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
                b"the-password"
            )))
            .unwrap()
            .is_ok());

        assert!(msg.unknown_comprehension_required().is_empty());
    }

    #[test]
    fn integrity_validates_iff_key_matches() {
        let mut builder =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        builder.add_attr(&Username::new("a:b")).unwrap();
        builder
            .add_attr_with(
                &MessageIntegrity::default(),
                &MessageIntegrityKey::new_raw(Cow::Borrowed(b"right")),
            )
            .unwrap();
        builder.add_attr(&Fingerprint).unwrap();

        let msg = Message::parse(builder.finish()).unwrap();

        assert!(msg
            .attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
                b"right"
            )))
            .unwrap()
            .is_ok());
        assert_eq!(
            msg.attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
                b"wrong"
            )))
            .unwrap()
            .unwrap_err(),
            AttrError::IntegrityMismatch
        );
    }

    #[test]
    fn fingerprint_detects_tampering() {
        let mut builder =
            MessageBuilder::new(Class::Success, Method::Binding, TransactionId::random());
        builder.add_attr(&XorMappedAddress(addr_v4())).unwrap();
        builder.add_attr(&Fingerprint).unwrap();

        let mut bytes = builder.finish();

        let msg = Message::parse(bytes.clone()).unwrap();
        assert!(msg.attribute::<Fingerprint>().unwrap().is_ok());

        // Flip one bit in the covered region
        bytes[25] ^= 0x01;
        let msg = Message::parse(bytes).unwrap();
        assert_eq!(
            msg.attribute::<Fingerprint>().unwrap().unwrap_err(),
            AttrError::FingerprintMismatch
        );
    }

    #[test]
    fn unknown_comprehension_required_attrs_are_reported() {
        let mut builder =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        builder.push_raw_attr(0x7FFF, &[1, 2, 3]).unwrap();
        builder.push_raw_attr(0x8123, &[4]).unwrap();

        let msg = Message::parse(builder.finish()).unwrap();

        // 0x8123 is comprehension-optional and must not be reported
        assert_eq!(msg.unknown_comprehension_required(), vec![0x7FFF]);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Message::parse(vec![1, 2, 3]).unwrap_err(), ParseError::TooShort);

        assert_eq!(is_stun_message(&[0x80; 40]), IsStunMessageInfo::No);

        let mut builder =
            MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random());
        builder.add_attr(&Priority(1)).unwrap();
        let mut bytes = builder.finish();

        // Truncating breaks the length invariant
        bytes.pop();
        assert!(Message::parse(bytes).is_err());
    }
}
