//! BER codec for the LDAP subset of X.690 (RFC 4511 section 5.1).
//!
//! Encoding always emits definite lengths. Decoding accepts definite and
//! indefinite lengths (the latter only on constructed elements) and high tag
//! numbers. A buffer that ends before the first complete element decodes to
//! `Ok(None)` so the caller can read more bytes.

use crate::error::{LdapError, Result};
use std::fmt;
use std::io::{Cursor, Read};

/// Universal tag numbers used by LDAP.
pub mod universal {
    pub const BOOLEAN: u32 = 1;
    pub const INTEGER: u32 = 2;
    pub const OCTET_STRING: u32 = 4;
    pub const NULL: u32 = 5;
    pub const ENUMERATED: u32 = 10;
    pub const SEQUENCE: u32 = 16;
    pub const SET: u32 = 17;
}

/// Nesting limit for decode. LDAP messages never come close.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::Context,
            _ => TagClass::Private,
        }
    }

    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0,
            TagClass::Application => 1,
            TagClass::Context => 2,
            TagClass::Private => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub class: TagClass,
    pub number: u32,
}

impl Tag {
    pub const fn new(class: TagClass, number: u32) -> Self {
        Self { class, number }
    }

    pub const fn universal(number: u32) -> Self {
        Self::new(TagClass::Universal, number)
    }

    pub const fn application(number: u32) -> Self {
        Self::new(TagClass::Application, number)
    }

    pub const fn context(number: u32) -> Self {
        Self::new(TagClass::Context, number)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            TagClass::Universal => write!(f, "UNIVERSAL {}", self.number),
            TagClass::Application => write!(f, "[APPLICATION {}]", self.number),
            TagClass::Context => write!(f, "[{}]", self.number),
            TagClass::Private => write!(f, "[PRIVATE {}]", self.number),
        }
    }
}

/// Content of a node. A primitive node never has children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Primitive(Vec<u8>),
    Constructed(Vec<BerValue>),
}

/// One node of a decoded or to-be-encoded BER tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerValue {
    pub tag: Tag,
    pub payload: Payload,
}

impl BerValue {
    pub fn primitive(tag: Tag, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: Payload::Primitive(bytes.into()),
        }
    }

    pub fn constructed(tag: Tag, children: Vec<BerValue>) -> Self {
        Self {
            tag,
            payload: Payload::Constructed(children),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self::primitive(
            Tag::universal(universal::BOOLEAN),
            vec![if value { 0xFF } else { 0x00 }],
        )
    }

    pub fn integer(value: i64) -> Self {
        Self::primitive(Tag::universal(universal::INTEGER), integer_bytes(value))
    }

    pub fn enumerated(value: i64) -> Self {
        Self::primitive(Tag::universal(universal::ENUMERATED), integer_bytes(value))
    }

    pub fn octet_string(bytes: impl Into<Vec<u8>>) -> Self {
        Self::primitive(Tag::universal(universal::OCTET_STRING), bytes)
    }

    pub fn null() -> Self {
        Self::primitive(Tag::universal(universal::NULL), Vec::new())
    }

    pub fn sequence(children: Vec<BerValue>) -> Self {
        Self::constructed(Tag::universal(universal::SEQUENCE), children)
    }

    pub fn set(children: Vec<BerValue>) -> Self {
        Self::constructed(Tag::universal(universal::SET), children)
    }

    /// IMPLICIT tagging: same payload under a new tag.
    pub fn retag(self, tag: Tag) -> Self {
        Self {
            tag,
            payload: self.payload,
        }
    }

    pub fn is(&self, tag: Tag) -> bool {
        self.tag == tag
    }

    pub fn is_constructed(&self) -> bool {
        matches!(self.payload, Payload::Constructed(_))
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.payload {
            Payload::Primitive(bytes) => Ok(bytes),
            Payload::Constructed(_) => Err(LdapError::structural(format!(
                "{} must be primitive",
                self.tag
            ))),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.payload {
            Payload::Primitive(bytes) => Ok(bytes),
            Payload::Constructed(_) => Err(LdapError::structural(format!(
                "{} must be primitive",
                self.tag
            ))),
        }
    }

    pub fn children(&self) -> Result<&[BerValue]> {
        match &self.payload {
            Payload::Constructed(children) => Ok(children),
            Payload::Primitive(_) => Err(LdapError::structural(format!(
                "{} must be constructed",
                self.tag
            ))),
        }
    }

    pub fn into_children(self) -> Result<Vec<BerValue>> {
        match self.payload {
            Payload::Constructed(children) => Ok(children),
            Payload::Primitive(_) => Err(LdapError::structural(format!(
                "{} must be constructed",
                self.tag
            ))),
        }
    }

    /// Two's-complement big-endian, at most 8 octets.
    pub fn as_integer(&self) -> Result<i64> {
        let bytes = self.bytes()?;
        if bytes.is_empty() {
            return Err(LdapError::structural(format!(
                "{}: integer has no content octets",
                self.tag
            )));
        }
        if bytes.len() > 8 {
            return Err(LdapError::structural(format!(
                "{}: integer too large ({} octets)",
                self.tag,
                bytes.len()
            )));
        }
        let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in bytes {
            value = (value << 8) | b as i64;
        }
        Ok(value)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.bytes()? {
            [b] => Ok(*b != 0),
            other => Err(LdapError::structural(format!(
                "{}: boolean must be 1 octet, got {}",
                self.tag,
                other.len()
            ))),
        }
    }
}

fn integer_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Drop leading octets that only repeat the sign bit of the next one.
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Encode one element with definite lengths.
pub fn encode(value: &BerValue) -> Vec<u8> {
    let mut writer = BerWriter::new();
    writer.write_value(value);
    writer.into_vec()
}

/// Decode the first element in `data`, returning it with the number of octets
/// consumed. `Ok(None)` means the element is not complete yet.
pub fn decode(data: &[u8]) -> Result<Option<(BerValue, usize)>> {
    let mut reader = BerReader::new(data);
    match reader.read_value(0)? {
        Some(value) => Ok(Some((value, reader.position()))),
        None => Ok(None),
    }
}

enum Length {
    Definite(usize),
    Indefinite,
}

pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).ok()?;
        Some(buf[0])
    }

    /// Returns the tag and the constructed bit, or None if the header is cut short.
    fn read_tag(&mut self) -> Result<Option<(Tag, bool)>> {
        let Some(first) = self.read_byte() else {
            return Ok(None);
        };
        let class = TagClass::from_bits(first >> 6);
        let constructed = first & 0x20 != 0;
        let low = first & 0x1F;
        if low != 0x1F {
            return Ok(Some((Tag::new(class, low as u32), constructed)));
        }
        // High-tag-number form: base-128, continuation bit on all but the last octet.
        let mut number: u32 = 0;
        for _ in 0..5 {
            let Some(b) = self.read_byte() else {
                return Ok(None);
            };
            if number > (u32::MAX >> 7) {
                break;
            }
            number = (number << 7) | (b & 0x7F) as u32;
            if b & 0x80 == 0 {
                return Ok(Some((Tag::new(class, number), constructed)));
            }
        }
        Err(LdapError::structural(format!(
            "tag number in class {:?} does not fit in 32 bits",
            class
        )))
    }

    fn read_length(&mut self, tag: Tag, constructed: bool) -> Result<Option<Length>> {
        let Some(first) = self.read_byte() else {
            return Ok(None);
        };
        if first & 0x80 == 0 {
            return Ok(Some(Length::Definite(first as usize)));
        }
        if first == 0x80 {
            if !constructed {
                return Err(LdapError::structural(format!(
                    "{}: indefinite length on a primitive element",
                    tag
                )));
            }
            return Ok(Some(Length::Indefinite));
        }
        if first == 0xFF {
            return Err(LdapError::structural(format!(
                "{}: reserved length octet 0xFF",
                tag
            )));
        }
        let length_bytes = (first & 0x7F) as usize;
        if length_bytes > 8 {
            return Err(LdapError::structural(format!(
                "{}: length too large ({} length octets)",
                tag, length_bytes
            )));
        }
        let mut length: u64 = 0;
        for _ in 0..length_bytes {
            let Some(b) = self.read_byte() else {
                return Ok(None);
            };
            length = (length << 8) | b as u64;
        }
        let length = usize::try_from(length)
            .map_err(|_| LdapError::structural(format!("{}: length {} too large", tag, length)))?;
        Ok(Some(Length::Definite(length)))
    }

    fn read_value(&mut self, depth: usize) -> Result<Option<BerValue>> {
        let Some((tag, constructed)) = self.read_tag()? else {
            return Ok(None);
        };
        if depth > MAX_DEPTH {
            return Err(LdapError::structural(format!(
                "{}: nesting deeper than {}",
                tag, MAX_DEPTH
            )));
        }
        let Some(length) = self.read_length(tag, constructed)? else {
            return Ok(None);
        };
        match length {
            Length::Definite(len) => {
                if self.remaining() < len {
                    return Ok(None);
                }
                let start = self.position();
                let data: &'a [u8] = *self.cursor.get_ref();
                let content = &data[start..start + len];
                self.cursor.set_position((start + len) as u64);
                if constructed {
                    let children = read_children(content, tag, depth)?;
                    Ok(Some(BerValue::constructed(tag, children)))
                } else {
                    Ok(Some(BerValue::primitive(tag, content)))
                }
            }
            Length::Indefinite => {
                let mut children = Vec::new();
                loop {
                    if self.remaining() < 2 {
                        return Ok(None);
                    }
                    let pos = self.position();
                    if self.cursor.get_ref()[pos..pos + 2] == [0x00, 0x00] {
                        self.cursor.set_position((pos + 2) as u64);
                        break;
                    }
                    match self.read_value(depth + 1)? {
                        Some(child) => children.push(child),
                        None => return Ok(None),
                    }
                }
                Ok(Some(BerValue::constructed(tag, children)))
            }
        }
    }
}

/// Children of a definite-length parent must fill its content exactly.
fn read_children(content: &[u8], parent: Tag, depth: usize) -> Result<Vec<BerValue>> {
    let mut reader = BerReader::new(content);
    let mut children = Vec::new();
    while reader.remaining() > 0 {
        let start = reader.position();
        match reader.read_value(depth + 1)? {
            Some(child) => children.push(child),
            None => {
                let child = match BerReader::new(&content[start..]).read_tag() {
                    Ok(Some((tag, _))) => tag.to_string(),
                    _ => "with a truncated tag".to_string(),
                };
                return Err(LdapError::structural(format!(
                    "{}: child {} at offset {} overruns the declared length {}",
                    parent,
                    child,
                    start,
                    content.len()
                )));
            }
        }
    }
    Ok(children)
}

pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: Tag, constructed: bool) {
        let mut first = tag.class.bits() << 6;
        if constructed {
            first |= 0x20;
        }
        if tag.number < 0x1F {
            self.buffer.push(first | tag.number as u8);
            return;
        }
        self.buffer.push(first | 0x1F);
        let mut groups = Vec::new();
        let mut n = tag.number;
        loop {
            groups.push((n & 0x7F) as u8);
            n >>= 7;
            if n == 0 {
                break;
            }
        }
        groups.reverse();
        let last = groups.len() - 1;
        for (i, g) in groups.iter().enumerate() {
            self.buffer.push(if i < last { g | 0x80 } else { *g });
        }
    }

    pub fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_value(&mut self, value: &BerValue) {
        match &value.payload {
            Payload::Primitive(bytes) => {
                self.write_tag(value.tag, false);
                self.write_length(bytes.len());
                self.buffer.extend_from_slice(bytes);
            }
            Payload::Constructed(children) => {
                let mut inner = BerWriter::new();
                for child in children {
                    inner.write_value(child);
                }
                self.write_tag(value.tag, true);
                self.write_length(inner.buffer.len());
                self.buffer.extend_from_slice(&inner.buffer);
            }
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}
