//! LDAP value kinds layered on the BER primitives: directory strings,
//! numeric object identifiers and distinguished names.

use crate::ber::{BerValue, Tag};
use crate::error::{LdapError, Result};
use std::fmt;

/// LDAPString: UTF-8 in an OCTET STRING (or an implicitly tagged one).
pub fn ldap_string(value: &str) -> BerValue {
    BerValue::octet_string(value.as_bytes().to_vec())
}

/// Same as [`ldap_string`] under an implicit context tag.
pub fn context_string(number: u32, value: &str) -> BerValue {
    BerValue::primitive(Tag::context(number), value.as_bytes().to_vec())
}

pub fn read_string(value: &BerValue) -> Result<String> {
    let bytes = value.bytes()?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| LdapError::structural(format!("{}: invalid UTF-8 string", value.tag)))
}

/// Numeric object identifier (`numericoid` of RFC 4512), e.g. `1.3.6.1.4.1.1466.20037`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    pub fn parse(value: &str) -> Result<Self> {
        let mut arcs = 0;
        for arc in value.split('.') {
            let valid = !arc.is_empty()
                && arc.bytes().all(|b| b.is_ascii_digit())
                && (arc == "0" || !arc.starts_with('0'));
            if !valid {
                return Err(LdapError::structural(format!(
                    "invalid object identifier: {:?}",
                    value
                )));
            }
            arcs += 1;
        }
        if arcs < 2 {
            return Err(LdapError::structural(format!(
                "object identifier needs at least two arcs: {:?}",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// For the well-known OID constants, which are known to be valid.
    pub(crate) fn well_known(value: &'static str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_ber(&self) -> BerValue {
        ldap_string(&self.0)
    }

    pub fn from_ber(value: &BerValue) -> Result<Self> {
        Self::parse(&read_string(value)?)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Oid {
    type Error = LdapError;
    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

/// Distinguished name as sent on the wire (LDAPDN). The empty DN names the root DSE.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Dn(String);

impl Dn {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative distinguished names, left to right. Escaped commas (`\,`) stay inside their RDN.
    pub fn rdns(&self) -> Vec<&str> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let bytes = self.0.as_bytes();
        let mut parts = Vec::new();
        let mut start = 0;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' => escaped = true,
                b',' => {
                    parts.push(self.0[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            }
        }
        parts.push(self.0[start..].trim());
        parts
    }

    pub fn to_ber(&self) -> BerValue {
        ldap_string(&self.0)
    }

    pub fn from_ber(value: &BerValue) -> Result<Self> {
        read_string(value).map(Self)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dn {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Dn {
    fn from(value: String) -> Self {
        Self(value)
    }
}
