//! SASL mechanisms, the mechanism registry and the post-bind security layer.
//!
//! A mechanism is a pluggable collaborator: it produces credential blobs for
//! each bind round and may offer a security layer once negotiation is complete.
//! Each round yields a new [`SaslContext`] value; nothing is mutated in place.

use crate::error::{LdapError, Result};
use crate::queue::MessageWrapper;
use std::collections::BTreeMap;
use tracing::debug;

/// Caller-supplied options (`username`, `password`, `authzid`, `trace`, ...).
pub type SaslOptions = BTreeMap<String, String>;

/// Largest protected buffer accepted inside one security layer frame (RFC 4422 3.7).
pub const MAX_SASL_BUFFER: usize = 0x00FF_FFFF;

/// Negotiation state after one round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaslContext {
    pub mechanism: String,
    /// Credentials to send in the next bind request.
    pub response: Option<Vec<u8>>,
    /// Credentials the server sent in the last bind response.
    pub server_data: Option<Vec<u8>>,
    pub is_complete: bool,
    /// A confidentiality/integrity layer was negotiated.
    pub has_security_layer: bool,
}

impl SaslContext {
    pub fn new(mechanism: impl Into<String>) -> Self {
        Self {
            mechanism: mechanism.into(),
            ..Self::default()
        }
    }

    pub fn responding(self, response: Option<Vec<u8>>) -> Self {
        Self { response, ..self }
    }

    pub fn with_server_data(self, server_data: Option<&[u8]>) -> Self {
        Self {
            server_data: server_data.map(<[u8]>::to_vec),
            ..self
        }
    }

    pub fn completed(self) -> Self {
        Self {
            is_complete: true,
            ..self
        }
    }

    pub fn with_security_layer(self) -> Self {
        Self {
            has_security_layer: true,
            ..self
        }
    }
}

pub trait Mechanism: Send {
    fn name(&self) -> &str;

    /// First round. `response` of the returned context is the initial credential blob, if any.
    fn initial_response(&mut self, options: &SaslOptions) -> Result<SaslContext>;

    /// Feed the server's credentials from the last bind response.
    fn challenge(&mut self, server_data: Option<&[u8]>, options: &SaslOptions) -> Result<SaslContext>;

    /// Options that must be present for this mechanism to be selectable.
    fn required_options(&self) -> &'static [&'static str] {
        &[]
    }

    fn provides_security_layer(&self) -> bool {
        false
    }

    /// Transform bound to the completed negotiation; `None` when the mechanism has none.
    fn security_layer(&self) -> Option<Box<dyn SecurityLayer>> {
        None
    }
}

/// Per-buffer protection negotiated by a mechanism.
pub trait SecurityLayer: Send {
    fn wrap(&mut self, data: &[u8], context: &SaslContext) -> Result<Vec<u8>>;
    fn unwrap(&mut self, data: &[u8], context: &SaslContext) -> Result<Vec<u8>>;
}

/// Security layer framing on the queue: each protected buffer is preceded by
/// a four-octet big-endian length.
pub struct SaslMessageWrapper {
    layer: Box<dyn SecurityLayer>,
    context: SaslContext,
}

impl SaslMessageWrapper {
    pub fn new(layer: Box<dyn SecurityLayer>, context: SaslContext) -> Self {
        Self { layer, context }
    }
}

impl MessageWrapper for SaslMessageWrapper {
    fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let protected = self.layer.wrap(message, &self.context)?;
        if protected.len() > MAX_SASL_BUFFER {
            return Err(LdapError::sasl(format!(
                "protected buffer of {} octets exceeds {}",
                protected.len(),
                MAX_SASL_BUFFER
            )));
        }
        let mut framed = Vec::with_capacity(4 + protected.len());
        framed.extend_from_slice(&(protected.len() as u32).to_be_bytes());
        framed.extend_from_slice(&protected);
        Ok(framed)
    }

    fn unwrap(&mut self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length > MAX_SASL_BUFFER {
            return Err(LdapError::structural(format!(
                "SASL frame of {} octets exceeds {}",
                length, MAX_SASL_BUFFER
            )));
        }
        if data.len() < 4 + length {
            return Ok(None);
        }
        let plain = self.layer.unwrap(&data[4..4 + length], &self.context)?;
        Ok(Some((plain, 4 + length)))
    }
}

/// Picks one mechanism out of those both sides support.
pub trait MechanismSelector: Send + Sync {
    fn select(
        &self,
        candidates: Vec<Box<dyn Mechanism>>,
        options: &SaslOptions,
    ) -> Option<Box<dyn Mechanism>>;
}

/// Listed names first, in order, then the remaining candidates in
/// registration order. Mechanisms missing a required option are skipped.
#[derive(Debug, Clone, Default)]
pub struct PreferenceOrder {
    preference: Vec<String>,
}

impl PreferenceOrder {
    pub fn new(preference: Vec<String>) -> Self {
        Self { preference }
    }

    fn rank(&self, name: &str) -> usize {
        self.preference
            .iter()
            .position(|p| p.eq_ignore_ascii_case(name))
            .unwrap_or(self.preference.len())
    }
}

impl MechanismSelector for PreferenceOrder {
    fn select(
        &self,
        mut candidates: Vec<Box<dyn Mechanism>>,
        options: &SaslOptions,
    ) -> Option<Box<dyn Mechanism>> {
        // Stable sort keeps registration order among equal ranks.
        candidates.sort_by_key(|m| self.rank(m.name()));
        candidates.into_iter().find(|m| {
            let usable = m
                .required_options()
                .iter()
                .all(|key| options.contains_key(*key));
            if !usable {
                debug!("Skipping SASL mechanism {}: missing required options", m.name());
            }
            usable
        })
    }
}

pub type MechanismFactory = Box<dyn Fn() -> Box<dyn Mechanism> + Send + Sync>;

/// Registry of locally available mechanisms, looked up case-insensitively.
pub struct Sasl {
    factories: Vec<(String, MechanismFactory)>,
    selector: Box<dyn MechanismSelector>,
}

impl Default for Sasl {
    fn default() -> Self {
        Self::new()
    }
}

impl Sasl {
    /// Registry with the built-in PLAIN, EXTERNAL and ANONYMOUS mechanisms.
    pub fn new() -> Self {
        let mut sasl = Self::empty();
        sasl.register(PlainMechanism::NAME, || Box::new(PlainMechanism));
        sasl.register(ExternalMechanism::NAME, || Box::new(ExternalMechanism));
        sasl.register(AnonymousMechanism::NAME, || Box::new(AnonymousMechanism));
        sasl
    }

    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
            selector: Box::new(PreferenceOrder::default()),
        }
    }

    pub fn with_selector(mut self, selector: Box<dyn MechanismSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Register a mechanism. A later registration under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Mechanism> + Send + Sync + 'static,
    {
        let name = name.to_ascii_uppercase();
        self.factories.retain(|(existing, _)| *existing != name);
        self.factories.push((name, Box::new(factory)));
    }

    pub fn supports(&self, name: &str) -> bool {
        self.factories
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    pub fn mechanisms(&self) -> Vec<&str> {
        self.factories.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Result<Box<dyn Mechanism>> {
        self.factories
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, factory)| factory())
            .ok_or_else(|| LdapError::sasl(format!("mechanism {} is not supported", name)))
    }

    /// Choose among the `advertised` mechanisms that are also registered here.
    pub fn select(&self, advertised: &[String], options: &SaslOptions) -> Result<Box<dyn Mechanism>> {
        let candidates: Vec<Box<dyn Mechanism>> = self
            .factories
            .iter()
            .filter(|(name, _)| advertised.iter().any(|a| a.eq_ignore_ascii_case(name)))
            .map(|(_, factory)| factory())
            .collect();
        if candidates.is_empty() {
            return Err(LdapError::sasl(format!(
                "no supported mechanism among those advertised by the server: [{}]",
                advertised.join(", ")
            )));
        }
        self.selector.select(candidates, options).ok_or_else(|| {
            LdapError::sasl("no advertised mechanism can be used with the supplied options")
        })
    }
}

fn option<'a>(options: &'a SaslOptions, key: &str) -> Result<&'a str> {
    options
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| LdapError::sasl(format!("option {} is required", key)))
}

/// RFC 4616: `[authzid] NUL authcid NUL passwd` in the initial response.
#[derive(Debug, Default)]
pub struct PlainMechanism;

impl PlainMechanism {
    pub const NAME: &'static str = "PLAIN";
}

impl Mechanism for PlainMechanism {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_response(&mut self, options: &SaslOptions) -> Result<SaslContext> {
        let username = option(options, "username")?;
        let password = option(options, "password")?;
        let authzid = options.get("authzid").map(String::as_str).unwrap_or("");
        let mut message = Vec::with_capacity(authzid.len() + username.len() + password.len() + 2);
        message.extend_from_slice(authzid.as_bytes());
        message.push(0);
        message.extend_from_slice(username.as_bytes());
        message.push(0);
        message.extend_from_slice(password.as_bytes());
        Ok(SaslContext::new(Self::NAME).responding(Some(message)).completed())
    }

    fn challenge(&mut self, server_data: Option<&[u8]>, _options: &SaslOptions) -> Result<SaslContext> {
        if server_data.map(|d| !d.is_empty()).unwrap_or(false) {
            return Err(LdapError::sasl("PLAIN does not expect server challenges"));
        }
        Ok(SaslContext::new(Self::NAME).with_server_data(server_data).completed())
    }

    fn required_options(&self) -> &'static [&'static str] {
        &["username", "password"]
    }
}

/// RFC 4422 Appendix A: credentials established outside SASL (e.g. a TLS client certificate).
#[derive(Debug, Default)]
pub struct ExternalMechanism;

impl ExternalMechanism {
    pub const NAME: &'static str = "EXTERNAL";
}

impl Mechanism for ExternalMechanism {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_response(&mut self, options: &SaslOptions) -> Result<SaslContext> {
        let response = options.get("authzid").map(|a| a.as_bytes().to_vec());
        Ok(SaslContext::new(Self::NAME).responding(response).completed())
    }

    fn challenge(&mut self, server_data: Option<&[u8]>, _options: &SaslOptions) -> Result<SaslContext> {
        Ok(SaslContext::new(Self::NAME)
            .with_server_data(server_data)
            .responding(Some(Vec::new()))
            .completed())
    }
}

/// RFC 4505: optional trace information, no authentication.
#[derive(Debug, Default)]
pub struct AnonymousMechanism;

impl AnonymousMechanism {
    pub const NAME: &'static str = "ANONYMOUS";
}

impl Mechanism for AnonymousMechanism {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_response(&mut self, options: &SaslOptions) -> Result<SaslContext> {
        let trace = options.get("trace").cloned().unwrap_or_default();
        Ok(SaslContext::new(Self::NAME)
            .responding(Some(trace.into_bytes()))
            .completed())
    }

    fn challenge(&mut self, server_data: Option<&[u8]>, _options: &SaslOptions) -> Result<SaslContext> {
        Ok(SaslContext::new(Self::NAME).with_server_data(server_data).completed())
    }
}
