// LDAP message envelope and operation dispatch (RFC 4511 section 4).
// Every operation is one variant of ProtocolOp, selected by its APPLICATION tag number.

use crate::ber::{self, universal, BerValue, Tag, TagClass};
use crate::error::{LdapError, Result};
use crate::value::{context_string, ldap_string, read_string, Dn, Oid};

/// LDAP result codes used by the engine (RFC 4511 Appendix A).
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const OPERATIONS_ERROR: i32 = 1;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const TIME_LIMIT_EXCEEDED: i32 = 3;
    pub const SIZE_LIMIT_EXCEEDED: i32 = 4;
    pub const COMPARE_FALSE: i32 = 5;
    pub const COMPARE_TRUE: i32 = 6;
    pub const AUTH_METHOD_NOT_SUPPORTED: i32 = 7;
    pub const STRONGER_AUTH_REQUIRED: i32 = 8;
    pub const REFERRAL: i32 = 10;
    pub const CONFIDENTIALITY_REQUIRED: i32 = 13;
    pub const SASL_BIND_IN_PROGRESS: i32 = 14;
    pub const NO_SUCH_OBJECT: i32 = 32;
    pub const INAPPROPRIATE_AUTHENTICATION: i32 = 48;
    pub const INVALID_CREDENTIALS: i32 = 49;
    pub const INSUFFICIENT_ACCESS_RIGHTS: i32 = 50;
    pub const BUSY: i32 = 51;
    pub const UNAVAILABLE: i32 = 52;
    pub const UNWILLING_TO_PERFORM: i32 = 53;
    pub const OTHER: i32 = 80;
}

/// StartTLS extended operation (RFC 4511 4.14).
pub const OID_START_TLS: &str = "1.3.6.1.4.1.1466.20037";
/// Who Am I extended operation (RFC 4532).
pub const OID_WHOAMI: &str = "1.3.6.1.4.1.4203.1.11.3";
/// Cancel extended operation (RFC 3909).
pub const OID_CANCEL: &str = "1.3.6.1.1.8";
/// Password Modify extended operation (RFC 3062).
pub const OID_PWD_MODIFY: &str = "1.3.6.1.4.1.4203.1.11.1";
/// Notice of Disconnection unsolicited notification (RFC 4511 4.4.1).
pub const OID_NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";

// LDAP protocol APPLICATION tag numbers
pub const LDAP_TAG_BIND_REQUEST: u32 = 0;
pub const LDAP_TAG_BIND_RESPONSE: u32 = 1;
pub const LDAP_TAG_UNBIND_REQUEST: u32 = 2;
pub const LDAP_TAG_SEARCH_REQUEST: u32 = 3;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u32 = 4;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u32 = 5;
pub const LDAP_TAG_MODIFY_REQUEST: u32 = 6;
pub const LDAP_TAG_MODIFY_RESPONSE: u32 = 7;
pub const LDAP_TAG_ADD_REQUEST: u32 = 8;
pub const LDAP_TAG_ADD_RESPONSE: u32 = 9;
pub const LDAP_TAG_DEL_REQUEST: u32 = 10;
pub const LDAP_TAG_DEL_RESPONSE: u32 = 11;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u32 = 12;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u32 = 13;
pub const LDAP_TAG_COMPARE_REQUEST: u32 = 14;
pub const LDAP_TAG_COMPARE_RESPONSE: u32 = 15;
pub const LDAP_TAG_ABANDON_REQUEST: u32 = 16;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u32 = 19;
pub const LDAP_TAG_EXTENDED_REQUEST: u32 = 23;
pub const LDAP_TAG_EXTENDED_RESPONSE: u32 = 24;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u32 = 25;

/// Context [0] IMPLICIT SEQUENCE OF Control
const LDAP_CONTEXT_CONTROLS: u32 = 0;

const MAX_MESSAGE_ID: i64 = i32::MAX as i64;

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: Oid,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: Oid, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid,
            critical,
            value,
        }
    }
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: u32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: u32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    pub fn to_ber(&self) -> BerValue {
        let mut children = vec![
            BerValue::integer(self.message_id as i64),
            self.protocol_op.to_ber(),
        ];
        if !self.controls.is_empty() {
            children.push(encode_controls(&self.controls));
        }
        BerValue::sequence(children)
    }

    pub fn from_ber(value: BerValue) -> Result<Self> {
        if !value.is(Tag::universal(universal::SEQUENCE)) {
            return Err(LdapError::structural(format!(
                "LDAP message must be a SEQUENCE, got {}",
                value.tag
            )));
        }
        let children = value.into_children()?;
        if children.len() != 2 && children.len() != 3 {
            return Err(LdapError::structural(format!(
                "LDAP message must have 2 or 3 elements, got {}",
                children.len()
            )));
        }
        let mut fields = Fields::new("LDAP message", children);
        let message_id = parse_message_id(&fields.expect(Tag::universal(universal::INTEGER), "messageID")?)?;
        let protocol_op = ProtocolOp::from_ber(fields.next("protocolOp")?)?;
        let controls = match fields.optional(Tag::context(LDAP_CONTEXT_CONTROLS)) {
            Some(value) => parse_controls(value)?,
            None => Vec::new(),
        };
        fields.finish()?;
        Ok(Self {
            message_id,
            protocol_op,
            controls,
        })
    }
}

pub fn encode_ldap_message(message: &LdapMessage) -> Vec<u8> {
    ber::encode(&message.to_ber())
}

/// Parse exactly one complete message.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    match try_parse_message(data)? {
        Some((message, used)) if used == data.len() => Ok(message),
        Some((_, used)) => Err(LdapError::structural(format!(
            "{} trailing octets after LDAP message",
            data.len() - used
        ))),
        None => Err(LdapError::structural("truncated LDAP message")),
    }
}

/// Parse the first message in `data`. `Ok(None)` when more bytes are needed.
pub fn try_parse_message(data: &[u8]) -> Result<Option<(LdapMessage, usize)>> {
    match ber::decode(data)? {
        Some((value, used)) => Ok(Some((LdapMessage::from_ber(value)?, used))),
        None => Ok(None),
    }
}

fn parse_message_id(value: &BerValue) -> Result<u32> {
    let id = value.as_integer()?;
    if !(0..=MAX_MESSAGE_ID).contains(&id) {
        return Err(LdapError::structural(format!(
            "message ID {} outside 0..={}",
            id, MAX_MESSAGE_ID
        )));
    }
    Ok(id as u32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(u32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    pub fn tag_number(&self) -> u32 {
        match self {
            ProtocolOp::BindRequest(_) => LDAP_TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => LDAP_TAG_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => LDAP_TAG_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => LDAP_TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => LDAP_TAG_SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => LDAP_TAG_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => LDAP_TAG_MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => LDAP_TAG_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => LDAP_TAG_ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => LDAP_TAG_DEL_REQUEST,
            ProtocolOp::DelResponse(_) => LDAP_TAG_DEL_RESPONSE,
            ProtocolOp::ModifyDNRequest(_) => LDAP_TAG_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDNResponse(_) => LDAP_TAG_MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => LDAP_TAG_COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => LDAP_TAG_COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => LDAP_TAG_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => LDAP_TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => LDAP_TAG_EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => LDAP_TAG_INTERMEDIATE_RESPONSE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BindRequest",
            ProtocolOp::BindResponse(_) => "BindResponse",
            ProtocolOp::UnbindRequest => "UnbindRequest",
            ProtocolOp::SearchRequest(_) => "SearchRequest",
            ProtocolOp::SearchResultEntry(_) => "SearchResultEntry",
            ProtocolOp::SearchResultReference(_) => "SearchResultReference",
            ProtocolOp::SearchResultDone(_) => "SearchResultDone",
            ProtocolOp::ModifyRequest(_) => "ModifyRequest",
            ProtocolOp::ModifyResponse(_) => "ModifyResponse",
            ProtocolOp::AddRequest(_) => "AddRequest",
            ProtocolOp::AddResponse(_) => "AddResponse",
            ProtocolOp::DelRequest(_) => "DelRequest",
            ProtocolOp::DelResponse(_) => "DelResponse",
            ProtocolOp::ModifyDNRequest(_) => "ModifyDNRequest",
            ProtocolOp::ModifyDNResponse(_) => "ModifyDNResponse",
            ProtocolOp::CompareRequest(_) => "CompareRequest",
            ProtocolOp::CompareResponse(_) => "CompareResponse",
            ProtocolOp::AbandonRequest(_) => "AbandonRequest",
            ProtocolOp::ExtendedRequest(_) => "ExtendedRequest",
            ProtocolOp::ExtendedResponse(_) => "ExtendedResponse",
            ProtocolOp::IntermediateResponse(_) => "IntermediateResponse",
        }
    }

    /// The last response a server sends for a request. Search entries,
    /// references and intermediate responses are not final.
    pub fn is_final_response(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindResponse(_)
                | ProtocolOp::SearchResultDone(_)
                | ProtocolOp::ModifyResponse(_)
                | ProtocolOp::AddResponse(_)
                | ProtocolOp::DelResponse(_)
                | ProtocolOp::ModifyDNResponse(_)
                | ProtocolOp::CompareResponse(_)
                | ProtocolOp::ExtendedResponse(_)
        )
    }

    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDNResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            _ => None,
        }
    }

    pub fn to_ber(&self) -> BerValue {
        let tag = Tag::application(self.tag_number());
        match self {
            ProtocolOp::BindRequest(req) => BerValue::constructed(tag, encode_bind_request(req)),
            ProtocolOp::BindResponse(resp) => {
                let mut children = encode_ldap_result(&resp.result);
                if let Some(ref creds) = resp.server_sasl_creds {
                    children.push(BerValue::primitive(Tag::context(7), creds.clone()));
                }
                BerValue::constructed(tag, children)
            }
            ProtocolOp::UnbindRequest => BerValue::primitive(tag, Vec::new()),
            ProtocolOp::SearchRequest(req) => BerValue::constructed(tag, encode_search_request(req)),
            ProtocolOp::SearchResultEntry(entry) => BerValue::constructed(
                tag,
                vec![
                    entry.object_name.to_ber(),
                    BerValue::sequence(entry.attributes.iter().map(encode_attribute).collect()),
                ],
            ),
            ProtocolOp::SearchResultReference(uris) => {
                BerValue::constructed(tag, uris.iter().map(|u| ldap_string(u)).collect())
            }
            ProtocolOp::SearchResultDone(result)
            | ProtocolOp::ModifyResponse(result)
            | ProtocolOp::AddResponse(result)
            | ProtocolOp::DelResponse(result)
            | ProtocolOp::ModifyDNResponse(result)
            | ProtocolOp::CompareResponse(result) => {
                BerValue::constructed(tag, encode_ldap_result(result))
            }
            ProtocolOp::ModifyRequest(req) => BerValue::constructed(
                tag,
                vec![
                    req.object.to_ber(),
                    BerValue::sequence(
                        req.changes
                            .iter()
                            .map(|change| {
                                BerValue::sequence(vec![
                                    BerValue::enumerated(change.operation as i64),
                                    encode_attribute(&change.modification),
                                ])
                            })
                            .collect(),
                    ),
                ],
            ),
            ProtocolOp::AddRequest(req) => BerValue::constructed(
                tag,
                vec![
                    req.entry.to_ber(),
                    BerValue::sequence(req.attributes.iter().map(encode_attribute).collect()),
                ],
            ),
            ProtocolOp::DelRequest(req) => BerValue::primitive(tag, req.entry.as_str().as_bytes().to_vec()),
            ProtocolOp::ModifyDNRequest(req) => {
                let mut children = vec![
                    req.entry.to_ber(),
                    ldap_string(&req.newrdn),
                    BerValue::boolean(req.delete_old_rdn),
                ];
                if let Some(ref superior) = req.new_superior {
                    children.push(context_string(0, superior.as_str()));
                }
                BerValue::constructed(tag, children)
            }
            ProtocolOp::CompareRequest(req) => BerValue::constructed(
                tag,
                vec![
                    req.entry.to_ber(),
                    BerValue::sequence(vec![
                        ldap_string(&req.attr),
                        BerValue::octet_string(req.assertion_value.clone()),
                    ]),
                ],
            ),
            ProtocolOp::AbandonRequest(id) => BerValue::integer(*id as i64).retag(tag),
            ProtocolOp::ExtendedRequest(req) => {
                let mut children = vec![context_string(0, req.name.as_str())];
                if let Some(ref value) = req.value {
                    children.push(BerValue::primitive(Tag::context(1), value.clone()));
                }
                BerValue::constructed(tag, children)
            }
            ProtocolOp::ExtendedResponse(resp) => {
                let mut children = encode_ldap_result(&resp.result);
                if let Some(ref name) = resp.name {
                    children.push(context_string(10, name.as_str()));
                }
                if let Some(ref value) = resp.value {
                    children.push(BerValue::primitive(Tag::context(11), value.clone()));
                }
                BerValue::constructed(tag, children)
            }
            ProtocolOp::IntermediateResponse(resp) => {
                let mut children = Vec::new();
                if let Some(ref name) = resp.name {
                    children.push(context_string(0, name.as_str()));
                }
                if let Some(ref value) = resp.value {
                    children.push(BerValue::primitive(Tag::context(1), value.clone()));
                }
                BerValue::constructed(tag, children)
            }
        }
    }

    pub fn from_ber(value: BerValue) -> Result<Self> {
        if value.tag.class != TagClass::Application {
            return Err(LdapError::structural(format!(
                "protocol operation must use the APPLICATION class, got {}",
                value.tag
            )));
        }
        let op = match value.tag.number {
            LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(value)?),
            LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(value)?),
            LDAP_TAG_UNBIND_REQUEST => {
                value.bytes()?;
                ProtocolOp::UnbindRequest
            }
            LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(value)?),
            LDAP_TAG_SEARCH_RESULT_ENTRY => {
                ProtocolOp::SearchResultEntry(parse_search_result_entry(value)?)
            }
            LDAP_TAG_SEARCH_RESULT_REFERENCE => {
                ProtocolOp::SearchResultReference(parse_search_result_reference(value)?)
            }
            LDAP_TAG_SEARCH_RESULT_DONE => {
                ProtocolOp::SearchResultDone(parse_ldap_result("SearchResultDone", value)?)
            }
            LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(value)?),
            LDAP_TAG_MODIFY_RESPONSE => {
                ProtocolOp::ModifyResponse(parse_ldap_result("ModifyResponse", value)?)
            }
            LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(value)?),
            LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_ldap_result("AddResponse", value)?),
            LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(parse_del_request(value)?),
            LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_ldap_result("DelResponse", value)?),
            LDAP_TAG_MODIFY_DN_REQUEST => {
                ProtocolOp::ModifyDNRequest(parse_modify_dn_request(value)?)
            }
            LDAP_TAG_MODIFY_DN_RESPONSE => {
                ProtocolOp::ModifyDNResponse(parse_ldap_result("ModifyDNResponse", value)?)
            }
            LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(value)?),
            LDAP_TAG_COMPARE_RESPONSE => {
                ProtocolOp::CompareResponse(parse_ldap_result("CompareResponse", value)?)
            }
            LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(parse_message_id(&value)?),
            LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(value)?),
            LDAP_TAG_EXTENDED_RESPONSE => {
                ProtocolOp::ExtendedResponse(parse_extended_response(value)?)
            }
            LDAP_TAG_INTERMEDIATE_RESPONSE => {
                ProtocolOp::IntermediateResponse(parse_intermediate_response(value)?)
            }
            other => {
                return Err(LdapError::structural(format!(
                    "unsupported LDAP operation tag [APPLICATION {}]",
                    other
                )))
            }
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: Dn,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(result_code: i32, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: Dn::root(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(result_code::SUCCESS, "")
    }

    pub fn is_success(&self) -> bool {
        self.result_code == result_code::SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: Dn,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: 3,
            name: Dn::root(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: Dn,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    /// Filter element, carried as-is.
    pub filter: BerValue,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Base-scope read of the root DSE with `(objectClass=*)`.
    pub fn root_dse(attributes: Vec<String>) -> Self {
        Self {
            base_object: Dn::root(),
            scope: SearchScope::BaseObject,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: present_filter("objectClass"),
            attributes,
        }
    }
}

/// Filter `present [7] AttributeDescription`.
pub fn present_filter(attribute: &str) -> BerValue {
    context_string(7, attribute)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = LdapError;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::structural(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: Dn,
    pub attributes: Vec<Attribute>,
}

impl SearchResultEntry {
    /// Values of `name` (case-insensitive) as UTF-8 strings.
    pub fn values(&self, name: &str) -> Option<Vec<String>> {
        self.attributes
            .iter()
            .find(|a| a.attr_type.eq_ignore_ascii_case(name))
            .map(|a| {
                a.attr_values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect()
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: Dn,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: Dn,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: Dn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: Dn,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<Dn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: Dn,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: Oid,
    pub value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(name: Oid, value: Option<Vec<u8>>) -> Self {
        Self { name, value }
    }

    /// Request whose value is itself a BER encoding.
    pub fn with_encoded_value(name: Oid, value: &BerValue) -> Self {
        Self::new(name, Some(ber::encode(value)))
    }

    pub fn decoded_value(&self) -> Result<Option<BerValue>> {
        decode_nested(self.value.as_deref())
    }

    pub fn start_tls() -> Self {
        Self::new(Oid::well_known(OID_START_TLS), None)
    }

    pub fn whoami() -> Self {
        Self::new(Oid::well_known(OID_WHOAMI), None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<Oid>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn decoded_value(&self) -> Result<Option<BerValue>> {
        decode_nested(self.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntermediateResponse {
    pub name: Option<Oid>,
    pub value: Option<Vec<u8>>,
}

impl IntermediateResponse {
    pub fn decoded_value(&self) -> Result<Option<BerValue>> {
        decode_nested(self.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

fn decode_nested(value: Option<&[u8]>) -> Result<Option<BerValue>> {
    let Some(bytes) = value else {
        return Ok(None);
    };
    match ber::decode(bytes)? {
        Some((inner, used)) if used == bytes.len() => Ok(Some(inner)),
        Some(_) => Err(LdapError::structural("trailing octets after nested value")),
        None => Err(LdapError::structural("truncated nested value")),
    }
}

/// Sequential reader over the children of one constructed element.
struct Fields {
    element: &'static str,
    items: std::iter::Peekable<std::vec::IntoIter<BerValue>>,
}

impl Fields {
    fn new(element: &'static str, children: Vec<BerValue>) -> Self {
        Self {
            element,
            items: children.into_iter().peekable(),
        }
    }

    fn of(element: &'static str, value: BerValue) -> Result<Self> {
        Ok(Self::new(element, value.into_children()?))
    }

    fn next(&mut self, what: &str) -> Result<BerValue> {
        self.items.next().ok_or_else(|| {
            LdapError::structural(format!("{}: missing mandatory {}", self.element, what))
        })
    }

    fn expect(&mut self, tag: Tag, what: &str) -> Result<BerValue> {
        let value = self.next(what)?;
        if !value.is(tag) {
            return Err(LdapError::structural(format!(
                "{}: {} must be {}, got {}",
                self.element, what, tag, value.tag
            )));
        }
        Ok(value)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        read_string(&self.expect(Tag::universal(universal::OCTET_STRING), what)?)
    }

    fn dn(&mut self, what: &str) -> Result<Dn> {
        self.string(what).map(Dn::from)
    }

    fn optional(&mut self, tag: Tag) -> Option<BerValue> {
        if self.items.peek().map(|v| v.is(tag)).unwrap_or(false) {
            self.items.next()
        } else {
            None
        }
    }

    fn finish(mut self) -> Result<()> {
        match self.items.next() {
            None => Ok(()),
            Some(extra) => Err(LdapError::structural(format!(
                "{}: unexpected element {}",
                self.element, extra.tag
            ))),
        }
    }
}

fn encode_controls(controls: &[Control]) -> BerValue {
    let items = controls
        .iter()
        .map(|control| {
            let mut children = vec![control.oid.to_ber()];
            if control.critical {
                children.push(BerValue::boolean(true));
            }
            if let Some(ref value) = control.value {
                children.push(BerValue::octet_string(value.clone()));
            }
            BerValue::sequence(children)
        })
        .collect();
    BerValue::constructed(Tag::context(LDAP_CONTEXT_CONTROLS), items)
}

/// Control ::= SEQUENCE { controlType, criticality BOOLEAN DEFAULT FALSE, controlValue OCTET STRING OPTIONAL }
fn parse_controls(value: BerValue) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    for item in value.into_children()? {
        if !item.is(Tag::universal(universal::SEQUENCE)) {
            return Err(LdapError::structural(format!(
                "Control must be a SEQUENCE, got {}",
                item.tag
            )));
        }
        let mut fields = Fields::of("Control", item)?;
        let oid = Oid::from_ber(&fields.expect(Tag::universal(universal::OCTET_STRING), "controlType")?)?;
        let critical = match fields.optional(Tag::universal(universal::BOOLEAN)) {
            Some(b) => b.as_bool()?,
            None => false,
        };
        let value = fields
            .optional(Tag::universal(universal::OCTET_STRING))
            .map(BerValue::into_bytes)
            .transpose()?;
        fields.finish()?;
        controls.push(Control {
            oid,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn encode_ldap_result(result: &LdapResult) -> Vec<BerValue> {
    let mut children = vec![
        BerValue::enumerated(result.result_code as i64),
        result.matched_dn.to_ber(),
        ldap_string(&result.diagnostic_message),
    ];
    if !result.referrals.is_empty() {
        children.push(BerValue::constructed(
            Tag::context(3),
            result.referrals.iter().map(|r| ldap_string(r)).collect(),
        ));
    }
    children
}

fn read_ldap_result(fields: &mut Fields) -> Result<LdapResult> {
    let code = fields
        .expect(Tag::universal(universal::ENUMERATED), "resultCode")?
        .as_integer()?;
    let result_code = i32::try_from(code)
        .map_err(|_| LdapError::structural(format!("{}: result code {} out of range", fields.element, code)))?;
    let matched_dn = fields.dn("matchedDN")?;
    let diagnostic_message = fields.string("diagnosticMessage")?;
    let referrals = match fields.optional(Tag::context(3)) {
        Some(referral) => referral
            .children()?
            .iter()
            .map(read_string)
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_ldap_result(element: &'static str, value: BerValue) -> Result<LdapResult> {
    let mut fields = Fields::of(element, value)?;
    let result = read_ldap_result(&mut fields)?;
    fields.finish()?;
    Ok(result)
}

fn encode_bind_request(req: &BindRequest) -> Vec<BerValue> {
    let authentication = match &req.authentication {
        BindAuthentication::Simple(password) => BerValue::primitive(Tag::context(0), password.clone()),
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            let mut children = vec![ldap_string(mechanism)];
            if let Some(creds) = credentials {
                children.push(BerValue::octet_string(creds.clone()));
            }
            BerValue::constructed(Tag::context(3), children)
        }
    };
    vec![
        BerValue::integer(req.version as i64),
        req.name.to_ber(),
        authentication,
    ]
}

fn parse_bind_request(value: BerValue) -> Result<BindRequest> {
    let mut fields = Fields::of("BindRequest", value)?;
    let version = fields
        .expect(Tag::universal(universal::INTEGER), "version")?
        .as_integer()?;
    if !(1..=127).contains(&version) {
        return Err(LdapError::structural(format!("BindRequest: invalid version {}", version)));
    }
    let name = fields.dn("name")?;
    let auth = fields.next("authentication")?;
    let authentication = if auth.is(Tag::context(0)) {
        BindAuthentication::Simple(auth.into_bytes()?)
    } else if auth.is(Tag::context(3)) {
        let mut sasl = Fields::of("SaslCredentials", auth)?;
        let mechanism = sasl.string("mechanism")?;
        let credentials = sasl
            .optional(Tag::universal(universal::OCTET_STRING))
            .map(BerValue::into_bytes)
            .transpose()?;
        sasl.finish()?;
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        return Err(LdapError::structural(format!(
            "BindRequest: unsupported authentication choice {}",
            auth.tag
        )));
    };
    fields.finish()?;
    Ok(BindRequest {
        version: version as i32,
        name,
        authentication,
    })
}

fn parse_bind_response(value: BerValue) -> Result<BindResponse> {
    let mut fields = Fields::of("BindResponse", value)?;
    let result = read_ldap_result(&mut fields)?;
    let server_sasl_creds = fields
        .optional(Tag::context(7))
        .map(BerValue::into_bytes)
        .transpose()?;
    fields.finish()?;
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn encode_search_request(req: &SearchRequest) -> Vec<BerValue> {
    vec![
        req.base_object.to_ber(),
        BerValue::enumerated(req.scope as i64),
        BerValue::enumerated(req.deref_aliases as i64),
        BerValue::integer(req.size_limit as i64),
        BerValue::integer(req.time_limit as i64),
        BerValue::boolean(req.types_only),
        req.filter.clone(),
        BerValue::sequence(req.attributes.iter().map(|a| ldap_string(a)).collect()),
    ]
}

const MAX_INT: i64 = i32::MAX as i64;

/// Integer field constrained to `range`; anything else is a structural error.
fn bounded(value: &BerValue, what: &str, range: std::ops::RangeInclusive<i64>) -> Result<i32> {
    let n = value.as_integer()?;
    if !range.contains(&n) {
        return Err(LdapError::structural(format!(
            "{} {} outside {}..={}",
            what,
            n,
            range.start(),
            range.end()
        )));
    }
    i32::try_from(n).map_err(|_| LdapError::structural(format!("{} {} out of range", what, n)))
}

fn parse_search_request(value: BerValue) -> Result<SearchRequest> {
    let mut fields = Fields::of("SearchRequest", value)?;
    let base_object = fields.dn("baseObject")?;
    let scope = SearchScope::try_from(
        fields
            .expect(Tag::universal(universal::ENUMERATED), "scope")?
            .as_integer()?,
    )?;
    let deref_aliases = bounded(
        &fields.expect(Tag::universal(universal::ENUMERATED), "derefAliases")?,
        "SearchRequest: derefAliases",
        0..=3,
    )?;
    let size_limit = bounded(
        &fields.expect(Tag::universal(universal::INTEGER), "sizeLimit")?,
        "SearchRequest: sizeLimit",
        0..=MAX_INT,
    )?;
    let time_limit = bounded(
        &fields.expect(Tag::universal(universal::INTEGER), "timeLimit")?,
        "SearchRequest: timeLimit",
        0..=MAX_INT,
    )?;
    let types_only = fields
        .expect(Tag::universal(universal::BOOLEAN), "typesOnly")?
        .as_bool()?;
    let filter = fields.next("filter")?;
    if filter.tag.class != TagClass::Context {
        return Err(LdapError::structural(format!(
            "SearchRequest: filter must be context-tagged, got {}",
            filter.tag
        )));
    }
    let attributes = fields
        .expect(Tag::universal(universal::SEQUENCE), "attributes")?
        .children()?
        .iter()
        .map(read_string)
        .collect::<Result<Vec<_>>>()?;
    fields.finish()?;
    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_search_result_entry(value: BerValue) -> Result<SearchResultEntry> {
    let mut fields = Fields::of("SearchResultEntry", value)?;
    let object_name = fields.dn("objectName")?;
    let attributes = fields
        .expect(Tag::universal(universal::SEQUENCE), "attributes")?
        .into_children()?
        .into_iter()
        .map(parse_attribute)
        .collect::<Result<Vec<_>>>()?;
    fields.finish()?;
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_search_result_reference(value: BerValue) -> Result<Vec<String>> {
    let uris = value
        .children()?
        .iter()
        .map(read_string)
        .collect::<Result<Vec<_>>>()?;
    if uris.is_empty() {
        return Err(LdapError::structural("SearchResultReference: needs at least one URI"));
    }
    Ok(uris)
}

fn parse_modify_request(value: BerValue) -> Result<ModifyRequest> {
    let mut fields = Fields::of("ModifyRequest", value)?;
    let object = fields.dn("object")?;
    let mut changes = Vec::new();
    for change in fields
        .expect(Tag::universal(universal::SEQUENCE), "changes")?
        .into_children()?
    {
        let mut change_fields = Fields::of("ModifyRequest change", change)?;
        let operation = match change_fields
            .expect(Tag::universal(universal::ENUMERATED), "operation")?
            .as_integer()?
        {
            0 => ModifyOperation::Add,
            1 => ModifyOperation::Delete,
            2 => ModifyOperation::Replace,
            3 => ModifyOperation::Increment,
            other => {
                return Err(LdapError::structural(format!(
                    "ModifyRequest: invalid modify operation {}",
                    other
                )))
            }
        };
        let modification = parse_attribute(change_fields.next("modification")?)?;
        change_fields.finish()?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    fields.finish()?;
    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(value: BerValue) -> Result<AddRequest> {
    let mut fields = Fields::of("AddRequest", value)?;
    let entry = fields.dn("entry")?;
    let attributes = fields
        .expect(Tag::universal(universal::SEQUENCE), "attributes")?
        .into_children()?
        .into_iter()
        .map(parse_attribute)
        .collect::<Result<Vec<_>>>()?;
    fields.finish()?;
    Ok(AddRequest { entry, attributes })
}

/// DelRequest ::= [APPLICATION 10] LDAPDN
fn parse_del_request(value: BerValue) -> Result<DelRequest> {
    if value.is_constructed() {
        return Err(LdapError::structural(
            "DelRequest: must be a primitive octet string with an application tag",
        ));
    }
    Ok(DelRequest {
        entry: Dn::from_ber(&value)?,
    })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(value: BerValue) -> Result<ModifyDNRequest> {
    let mut fields = Fields::of("ModifyDNRequest", value)?;
    let entry = fields.dn("entry")?;
    let newrdn = fields.string("newrdn")?;
    let delete_old_rdn = fields
        .expect(Tag::universal(universal::BOOLEAN), "deleteoldrdn")?
        .as_bool()?;
    let new_superior = fields
        .optional(Tag::context(0))
        .map(|v| Dn::from_ber(&v))
        .transpose()?;
    fields.finish()?;
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(value: BerValue) -> Result<CompareRequest> {
    let mut fields = Fields::of("CompareRequest", value)?;
    let entry = fields.dn("entry")?;
    let mut ava = Fields::of(
        "AttributeValueAssertion",
        fields.expect(Tag::universal(universal::SEQUENCE), "ava")?,
    )?;
    let attr = ava.string("attributeDesc")?;
    let assertion_value = ava
        .expect(Tag::universal(universal::OCTET_STRING), "assertionValue")?
        .into_bytes()?;
    ava.finish()?;
    fields.finish()?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE { requestName [0] LDAPOID, requestValue [1] OCTET STRING OPTIONAL }
fn parse_extended_request(value: BerValue) -> Result<ExtendedRequest> {
    let children = value.into_children()?;
    if children.is_empty() || children.len() > 2 {
        return Err(LdapError::structural(format!(
            "ExtendedRequest: expected 1 or 2 elements, got {}",
            children.len()
        )));
    }
    let mut fields = Fields::new("ExtendedRequest", children);
    let name = Oid::from_ber(&fields.expect(Tag::context(0), "requestName")?)?;
    let value = fields
        .optional(Tag::context(1))
        .map(BerValue::into_bytes)
        .transpose()?;
    fields.finish()?;
    Ok(ExtendedRequest { name, value })
}

fn parse_extended_response(value: BerValue) -> Result<ExtendedResponse> {
    let mut fields = Fields::of("ExtendedResponse", value)?;
    let result = read_ldap_result(&mut fields)?;
    let name = fields
        .optional(Tag::context(10))
        .map(|v| Oid::from_ber(&v))
        .transpose()?;
    let value = fields
        .optional(Tag::context(11))
        .map(BerValue::into_bytes)
        .transpose()?;
    fields.finish()?;
    Ok(ExtendedResponse {
        result,
        name,
        value,
    })
}

/// IntermediateResponse ::= [APPLICATION 25] SEQUENCE { responseName [0] OPTIONAL, responseValue [1] OPTIONAL }
fn parse_intermediate_response(value: BerValue) -> Result<IntermediateResponse> {
    let mut fields = Fields::of("IntermediateResponse", value)?;
    let name = fields
        .optional(Tag::context(0))
        .map(|v| Oid::from_ber(&v))
        .transpose()?;
    let value = fields
        .optional(Tag::context(1))
        .map(BerValue::into_bytes)
        .transpose()?;
    fields.finish()?;
    Ok(IntermediateResponse { name, value })
}

fn encode_attribute(attr: &Attribute) -> BerValue {
    BerValue::sequence(vec![
        ldap_string(&attr.attr_type),
        BerValue::set(
            attr.attr_values
                .iter()
                .map(|v| BerValue::octet_string(v.clone()))
                .collect(),
        ),
    ])
}

fn parse_attribute(value: BerValue) -> Result<Attribute> {
    if !value.is(Tag::universal(universal::SEQUENCE)) {
        return Err(LdapError::structural(format!(
            "Attribute must be a SEQUENCE, got {}",
            value.tag
        )));
    }
    let mut fields = Fields::of("Attribute", value)?;
    let attr_type = fields.string("type")?;
    let attr_values = fields
        .expect(Tag::universal(universal::SET), "vals")?
        .into_children()?
        .into_iter()
        .map(BerValue::into_bytes)
        .collect::<Result<Vec<_>>>()?;
    fields.finish()?;
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}
