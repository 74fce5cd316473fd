//! Scripted directory server and toy SASL pieces for in-crate tests.

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{
    encode_ldap_message, try_parse_message, Attribute, BindResponse, ExtendedResponse, LdapMessage,
    LdapResult,
    ProtocolOp, SearchResultEntry,
};
use crate::queue::{ClientQueue, MessageWrapper, Transport};
use crate::root_dse::{RootDse, SUPPORTED_SASL_MECHANISMS};
use crate::sasl::{Mechanism, SaslContext, SaslMessageWrapper, SaslOptions, SecurityLayer};
use crate::value::Dn;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

/// Scripted server end of a connection, in memory by default.
pub(crate) struct MockServer<T = DuplexStream> {
    stream: T,
    inbound: BytesMut,
    plain: BytesMut,
    wrapper: Option<Box<dyn MessageWrapper>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> MockServer<T> {
    pub(crate) fn new(stream: T) -> Self {
        Self {
            stream,
            inbound: BytesMut::new(),
            plain: BytesMut::new(),
            wrapper: None,
        }
    }

    /// Hand the raw stream back, e.g. to run a TLS handshake over it.
    pub(crate) fn into_inner(self) -> T {
        assert!(self.inbound.is_empty() && self.plain.is_empty(), "unread client bytes");
        self.stream
    }

    pub(crate) fn set_wrapper(&mut self, wrapper: Option<Box<dyn MessageWrapper>>) {
        self.wrapper = wrapper;
    }

    pub(crate) async fn send(&mut self, message: LdapMessage) {
        let mut data = encode_ldap_message(&message);
        if let Some(wrapper) = self.wrapper.as_mut() {
            data = wrapper.wrap(&data).unwrap();
        }
        self.send_raw(&data).await;
    }

    pub(crate) async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// One read's worth of raw bytes; empty once the client has shut down.
    pub(crate) async fn read_raw(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.stream.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    pub(crate) async fn receive(&mut self) -> LdapMessage {
        loop {
            if let Some(wrapper) = self.wrapper.as_mut() {
                while let Some((plain, consumed)) = wrapper.unwrap(&self.inbound).unwrap() {
                    let _ = self.inbound.split_to(consumed);
                    self.plain.extend_from_slice(&plain);
                }
            }
            let source = if self.wrapper.is_some() || !self.plain.is_empty() {
                &mut self.plain
            } else {
                &mut self.inbound
            };
            if let Some((message, consumed)) = try_parse_message(&source[..]).unwrap() {
                let _ = source.split_to(consumed);
                return message;
            }
            let n = self.stream.read_buf(&mut self.inbound).await.unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    /// Expect a root DSE search and answer it with the given mechanism list.
    pub(crate) async fn answer_root_dse(&mut self, mechanisms: &[&str]) {
        let request = self.receive().await;
        match &request.protocol_op {
            ProtocolOp::SearchRequest(search) => {
                assert!(search.base_object.is_root());
                assert!(search
                    .attributes
                    .iter()
                    .any(|a| a == SUPPORTED_SASL_MECHANISMS));
            }
            other => panic!("expected a root DSE search, got {}", other.name()),
        }
        self.send(root_dse_entry(request.message_id, mechanisms)).await;
        self.send(LdapMessage::new(
            request.message_id,
            ProtocolOp::SearchResultDone(LdapResult::success()),
        ))
        .await;
    }
}

/// Self-signed `localhost` certificate and key (ECDSA P-256) for TLS servers in tests.
pub(crate) fn tls_acceptor() -> tokio_rustls::TlsAcceptor {
    use rcgen::{CertificateParams, DnType, KeyPair, SanType};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "localhost");
    params.subject_alt_names = vec![SanType::DnsName("localhost".try_into().unwrap())];
    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

pub(crate) fn extended_response(message_id: u32, code: i32, value: Option<&[u8]>) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::new(code, ""),
            name: None,
            value: value.map(<[u8]>::to_vec),
        }),
    )
}

pub(crate) fn del_response(message_id: u32, code: i32) -> LdapMessage {
    LdapMessage::new(message_id, ProtocolOp::DelResponse(LdapResult::new(code, "")))
}

pub(crate) fn bind_response(message_id: u32, code: i32, creds: Option<Vec<u8>>) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::BindResponse(BindResponse {
            result: LdapResult::new(code, ""),
            server_sasl_creds: creds,
        }),
    )
}

pub(crate) fn root_dse_entry(message_id: u32, mechanisms: &[&str]) -> LdapMessage {
    LdapMessage::new(
        message_id,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: Dn::root(),
            attributes: vec![Attribute {
                attr_type: SUPPORTED_SASL_MECHANISMS.to_string(),
                attr_values: mechanisms.iter().map(|m| m.as_bytes().to_vec()).collect(),
            }],
        }),
    )
}

/// XORs every octet with a key. Symmetric, so both peers use the same layer.
pub(crate) struct XorLayer {
    key: u8,
}

impl XorLayer {
    pub(crate) fn new(key: u8) -> Self {
        Self { key }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ self.key).collect()
    }
}

impl SecurityLayer for XorLayer {
    fn wrap(&mut self, data: &[u8], _context: &SaslContext) -> Result<Vec<u8>> {
        Ok(self.apply(data))
    }

    fn unwrap(&mut self, data: &[u8], _context: &SaslContext) -> Result<Vec<u8>> {
        Ok(self.apply(data))
    }
}

pub(crate) fn xor_wrapper(key: u8) -> Box<dyn MessageWrapper> {
    Box::new(SaslMessageWrapper::new(
        Box::new(XorLayer::new(key)),
        SaslContext::new("X-TEST").completed().with_security_layer(),
    ))
}

/// Challenge, response, then a server proof checked after the final SUCCESS.
pub(crate) struct TwoRoundMechanism {
    security_layer: bool,
    round: u32,
}

impl TwoRoundMechanism {
    pub(crate) const NAME: &'static str = "X-TWO-ROUND";
    const KEY: u8 = 0x42;

    pub(crate) fn new(security_layer: bool) -> Self {
        Self {
            security_layer,
            round: 0,
        }
    }

    /// What the server installs once the bind succeeds.
    pub(crate) fn peer_wrapper() -> Box<dyn MessageWrapper> {
        xor_wrapper(Self::KEY)
    }
}

impl Mechanism for TwoRoundMechanism {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initial_response(&mut self, _options: &SaslOptions) -> Result<SaslContext> {
        Ok(SaslContext::new(Self::NAME))
    }

    fn challenge(&mut self, server_data: Option<&[u8]>, _options: &SaslOptions) -> Result<SaslContext> {
        self.round += 1;
        let context = SaslContext::new(Self::NAME).with_server_data(server_data);
        match (self.round, server_data) {
            (1, Some(b"challenge-1")) => Ok(context.responding(Some(b"response-1".to_vec()))),
            (2, Some(b"server-proof")) => {
                let context = context.completed();
                Ok(if self.security_layer {
                    context.with_security_layer()
                } else {
                    context
                })
            }
            (round, data) => Err(LdapError::sasl(format!(
                "unexpected server data in round {}: {:?}",
                round, data
            ))),
        }
    }

    fn provides_security_layer(&self) -> bool {
        self.security_layer
    }

    fn security_layer(&self) -> Option<Box<dyn SecurityLayer>> {
        if self.security_layer {
            Some(Box::new(XorLayer::new(Self::KEY)))
        } else {
            None
        }
    }
}

/// Root DSE double answering from fixed mechanism lists, one list per call
/// (the last list repeats). Never touches the queue.
pub(crate) struct StaticRootDse {
    lists: Vec<Vec<String>>,
    reads: usize,
    reloads: usize,
}

impl StaticRootDse {
    pub(crate) fn new(lists: Vec<Vec<&str>>) -> Self {
        Self {
            lists: lists
                .into_iter()
                .map(|l| l.into_iter().map(str::to_string).collect())
                .collect(),
            reads: 0,
            reloads: 0,
        }
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads
    }

    pub(crate) fn reloads(&self) -> usize {
        self.reloads
    }
}

#[async_trait]
impl<S: Transport> RootDse<S> for StaticRootDse {
    async fn get(
        &mut self,
        _queue: &mut ClientQueue<S>,
        attribute: &str,
        reload: bool,
    ) -> Result<Option<Vec<String>>> {
        self.reads += 1;
        if reload {
            self.reloads += 1;
        }
        if !attribute.eq_ignore_ascii_case(SUPPORTED_SASL_MECHANISMS) || self.lists.is_empty() {
            return Ok(None);
        }
        let index = (self.reads - 1).min(self.lists.len() - 1);
        Ok(Some(self.lists[index].clone()))
    }
}
