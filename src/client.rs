//! Connection-level facade over the queue, the SASL registry and the root DSE cache.

use crate::config::ConnectionConfig;
use crate::error::{LdapError, Result};
use crate::ldap_protocol::{
    DelRequest, ExtendedRequest, ExtendedResponse, LdapResult, ProtocolOp,
};
use crate::queue::{ClientQueue, Transport};
use crate::root_dse::{CachedRootDse, RootDse};
use crate::sasl::Sasl;
use crate::sasl_bind::{SaslBind, SaslBindOutcome, SaslBindRequest};
use crate::tls;
use crate::transport::{LdapStream, LdapUrl};
use crate::value::Dn;
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

pub struct LdapClient<S = LdapStream> {
    queue: ClientQueue<S>,
    sasl: Sasl,
    root_dse: CachedRootDse,
    timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl LdapClient<LdapStream> {
    /// Open the connection described by `config`: TCP or ldaps, then StartTLS if requested.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let url = LdapUrl::parse(&config.url)?;
        let tls = if url.tls || config.starttls || config.tls.is_some() {
            let tls_config = tls::client_config(config.tls.as_ref())
                .map_err(|e| LdapError::connection(format!("TLS setup failed: {:#}", e)))?;
            let server_name = tls::server_name(config.tls.as_ref(), &url.host)
                .map_err(|e| LdapError::connection(format!("{:#}", e)))?;
            Some((TlsConnector::from(tls_config), server_name))
        } else {
            None
        };

        let stream = match (&tls, url.tls) {
            (Some((connector, server_name)), true) => {
                LdapStream::connect_tls(&url, config.connect_timeout(), connector, server_name.clone())
                    .await?
            }
            _ => LdapStream::connect(&url, config.connect_timeout()).await?,
        };
        info!("Connected to {} (tls: {})", url.address(), url.tls);

        let mut client = Self::new(stream, config.timeout());
        client.tls = tls;
        if config.starttls {
            if url.tls {
                debug!("Ignoring starttls for an ldaps:// connection");
            } else {
                client.start_tls().await?;
            }
        }
        Ok(client)
    }

    /// Upgrade the plain connection with the StartTLS extended operation (RFC 4511 4.14).
    pub async fn start_tls(&mut self) -> Result<()> {
        if self.queue.stream().is_tls() {
            return Err(LdapError::invalid_state("TLS is already active"));
        }
        if self.queue.has_wrapper() {
            return Err(LdapError::invalid_state(
                "StartTLS is not allowed while a SASL security layer is active",
            ));
        }
        if self.queue.has_buffered_input() {
            return Err(LdapError::invalid_state(
                "StartTLS refused: unread data is buffered on the connection",
            ));
        }
        let (connector, server_name) = self
            .tls
            .clone()
            .ok_or_else(|| LdapError::invalid_state("no TLS configuration for StartTLS"))?;

        let response = self.extended(ExtendedRequest::start_tls()).await?;
        if !response.result.is_success() {
            return Err(LdapError::OperationFailure {
                operation: "StartTLS",
                result_code: response.result.result_code,
                diagnostic: response.result.diagnostic_message,
            });
        }
        // Anything already read would have been sent before the handshake, in clear.
        if self.queue.has_buffered_input() {
            return Err(LdapError::security(
                "server sent data after the StartTLS response and before the TLS handshake",
            ));
        }
        self.queue
            .stream_mut()
            .upgrade_to_tls(&connector, server_name)
            .await?;
        self.root_dse.invalidate();
        info!("StartTLS complete");
        Ok(())
    }
}

impl<S: Transport> LdapClient<S> {
    /// Client over an already connected transport. StartTLS is unavailable.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            queue: ClientQueue::new(stream),
            sasl: Sasl::new(),
            root_dse: CachedRootDse::new(timeout),
            timeout,
            tls: None,
        }
    }

    /// Replace the mechanism registry (e.g. to add mechanisms or a selection policy).
    pub fn with_sasl(mut self, sasl: Sasl) -> Self {
        self.sasl = sasl;
        self
    }

    pub fn queue(&self) -> &ClientQueue<S> {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut ClientQueue<S> {
        &mut self.queue
    }

    pub async fn sasl_bind(&mut self, request: SaslBindRequest) -> Result<SaslBindOutcome> {
        let mut bind = SaslBind::new(&mut self.queue, &self.sasl, &mut self.root_dse);
        bind.execute(&request).await
    }

    pub async fn root_dse(&mut self, attribute: &str) -> Result<Option<Vec<String>>> {
        self.root_dse.get(&mut self.queue, attribute, false).await
    }

    /// Authorization identity of the connection (RFC 4532), e.g. `dn:cn=admin` or empty.
    pub async fn whoami(&mut self) -> Result<String> {
        let response = self.extended(ExtendedRequest::whoami()).await?;
        if !response.result.is_success() {
            return Err(LdapError::OperationFailure {
                operation: "Who Am I",
                result_code: response.result.result_code,
                diagnostic: response.result.diagnostic_message,
            });
        }
        String::from_utf8(response.value.unwrap_or_default())
            .map_err(|_| LdapError::structural("authzId is not valid UTF-8"))
    }

    pub async fn extended(&mut self, request: ExtendedRequest) -> Result<ExtendedResponse> {
        debug!("Extended request {}", request.name);
        let message_id = self
            .queue
            .send_request(ProtocolOp::ExtendedRequest(request), Vec::new())
            .await?;
        match self.queue.receive(message_id, self.timeout).await?.protocol_op {
            ProtocolOp::ExtendedResponse(response) => Ok(response),
            other => Err(LdapError::ProtocolMismatch {
                expected: "ExtendedResponse",
                actual: other.name(),
            }),
        }
    }

    pub async fn delete(&mut self, entry: Dn) -> Result<LdapResult> {
        let message_id = self
            .queue
            .send_request(ProtocolOp::DelRequest(DelRequest { entry }), Vec::new())
            .await?;
        match self.queue.receive(message_id, self.timeout).await?.protocol_op {
            ProtocolOp::DelResponse(result) => Ok(result),
            other => Err(LdapError::ProtocolMismatch {
                expected: "DelResponse",
                actual: other.name(),
            }),
        }
    }

    /// Send UnbindRequest (no response) and close the transport.
    pub async fn unbind(mut self) -> Result<()> {
        self.queue
            .send_request(ProtocolOp::UnbindRequest, Vec::new())
            .await?;
        self.queue.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use crate::ldap_protocol::{
        encode_ldap_message, parse_ldap_message, result_code, BindAuthentication, BindRequest,
        LdapMessage, OID_START_TLS, OID_WHOAMI,
    };
    use crate::sasl::SaslOptions;
    use crate::test_support::{
        bind_response, del_response, extended_response, tls_acceptor, xor_wrapper, MockServer,
    };
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use crate::root_dse::SUPPORTED_SASL_MECHANISMS;
    use tokio::net::{TcpListener, TcpStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (LdapClient<DuplexStream>, MockServer) {
        let (client, server) = duplex(64 * 1024);
        (LdapClient::new(client, WAIT), MockServer::new(server))
    }

    fn plain_options() -> SaslOptions {
        let mut options = SaslOptions::new();
        options.insert("username".to_string(), "alice".to_string());
        options.insert("password".to_string(), "secret".to_string());
        options
    }

    #[tokio::test]
    async fn test_whoami() {
        let (mut client, mut server) = setup();
        let respond = async {
            let request = server.receive().await;
            match &request.protocol_op {
                ProtocolOp::ExtendedRequest(req) => assert_eq!(req.name.as_str(), OID_WHOAMI),
                other => panic!("unexpected {}", other.name()),
            }
            server
                .send(extended_response(request.message_id, 0, Some(&b"dn:cn=alice,dc=example"[..])))
                .await;
        };
        let (identity, _) = tokio::join!(client.whoami(), respond);
        assert_eq!(identity.unwrap(), "dn:cn=alice,dc=example");
    }

    #[tokio::test]
    async fn test_whoami_failure() {
        let (mut client, mut server) = setup();
        let respond = async {
            let request = server.receive().await;
            server
                .send(extended_response(request.message_id, result_code::UNAVAILABLE, None))
                .await;
        };
        let (result, _) = tokio::join!(client.whoami(), respond);
        assert!(matches!(
            result,
            Err(LdapError::OperationFailure { operation: "Who Am I", result_code: 52, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let (mut client, mut server) = setup();
        let respond = async {
            let request = server.receive().await;
            match &request.protocol_op {
                ProtocolOp::DelRequest(del) => assert_eq!(del.entry.as_str(), "cn=old,dc=x"),
                other => panic!("unexpected {}", other.name()),
            }
            server
                .send(del_response(request.message_id, result_code::NO_SUCH_OBJECT))
                .await;
        };
        let (result, _) = tokio::join!(client.delete(Dn::from("cn=old,dc=x")), respond);
        assert_eq!(result.unwrap().result_code, result_code::NO_SUCH_OBJECT);
    }

    #[tokio::test]
    async fn test_extended_wrong_response_type() {
        let (mut client, mut server) = setup();
        let respond = async {
            let request = server.receive().await;
            server.send(del_response(request.message_id, 0)).await;
        };
        let (result, _) = tokio::join!(client.extended(ExtendedRequest::whoami()), respond);
        assert!(matches!(
            result,
            Err(LdapError::ProtocolMismatch { expected: "ExtendedResponse", actual: "DelResponse" })
        ));
    }

    #[tokio::test]
    async fn test_sasl_bind_explicit_plain() {
        let (mut client, mut server) = setup();
        let respond = async {
            let request = server.receive().await;
            match &request.protocol_op {
                ProtocolOp::BindRequest(BindRequest {
                    authentication: BindAuthentication::Sasl { mechanism, credentials },
                    ..
                }) => {
                    assert_eq!(mechanism, "PLAIN");
                    assert_eq!(credentials.as_deref(), Some(&b"\0alice\0secret"[..]));
                }
                other => panic!("unexpected {:?}", other),
            }
            server.send(bind_response(request.message_id, 0, None)).await;
        };
        let request = SaslBindRequest::new(Some("plain".to_string()), plain_options());
        let (outcome, _) = tokio::join!(client.sasl_bind(request), respond);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.mechanism, "PLAIN");
        assert_eq!(outcome.rounds, 1);
        assert!(!client.queue().has_wrapper());
    }

    #[tokio::test]
    async fn test_sasl_bind_automatic_reads_root_dse_twice() {
        let (mut client, mut server) = setup();
        let respond = async {
            server.answer_root_dse(&["PLAIN"]).await;
            let request = server.receive().await;
            server.send(bind_response(request.message_id, 0, None)).await;
            server.answer_root_dse(&["PLAIN"]).await;
        };
        let request = SaslBindRequest::new(None, plain_options()).with_timeout(WAIT);
        let (outcome, _) = tokio::join!(client.sasl_bind(request), respond);
        assert_eq!(outcome.unwrap().mechanism, "PLAIN");
    }

    #[tokio::test]
    async fn test_sasl_bind_automatic_detects_downgrade() {
        let (mut client, mut server) = setup();
        let respond = async {
            server.answer_root_dse(&["PLAIN"]).await;
            let request = server.receive().await;
            server.send(bind_response(request.message_id, 0, None)).await;
            server.answer_root_dse(&["PLAIN", "GSSAPI"]).await;
        };
        let request = SaslBindRequest::new(None, plain_options());
        let (outcome, _) = tokio::join!(client.sasl_bind(request), respond);
        match outcome {
            Err(LdapError::Security { message }) => assert!(message.contains("GSSAPI")),
            other => panic!("expected a security error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unbind_closes_connection() {
        let (client, mut server) = setup();
        client.unbind().await.unwrap();
        let message = server.receive().await;
        assert_eq!(message.protocol_op, ProtocolOp::UnbindRequest);
        assert!(server.read_raw().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_tls_without_tls_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = LdapUrl::parse(&format!("ldap://{}", addr)).unwrap();
        let (stream, _accepted) = tokio::join!(LdapStream::connect(&url, WAIT), listener.accept());
        let mut client = LdapClient::new(stream.unwrap(), WAIT);
        assert!(matches!(
            client.start_tls().await,
            Err(LdapError::InvalidState { .. })
        ));
    }

    fn insecure_tls() -> TlsConfig {
        TlsConfig {
            skip_verify: true,
            server_name: Some("localhost".to_string()),
            ..TlsConfig::default()
        }
    }

    /// Plain TCP client with StartTLS configured, and the accepted server socket.
    async fn tcp_client() -> (LdapClient, MockServer<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig {
            url: format!("ldap://{}", listener.local_addr().unwrap()),
            tls: Some(insecure_tls()),
            ..ConnectionConfig::default()
        };
        let (client, accepted) = tokio::join!(LdapClient::connect(&config), listener.accept());
        (client.unwrap(), MockServer::new(accepted.unwrap().0))
    }

    fn assert_start_tls_request(request: &LdapMessage) {
        match &request.protocol_op {
            ProtocolOp::ExtendedRequest(req) => assert_eq!(req.name.as_str(), OID_START_TLS),
            other => panic!("expected StartTLS, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_start_tls_refused_with_security_layer() {
        let (mut client, mut server) = tcp_client().await;
        client.queue_mut().set_wrapper(Some(xor_wrapper(0x5A)));
        match client.start_tls().await {
            Err(LdapError::InvalidState { message }) => assert!(message.contains("security layer")),
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }
        assert!(!client.queue().stream().is_tls());

        // Nothing went out: the next request the server sees is the one sent now.
        client.queue_mut().set_wrapper(None);
        let id = client
            .queue_mut()
            .send_request(ProtocolOp::AbandonRequest(1), Vec::new())
            .await
            .unwrap();
        let received = server.receive().await;
        assert_eq!(received.message_id, id);
        assert_eq!(received.protocol_op, ProtocolOp::AbandonRequest(1));
    }

    #[tokio::test]
    async fn test_start_tls_refused_with_buffered_input() {
        let (mut client, mut server) = tcp_client().await;
        let partial = encode_ldap_message(&del_response(9, result_code::SUCCESS));
        server.send_raw(&partial[..3]).await;
        let waited = client
            .queue_mut()
            .receive(9, Duration::from_millis(200))
            .await;
        assert!(matches!(waited, Err(LdapError::Timeout { .. })));
        assert!(client.queue().has_buffered_input());

        match client.start_tls().await {
            Err(LdapError::InvalidState { message }) => assert!(message.contains("buffered")),
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }
        assert!(!client.queue().stream().is_tls());
    }

    #[tokio::test]
    async fn test_start_tls_data_before_handshake_is_security_error() {
        let (mut client, mut server) = tcp_client().await;
        let respond = async {
            let request = server.receive().await;
            assert_start_tls_request(&request);
            // Response and an injected envelope in a single write.
            let mut data = encode_ldap_message(&extended_response(request.message_id, 0, None));
            data.extend_from_slice(&encode_ldap_message(&del_response(7, 0)));
            server.send_raw(&data).await;
        };
        let (result, _) = tokio::join!(client.start_tls(), respond);
        assert!(matches!(result, Err(LdapError::Security { .. })));
        assert!(!client.queue().stream().is_tls());
    }

    #[tokio::test]
    async fn test_start_tls_upgrades_in_place() {
        let (mut client, mut server) = tcp_client().await;
        let acceptor = tls_acceptor();

        let (supported, _) = tokio::join!(
            client.root_dse(SUPPORTED_SASL_MECHANISMS),
            server.answer_root_dse(&["PLAIN"])
        );
        assert_eq!(supported.unwrap(), Some(vec!["PLAIN".to_string()]));
        assert!(client.root_dse.entry().is_some());

        let server = async move {
            let request = server.receive().await;
            assert_start_tls_request(&request);
            server
                .send(extended_response(request.message_id, result_code::SUCCESS, None))
                .await;
            let tls = acceptor.accept(server.into_inner()).await.unwrap();
            let mut server = MockServer::new(tls);
            let request = server.receive().await;
            match &request.protocol_op {
                ProtocolOp::ExtendedRequest(req) => assert_eq!(req.name.as_str(), OID_WHOAMI),
                other => panic!("unexpected {}", other.name()),
            }
            server
                .send(extended_response(request.message_id, 0, Some(&b"dn:cn=tls,dc=x"[..])))
                .await;
            server
        };
        let client_side = async {
            client.start_tls().await.unwrap();
            assert!(client.queue().stream().is_tls());
            assert!(client.root_dse.entry().is_none());
            assert!(matches!(
                client.start_tls().await,
                Err(LdapError::InvalidState { .. })
            ));
            client.whoami().await.unwrap()
        };
        let (identity, _server) = tokio::join!(client_side, server);
        assert_eq!(identity, "dn:cn=tls,dc=x");
    }

    #[tokio::test]
    async fn test_connect_starttls_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ConnectionConfig {
            url: format!("ldap://{}", addr),
            starttls: true,
            tls: Some(TlsConfig {
                skip_verify: true,
                ..TlsConfig::default()
            }),
            ..ConnectionConfig::default()
        };
        let server = async {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = parse_ldap_message(&buf[..n]).unwrap();
            match &request.protocol_op {
                ProtocolOp::ExtendedRequest(req) => {
                    assert_eq!(req.name, ExtendedRequest::start_tls().name)
                }
                other => panic!("unexpected {}", other.name()),
            }
            let response = extended_response(
                request.message_id,
                result_code::PROTOCOL_ERROR,
                None,
            );
            socket
                .write_all(&encode_ldap_message(&response))
                .await
                .unwrap();
            socket
        };
        let (result, _socket) = tokio::join!(LdapClient::connect(&config), server);
        assert!(matches!(
            result,
            Err(LdapError::OperationFailure { operation: "StartTLS", result_code: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = ConnectionConfig {
            url: format!("ldap://{}", addr),
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            LdapClient::connect(&config).await,
            Err(LdapError::Connection { .. })
        ));
    }
}
