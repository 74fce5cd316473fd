//! Byte transport under the message queue: plain TCP, TLS (ldaps:// or after StartTLS).

use crate::error::{LdapError, Result};
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Parsed `ldap://host[:port]` or `ldaps://host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub host: String,
    pub port: u16,
    /// TLS from the first byte (ldaps://).
    pub tls: bool,
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (rest, tls) = if let Some(rest) = url.strip_prefix("ldap://") {
            (rest, false)
        } else if let Some(rest) = url.strip_prefix("ldaps://") {
            (rest, true)
        } else {
            return Err(LdapError::connection(format!(
                "invalid LDAP URL scheme, expected ldap:// or ldaps://: {}",
                url
            )));
        };
        let rest = rest.trim_start_matches('/');
        // Drop any DN or query part.
        let authority = rest.split('/').next().unwrap_or_default();
        let default_port = if tls { DEFAULT_LDAPS_PORT } else { DEFAULT_LDAP_PORT };
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, after) = v6
                .split_once(']')
                .ok_or_else(|| LdapError::connection(format!("unterminated IPv6 address in {}", url)))?;
            let port = match after.strip_prefix(':') {
                Some(p) => parse_port(p, url)?,
                None if after.is_empty() => default_port,
                None => return Err(LdapError::connection(format!("invalid authority in {}", url))),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host.to_string(), parse_port(p, url)?),
                None => (authority.to_string(), default_port),
            }
        };
        if host.is_empty() {
            return Err(LdapError::connection(format!("no host in LDAP URL: {}", url)));
        }
        Ok(Self { host, port, tls })
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, url: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| LdapError::connection(format!("invalid port in LDAP URL: {}", url)))
}

/// Connection to the directory server. Upgraded in place on StartTLS.
pub enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
    /// Left behind by a failed upgrade; every I/O call fails.
    Closed,
}

impl LdapStream {
    pub async fn connect(url: &LdapUrl, connect_timeout: Duration) -> Result<Self> {
        let addr = url.address();
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| LdapError::connection(format!("connect to {} timed out after {:?}", addr, connect_timeout)))?
            .map_err(|e| LdapError::connection(format!("failed to connect to {}: {}", addr, e)))?;
        let _ = tcp.set_nodelay(true);
        debug!("Connected to {}", addr);
        Ok(LdapStream::Tcp(tcp))
    }

    pub async fn connect_tls(
        url: &LdapUrl,
        connect_timeout: Duration,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let mut stream = Self::connect(url, connect_timeout).await?;
        stream.upgrade_to_tls(connector, server_name).await?;
        Ok(stream)
    }

    /// Run the TLS handshake over the current TCP connection.
    pub async fn upgrade_to_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let tcp = match std::mem::replace(self, LdapStream::Closed) {
            LdapStream::Tcp(tcp) => tcp,
            other => {
                let already_tls = matches!(other, LdapStream::Tls(_));
                *self = other;
                return Err(LdapError::connection(if already_tls {
                    "TLS is already active on this connection"
                } else {
                    "connection is closed"
                }));
            }
        };
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| LdapError::connection(format!("TLS handshake failed: {}", e)))?;
        *self = LdapStream::Tls(Box::new(tls_stream));
        debug!("TLS established");
        Ok(())
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, LdapStream::Tls(_))
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection is closed")
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            LdapStream::Closed => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            LdapStream::Closed => Poll::Ready(Err(closed_error())),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            LdapStream::Closed => Poll::Ready(Ok(())),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            LdapStream::Closed => Poll::Ready(Ok(())),
        }
    }
}
