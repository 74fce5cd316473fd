//! Root DSE access (RFC 4512 5.1): the server's self-description entry, read
//! with a base-scope search of the empty DN.

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{ProtocolOp, SearchRequest, SearchResultEntry};
use crate::queue::{ClientQueue, Transport};
use crate::value::Dn;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const SUPPORTED_SASL_MECHANISMS: &str = "supportedSASLMechanisms";

/// Attributes requested when the root DSE is read.
pub const ROOT_DSE_ATTRIBUTES: &[&str] = &[
    "namingContexts",
    "supportedControl",
    "supportedExtension",
    "supportedFeatures",
    "supportedLDAPVersion",
    SUPPORTED_SASL_MECHANISMS,
    "vendorName",
    "vendorVersion",
];

#[async_trait]
pub trait RootDse<S: Transport>: Send {
    /// Values of `attribute`, or `None` when the server does not publish it.
    /// `reload` bypasses any cached copy.
    async fn get(
        &mut self,
        queue: &mut ClientQueue<S>,
        attribute: &str,
        reload: bool,
    ) -> Result<Option<Vec<String>>>;
}

/// Reads the root DSE through the queue once and serves later lookups from memory.
#[derive(Debug, Clone)]
pub struct CachedRootDse {
    entry: Option<SearchResultEntry>,
    timeout: Duration,
}

impl CachedRootDse {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entry: None,
            timeout,
        }
    }

    /// Drop the cached entry, e.g. after StartTLS or a bind changed what the server will show.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn entry(&self) -> Option<&SearchResultEntry> {
        self.entry.as_ref()
    }

    async fn load<S: Transport>(&self, queue: &mut ClientQueue<S>) -> Result<SearchResultEntry> {
        let attributes = ROOT_DSE_ATTRIBUTES.iter().map(|a| a.to_string()).collect();
        let id = queue
            .send_request(ProtocolOp::SearchRequest(SearchRequest::root_dse(attributes)), vec![])
            .await?;
        let mut entry = None;
        for message in queue.receive_until_final(id, self.timeout).await? {
            match message.protocol_op {
                ProtocolOp::SearchResultEntry(e) if entry.is_none() => entry = Some(e),
                ProtocolOp::SearchResultDone(result) if !result.is_success() => {
                    return Err(LdapError::OperationFailure {
                        operation: "root DSE search",
                        result_code: result.result_code,
                        diagnostic: result.diagnostic_message,
                    });
                }
                ProtocolOp::SearchResultDone(_)
                | ProtocolOp::SearchResultEntry(_)
                | ProtocolOp::SearchResultReference(_)
                | ProtocolOp::IntermediateResponse(_) => {}
                other => {
                    return Err(LdapError::ProtocolMismatch {
                        expected: "SearchResultDone",
                        actual: other.name(),
                    })
                }
            }
        }
        debug!("Root DSE loaded (entry present: {})", entry.is_some());
        Ok(entry.unwrap_or(SearchResultEntry {
            object_name: Dn::root(),
            attributes: Vec::new(),
        }))
    }
}

#[async_trait]
impl<S: Transport> RootDse<S> for CachedRootDse {
    async fn get(
        &mut self,
        queue: &mut ClientQueue<S>,
        attribute: &str,
        reload: bool,
    ) -> Result<Option<Vec<String>>> {
        if reload || self.entry.is_none() {
            let entry = self.load(queue).await?;
            self.entry = Some(entry);
        }
        Ok(self.entry.as_ref().and_then(|e| e.values(attribute)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{result_code, LdapMessage, LdapResult};
    use crate::test_support::MockServer;
    use tokio::io::duplex;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_get_reads_once_then_caches() {
        let (client, server) = duplex(64 * 1024);
        let mut queue = ClientQueue::new(client);
        let mut server = MockServer::new(server);
        let mut root_dse = CachedRootDse::new(WAIT);

        let (values, _) = tokio::join!(
            root_dse.get(&mut queue, "supportedSaslMechanisms", false),
            server.answer_root_dse(&["PLAIN", "EXTERNAL"])
        );
        assert_eq!(
            values.unwrap(),
            Some(vec!["PLAIN".to_string(), "EXTERNAL".to_string()])
        );

        // Served from the cache: the server is not consulted.
        let values = root_dse.get(&mut queue, SUPPORTED_SASL_MECHANISMS, false).await.unwrap();
        assert_eq!(values.unwrap().len(), 2);
        assert_eq!(root_dse.get(&mut queue, "vendorName", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reload_bypasses_cache() {
        let (client, server) = duplex(64 * 1024);
        let mut queue = ClientQueue::new(client);
        let mut server = MockServer::new(server);
        let mut root_dse = CachedRootDse::new(WAIT);

        let (first, _) = tokio::join!(
            root_dse.get(&mut queue, SUPPORTED_SASL_MECHANISMS, false),
            server.answer_root_dse(&["PLAIN"])
        );
        assert_eq!(first.unwrap().unwrap(), vec!["PLAIN".to_string()]);

        let (second, _) = tokio::join!(
            root_dse.get(&mut queue, SUPPORTED_SASL_MECHANISMS, true),
            server.answer_root_dse(&["PLAIN", "GSSAPI"])
        );
        assert_eq!(second.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_search_is_reported() {
        let (client, server) = duplex(64 * 1024);
        let mut queue = ClientQueue::new(client);
        let mut server = MockServer::new(server);
        let mut root_dse = CachedRootDse::new(WAIT);

        let respond = async {
            let request = server.receive().await;
            server
                .send(LdapMessage::new(
                    request.message_id,
                    ProtocolOp::SearchResultDone(LdapResult::new(
                        result_code::INSUFFICIENT_ACCESS_RIGHTS,
                        "denied",
                    )),
                ))
                .await;
        };
        let (result, _) = tokio::join!(
            root_dse.get(&mut queue, SUPPORTED_SASL_MECHANISMS, false),
            respond
        );
        assert!(matches!(
            result,
            Err(LdapError::OperationFailure { result_code: 50, .. })
        ));
        assert!(root_dse.entry().is_none());
    }
}
