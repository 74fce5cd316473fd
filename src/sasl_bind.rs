//! SASL bind negotiation (RFC 4513 5.2.1, RFC 4422).
//!
//! ```text
//! SelectingMechanism -> AwaitingFirstResponse -> Challenging* -> Complete
//!                 \______________________\_____________\______-> Failed
//! ```
//!
//! When the mechanism is chosen automatically, the advertised mechanism list is
//! captured before the bind and compared with a fresh copy afterwards. New
//! entries mean someone stripped them from the unauthenticated read, and the
//! negotiation fails with a security error.

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{
    result_code, BindRequest, BindResponse, Control, LdapResult, ProtocolOp,
};
use crate::queue::{ClientQueue, Transport};
use crate::root_dse::{RootDse, SUPPORTED_SASL_MECHANISMS};
use crate::sasl::{Mechanism, Sasl, SaslContext, SaslMessageWrapper, SaslOptions};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    SelectingMechanism,
    AwaitingFirstResponse { mechanism: String },
    Challenging { mechanism: String, round: u32 },
    Complete { mechanism: String, security_layer: bool },
    Failed,
}

#[derive(Debug, Clone)]
pub struct SaslBindRequest {
    /// `None` selects automatically from the root DSE and enables downgrade detection.
    pub mechanism: Option<String>,
    pub options: SaslOptions,
    pub controls: Vec<Control>,
    /// Deadline for each response.
    pub timeout: Duration,
}

impl SaslBindRequest {
    pub fn new(mechanism: Option<String>, options: SaslOptions) -> Self {
        Self {
            mechanism,
            options,
            controls: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslBindOutcome {
    pub mechanism: String,
    pub result: LdapResult,
    /// Bind request/response pairs exchanged.
    pub rounds: u32,
    pub security_layer: bool,
}

pub struct SaslBind<'a, S, R> {
    queue: &'a mut ClientQueue<S>,
    sasl: &'a Sasl,
    root_dse: &'a mut R,
    state: NegotiationState,
}

impl<'a, S, R> SaslBind<'a, S, R>
where
    S: Transport,
    R: RootDse<S>,
{
    pub fn new(queue: &'a mut ClientQueue<S>, sasl: &'a Sasl, root_dse: &'a mut R) -> Self {
        Self {
            queue,
            sasl,
            root_dse,
            state: NegotiationState::SelectingMechanism,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub async fn execute(&mut self, request: &SaslBindRequest) -> Result<SaslBindOutcome> {
        match self.negotiate(request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("SASL bind failed in state {:?}: {}", self.state, e);
                self.state = NegotiationState::Failed;
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!("SASL negotiation: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn negotiate(&mut self, request: &SaslBindRequest) -> Result<SaslBindOutcome> {
        self.transition(NegotiationState::SelectingMechanism);
        let (mut mechanism, advertised) = match request.mechanism.as_deref() {
            Some(name) => (self.sasl.get(name)?, None),
            None => {
                let advertised = self.advertised_mechanisms(false).await?;
                let mechanism = self.sasl.select(&advertised, &request.options)?;
                (mechanism, Some(advertised))
            }
        };
        let name = mechanism.name().to_string();
        info!("SASL bind using mechanism {}", name);

        self.transition(NegotiationState::AwaitingFirstResponse {
            mechanism: name.clone(),
        });
        let mut context = mechanism.initial_response(&request.options)?;
        let mut response = self.bind_round(&name, &context, request).await?;
        let mut rounds = 1;

        while response.result.result_code == result_code::SASL_BIND_IN_PROGRESS && !context.is_complete {
            self.transition(NegotiationState::Challenging {
                mechanism: name.clone(),
                round: rounds,
            });
            context = mechanism.challenge(response.server_sasl_creds.as_deref(), &request.options)?;
            response = self.bind_round(&name, &context, request).await?;
            rounds += 1;
        }

        if response.result.result_code != result_code::SUCCESS {
            return Err(LdapError::BindFailure {
                result_code: response.result.result_code,
                diagnostic: response.result.diagnostic_message,
            });
        }
        // The server's last credentials may carry a proof the mechanism still has to check.
        if !context.is_complete {
            context = mechanism.challenge(response.server_sasl_creds.as_deref(), &request.options)?;
        }

        let security_layer = self.install_security_layer(&*mechanism, &context)?;

        if let Some(before) = advertised {
            self.check_downgrade(&before).await?;
        }

        self.transition(NegotiationState::Complete {
            mechanism: name.clone(),
            security_layer,
        });
        Ok(SaslBindOutcome {
            mechanism: name,
            result: response.result,
            rounds,
            security_layer,
        })
    }

    async fn advertised_mechanisms(&mut self, reload: bool) -> Result<Vec<String>> {
        Ok(self
            .root_dse
            .get(&mut *self.queue, SUPPORTED_SASL_MECHANISMS, reload)
            .await?
            .unwrap_or_default())
    }

    async fn bind_round(
        &mut self,
        mechanism: &str,
        context: &SaslContext,
        request: &SaslBindRequest,
    ) -> Result<BindResponse> {
        let op = ProtocolOp::BindRequest(BindRequest::sasl(mechanism, context.response.clone()));
        let message_id = self.queue.send_request(op, request.controls.clone()).await?;
        let message = self.queue.receive(message_id, request.timeout).await?;
        match message.protocol_op {
            ProtocolOp::BindResponse(response) => {
                debug!(
                    "Bind response for message_id={}: result code {}",
                    message_id, response.result.result_code
                );
                Ok(response)
            }
            other => Err(LdapError::ProtocolMismatch {
                expected: "BindResponse",
                actual: other.name(),
            }),
        }
    }

    fn install_security_layer(&mut self, mechanism: &dyn Mechanism, context: &SaslContext) -> Result<bool> {
        if !(mechanism.provides_security_layer() && context.has_security_layer) {
            return Ok(false);
        }
        let layer = mechanism.security_layer().ok_or_else(|| {
            LdapError::sasl(format!(
                "{} negotiated a security layer but did not supply one",
                mechanism.name()
            ))
        })?;
        self.queue
            .set_wrapper(Some(Box::new(SaslMessageWrapper::new(layer, context.clone()))));
        Ok(true)
    }

    async fn check_downgrade(&mut self, before: &[String]) -> Result<()> {
        let after = self.advertised_mechanisms(true).await?;
        let added: Vec<&str> = after
            .iter()
            .filter(|m| !before.iter().any(|b| b.eq_ignore_ascii_case(m)))
            .map(String::as_str)
            .collect();
        if added.is_empty() {
            return Ok(());
        }
        warn!(
            "Possible downgrade attack: mechanisms advertised only after bind: {}",
            added.join(", ")
        );
        self.queue.set_wrapper(None);
        Err(LdapError::security(format!(
            "possible downgrade attack: SASL mechanisms [{}] were not advertised before the bind",
            added.join(", ")
        )))
    }
}
