//! Client message queue: one ordered byte stream, many outstanding requests.
//!
//! Decoding and demultiplexing happen inside `send`/`receive`; there is no
//! background task. Envelopes that arrive for a message id nobody is waiting
//! on are parked until asked for. An optional [`MessageWrapper`] (a SASL
//! security layer) sits between the envelopes and the transport.

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{
    encode_ldap_message, try_parse_message, Control, LdapMessage, ProtocolOp,
};
use bytes::BytesMut;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_MESSAGE_ID: u32 = i32::MAX as u32;

/// Duplex byte stream the queue runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Transform applied to whole envelopes around raw transport I/O.
pub trait MessageWrapper: Send {
    fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>>;

    /// Unwrap the first protected unit in `data`. `Ok(None)` when more bytes
    /// are needed; otherwise the plain bytes and the number of octets consumed.
    fn unwrap(&mut self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>>;
}

pub struct ClientQueue<S> {
    stream: S,
    /// Bytes as read from the transport.
    inbound: BytesMut,
    /// Unwrapped bytes awaiting envelope decode.
    plain: BytesMut,
    pending: HashMap<u32, VecDeque<LdapMessage>>,
    /// Ids whose late envelopes are dropped until their final response shows up.
    discarded: HashSet<u32>,
    wrapper: Option<Box<dyn MessageWrapper>>,
    next_id: u32,
}

impl<S: Transport> ClientQueue<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            inbound: BytesMut::with_capacity(4096),
            plain: BytesMut::new(),
            pending: HashMap::new(),
            discarded: HashSet::new(),
            wrapper: None,
            next_id: 1,
        }
    }

    /// Allocate the next request id: 1, 2, ..., 2^31-1, then 1 again. Never 0.
    /// Ids with parked or discarded envelopes are skipped after a wrap.
    pub fn next_message_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_MESSAGE_ID { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) && !self.discarded.contains(&id) {
                return id;
            }
            debug!("Skipping message_id={}: still has outstanding envelopes", id);
        }
    }

    /// Drop everything parked for `message_id`, and anything that arrives for
    /// it later up to its final response. Returns the number of envelopes dropped now.
    pub fn discard(&mut self, message_id: u32) -> usize {
        let dropped = self.pending.remove(&message_id).unwrap_or_default();
        if !dropped.iter().any(|m| m.protocol_op.is_final_response()) {
            self.discarded.insert(message_id);
        }
        if !dropped.is_empty() {
            debug!(
                "Discarded {} envelope(s) for message_id={}",
                dropped.len(),
                message_id
            );
        }
        dropped.len()
    }

    pub async fn send(&mut self, message: &LdapMessage) -> Result<()> {
        if message.message_id == 0 {
            return Err(LdapError::structural(
                "message ID 0 is reserved for unsolicited notifications",
            ));
        }
        let mut data = encode_ldap_message(message);
        if let Some(wrapper) = self.wrapper.as_mut() {
            data = wrapper.wrap(&data)?;
        }
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        debug!(
            "Sent message_id={} op={} ({} bytes)",
            message.message_id,
            message.protocol_op.name(),
            data.len()
        );
        Ok(())
    }

    /// Send `op` under a freshly allocated id and return that id.
    pub async fn send_request(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<u32> {
        let message_id = self.next_message_id();
        let message = LdapMessage::new(message_id, op).with_controls(controls);
        self.send(&message).await?;
        Ok(message_id)
    }

    /// Wait for the next envelope carrying `message_id`. A timeout too large
    /// to express as a deadline waits without one.
    pub async fn receive(&mut self, message_id: u32, timeout: Duration) -> Result<LdapMessage> {
        self.receive_by(message_id, Instant::now().checked_add(timeout), timeout)
            .await
    }

    /// Collect every envelope for `message_id` up to and including its final
    /// response (search entries, references and intermediate responses first).
    pub async fn receive_until_final(
        &mut self,
        message_id: u32,
        timeout: Duration,
    ) -> Result<Vec<LdapMessage>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut messages = Vec::new();
        loop {
            let message = self.receive_by(message_id, deadline, timeout).await?;
            let done = message.protocol_op.is_final_response();
            messages.push(message);
            if done {
                return Ok(messages);
            }
        }
    }

    async fn receive_by(
        &mut self,
        message_id: u32,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<LdapMessage> {
        loop {
            if let Some(message) = self.take_pending(message_id) {
                return Ok(message);
            }
            if let Some(message) = self.decode_buffered()? {
                self.dispatch(message)?;
                continue;
            }
            // read_buf is cancel safe: a timed out read loses no bytes.
            let read = self.stream.read_buf(&mut self.inbound);
            let n = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, read)
                    .await
                    .map_err(|_| LdapError::Timeout {
                        message_id,
                        timeout,
                    })??,
                None => read.await?,
            };
            if n == 0 {
                return Err(LdapError::connection(format!(
                    "connection closed by server while waiting for message {}",
                    message_id
                )));
            }
        }
    }

    fn take_pending(&mut self, message_id: u32) -> Option<LdapMessage> {
        let queue = self.pending.get_mut(&message_id)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&message_id);
        }
        message
    }

    /// Decode one envelope from what has already been read, if complete.
    fn decode_buffered(&mut self) -> Result<Option<LdapMessage>> {
        if let Some(wrapper) = self.wrapper.as_mut() {
            while let Some((plain, consumed)) = wrapper.unwrap(&self.inbound)? {
                let _ = self.inbound.split_to(consumed);
                self.plain.extend_from_slice(&plain);
            }
        }
        let source = if self.wrapper.is_some() || !self.plain.is_empty() {
            &mut self.plain
        } else {
            &mut self.inbound
        };
        match try_parse_message(&source[..])? {
            Some((message, consumed)) => {
                let _ = source.split_to(consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    fn dispatch(&mut self, message: LdapMessage) -> Result<()> {
        if message.message_id == 0 {
            return Err(unsolicited_notification(message));
        }
        if self.discarded.contains(&message.message_id) {
            debug!(
                "Dropping late message_id={} op={}",
                message.message_id,
                message.protocol_op.name()
            );
            if message.protocol_op.is_final_response() {
                self.discarded.remove(&message.message_id);
            }
            return Ok(());
        }
        debug!(
            "Received message_id={} op={}",
            message.message_id,
            message.protocol_op.name()
        );
        self.pending
            .entry(message.message_id)
            .or_default()
            .push_back(message);
        Ok(())
    }

    /// Install or remove the message wrapper. Replaces any previous one.
    pub fn set_wrapper(&mut self, wrapper: Option<Box<dyn MessageWrapper>>) {
        match (&wrapper, self.wrapper.is_some()) {
            (Some(_), true) => info!("Replacing message security layer"),
            (Some(_), false) => info!("Message security layer installed"),
            (None, true) => info!("Message security layer removed"),
            (None, false) => {}
        }
        self.wrapper = wrapper;
    }

    pub fn has_wrapper(&self) -> bool {
        self.wrapper.is_some()
    }

    /// Bytes read from the transport that have not been turned into envelopes yet.
    pub fn has_buffered_input(&self) -> bool {
        !self.inbound.is_empty() || !self.plain.is_empty()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub async fn close(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            warn!(
                "Closing connection with {} unclaimed message id(s)",
                self.pending.len()
            );
        }
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn unsolicited_notification(message: LdapMessage) -> LdapError {
    match message.protocol_op {
        ProtocolOp::ExtendedResponse(resp) => {
            let name = resp.name.map(|oid| oid.to_string());
            warn!(
                "Unsolicited notification {} (result code {}): {}",
                name.as_deref().unwrap_or("(unnamed)"),
                resp.result.result_code,
                resp.result.diagnostic_message
            );
            LdapError::UnsolicitedNotification {
                name,
                result_code: resp.result.result_code,
                diagnostic: resp.result.diagnostic_message,
            }
        }
        other => LdapError::structural(format!(
            "message ID 0 is reserved for unsolicited notifications, got {}",
            other.name()
        )),
    }
}
