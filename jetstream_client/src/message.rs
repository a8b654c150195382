use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use jetstream_proto::{parse_message_info, HeaderMap, JsMessageInfo, Message};

use crate::error::JsError;
use crate::transport::Transport;

/// A data frame with its JetStream metadata, bound to the transport so it can
/// be acknowledged.
#[derive(Clone)]
pub struct JsMessage {
    pub subject: String,
    pub headers: HeaderMap,
    pub payload: Bytes,
    pub info: JsMessageInfo,
    reply: String,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for JsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsMessage")
            .field("subject", &self.subject)
            .field("payload", &self.payload)
            .field("info", &self.info)
            .field("reply", &self.reply)
            .finish()
    }
}

impl JsMessage {
    pub(crate) fn from_frame(
        frame: Message,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, JsError> {
        let reply = frame.reply.unwrap_or_default();
        let info = parse_message_info(&reply)?;
        Ok(Self {
            subject: frame.subject,
            headers: frame.headers,
            payload: frame.payload,
            info,
            reply,
            transport,
        })
    }

    pub async fn ack(&self) -> Result<(), JsError> {
        self.respond(jetstream_proto::ACK).await
    }

    /// Asks for redelivery.
    pub async fn nak(&self) -> Result<(), JsError> {
        self.respond(jetstream_proto::NAK).await
    }

    /// Resets the ack-wait timer while processing continues.
    pub async fn working(&self) -> Result<(), JsError> {
        self.respond(jetstream_proto::WORKING).await
    }

    /// Tells the server to stop redelivering this message.
    pub async fn term(&self) -> Result<(), JsError> {
        self.respond(jetstream_proto::TERM).await
    }

    async fn respond(&self, body: &'static [u8]) -> Result<(), JsError> {
        if self.reply.is_empty() {
            return Ok(());
        }
        self.transport
            .publish(self.reply.clone(), None, None, Bytes::from_static(body))
            .await?;
        Ok(())
    }

    /// A detached handle that can acknowledge this message after it has been
    /// moved elsewhere (auto-ack in callback mode).
    pub(crate) fn ack_handle(&self) -> AckHandle {
        AckHandle {
            reply: self.reply.clone(),
            transport: self.transport.clone(),
        }
    }
}

pub(crate) struct AckHandle {
    reply: String,
    transport: Arc<dyn Transport>,
}

impl AckHandle {
    pub async fn ack(self) {
        if self.reply.is_empty() {
            return;
        }
        if let Err(err) = self
            .transport
            .publish(self.reply, None, None, Bytes::from_static(jetstream_proto::ACK))
            .await
        {
            log::warn!("auto-ack failed: {err}");
        }
    }
}
