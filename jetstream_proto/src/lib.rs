mod api;
mod metadata;

pub mod header;

pub use api::{
    AckPolicy, ApiError, ApiResponse, ConsumerConfig, ConsumerCreateRequest,
    ConsumerDeleteResponse, ConsumerInfo, DeliverPolicy, DirectGetRequest, PubAck, PullRequest,
    ReplayPolicy, SequenceInfo, StreamNamesRequest, StreamNamesResponse,
};
pub use header::{HeaderMap, HeaderName, HeaderValue};
pub use metadata::{parse_message_info, InfoError, JsMessageInfo};

use bytes::Bytes;

/// Acknowledgement bodies understood by the broker on ack reply subjects.
pub const ACK: &[u8] = b"+ACK";
pub const NAK: &[u8] = b"-NAK";
pub const WORKING: &[u8] = b"+WPI";
pub const TERM: &[u8] = b"+TERM";

/// A message as handed over by the transport.
///
/// Payload-less frames carry the status line of their `NATS/1.0 <code> <description>`
/// header block in `status`/`description`; data frames leave both unset.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: HeaderMap,
    pub payload: Bytes,
    pub status: Option<u16>,
    pub description: Option<String>,
}

/// What a frame on a consumer inbox turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A payload-carrying message with JetStream metadata in its reply subject.
    Data,
    /// Headers-only 100 frame; the server expects an empty reply on its reply subject.
    FlowControl,
    /// Headers-only 100 frame marking an idle consumer; carries [header::LAST_CONSUMER].
    Heartbeat,
    /// Any other status code (404/408/409/503).
    Status(u16),
}

impl Message {
    pub fn frame_kind(&self) -> FrameKind {
        match self.status {
            None => FrameKind::Data,
            Some(100) => {
                let heartbeat = self
                    .description
                    .as_deref()
                    .map(|d| d.to_ascii_lowercase().contains("idle heartbeat"))
                    .unwrap_or(false);
                if heartbeat {
                    FrameKind::Heartbeat
                } else {
                    FrameKind::FlowControl
                }
            }
            Some(code) => FrameKind::Status(code),
        }
    }
}
