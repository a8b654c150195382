//! The messaging transport the delivery core is built on. Connection
//! lifecycle, inbox allocation and the header codec live behind this trait;
//! the core only consumes it.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use jetstream_proto::{HeaderMap, Message};
use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// The request/reply rendering of broker-unavailable; participates in
    /// publish retry exactly like a 503 status reply.
    #[error("no responders for {0}")]
    NoResponders(String),

    #[error("connection closed")]
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub headers: Option<HeaderMap>,
    /// Use a dedicated inbox instead of the connection's request muxer.
    pub no_mux: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    pub queue_group: Option<String>,
    /// The transport auto-unsubscribes after this many messages.
    pub max_msgs: Option<usize>,
}

/// A raw transport subscription: frames arrive on a bounded channel.
#[derive(Debug)]
pub struct RawSubscription {
    pub sid: u64,
    pub messages: mpsc::Receiver<Message>,
}

/// Tags for transport/server feature probes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    /// Pull requests may carry `max_bytes` (server ≥ 2.8.3).
    PullMaxBytes,
}

#[derive(Clone, Debug)]
pub struct FeatureSupport {
    pub ok: bool,
    /// Minimum server version that introduced the feature.
    pub min: &'static str,
}

pub trait Transport: Send + Sync + 'static {
    fn request(
        &self,
        subject: String,
        payload: Bytes,
        options: RequestOptions,
    ) -> BoxFuture<'_, Result<Message, TransportError>>;

    fn publish(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    fn subscribe(
        &self,
        subject: String,
        options: SubscribeOptions,
    ) -> BoxFuture<'_, Result<RawSubscription, TransportError>>;

    fn unsubscribe(&self, sid: u64) -> BoxFuture<'_, Result<(), TransportError>>;

    fn create_inbox(&self) -> String;

    fn feature(&self, feature: Feature) -> FeatureSupport;

    fn is_connected(&self) -> bool;
}
