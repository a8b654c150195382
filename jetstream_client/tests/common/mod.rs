//! Scripted in-memory transport: records every publish and request, answers
//! API subjects from per-test handlers, and lets tests inject frames into
//! subscribed inboxes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use jetstream_client::{
    Feature, FeatureSupport, RawSubscription, RequestOptions, SubscribeOptions, Transport,
    TransportError,
};
use jetstream_proto::{header, HeaderMap, Message};
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct Published {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
}

pub type RequestHandler = Box<dyn FnMut(&Published) -> Result<Message, TransportError> + Send>;
/// Returns frames to deliver as `(subject, frame)` pairs.
pub type PublishHandler = Box<dyn FnMut(&Published) -> Vec<(String, Message)> + Send>;

struct Sub {
    sender: mpsc::Sender<Message>,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    subs: HashMap<u64, Sub>,
    by_subject: HashMap<String, u64>,
    published: Vec<Published>,
    requests: Vec<Published>,
    request_handlers: Vec<(String, RequestHandler)>,
    publish_handlers: Vec<(String, PublishHandler)>,
}

pub struct MockTransport {
    inner: Mutex<Inner>,
    inbox_seq: AtomicU64,
    sid_seq: AtomicU64,
    connected: AtomicBool,
    max_bytes_supported: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            inbox_seq: AtomicU64::new(0),
            sid_seq: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            max_bytes_supported: AtomicBool::new(false),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(&self, prefix: &str, handler: RequestHandler) {
        self.inner
            .lock()
            .unwrap()
            .request_handlers
            .push((prefix.to_string(), handler));
    }

    pub fn on_publish(&self, prefix: &str, handler: PublishHandler) {
        self.inner
            .lock()
            .unwrap()
            .publish_handlers
            .push((prefix.to_string(), handler));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn support_max_bytes(&self) {
        self.max_bytes_supported.store(true, Ordering::Relaxed);
    }

    /// Injects a frame into a subscribed inbox. Returns false when nothing
    /// listens on the subject.
    pub fn deliver(&self, subject: &str, frame: Message) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(&sid) = inner.by_subject.get(subject) else {
            return false;
        };
        let Some(sub) = inner.subs.get_mut(&sid) else {
            return false;
        };
        if sub.sender.try_send(frame).is_err() {
            return false;
        }
        let mut exhausted = false;
        if let Some(remaining) = sub.remaining.as_mut() {
            *remaining -= 1;
            exhausted = *remaining == 0;
        }
        if exhausted {
            inner.subs.remove(&sid);
            inner.by_subject.remove(subject);
        }
        true
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn requests(&self) -> Vec<Published> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|request| request.subject.starts_with(prefix))
            .count()
    }

    pub fn published_to(&self, prefix: &str) -> Vec<Published> {
        self.inner
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|published| published.subject.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn subscription_subjects(&self) -> Vec<String> {
        self.inner.lock().unwrap().by_subject.keys().cloned().collect()
    }

    pub fn has_subscription(&self, subject: &str) -> bool {
        self.inner.lock().unwrap().by_subject.contains_key(subject)
    }
}

impl Transport for MockTransport {
    fn request(
        &self,
        subject: String,
        payload: Bytes,
        options: RequestOptions,
    ) -> BoxFuture<'_, Result<Message, TransportError>> {
        Box::pin(async move {
            let request = Published {
                subject: subject.clone(),
                reply: None,
                headers: options.headers,
                payload,
            };
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(request.clone());
            let handler = inner
                .request_handlers
                .iter_mut()
                .find(|(prefix, _)| subject.starts_with(prefix.as_str()));
            match handler {
                Some((_, handler)) => handler(&request),
                None => Err(TransportError::Timeout),
            }
        })
    }

    fn publish(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let published = Published {
                subject: subject.clone(),
                reply,
                headers,
                payload,
            };
            let frames = {
                let mut inner = self.inner.lock().unwrap();
                inner.published.push(published.clone());
                let handler = inner
                    .publish_handlers
                    .iter_mut()
                    .find(|(prefix, _)| subject.starts_with(prefix.as_str()));
                match handler {
                    Some((_, handler)) => handler(&published),
                    None => vec![],
                }
            };
            for (subject, frame) in frames {
                self.deliver(&subject, frame);
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        subject: String,
        options: SubscribeOptions,
    ) -> BoxFuture<'_, Result<RawSubscription, TransportError>> {
        Box::pin(async move {
            let sid = self.sid_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let (sender, messages) = mpsc::channel(1024);
            let mut inner = self.inner.lock().unwrap();
            inner.subs.insert(
                sid,
                Sub {
                    sender,
                    remaining: options.max_msgs,
                },
            );
            inner.by_subject.insert(subject, sid);
            Ok(RawSubscription { sid, messages })
        })
    }

    fn unsubscribe(&self, sid: u64) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.subs.remove(&sid);
            inner.by_subject.retain(|_, &mut existing| existing != sid);
            Ok(())
        })
    }

    fn create_inbox(&self) -> String {
        let n = self.inbox_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("_INBOX.{n}")
    }

    fn feature(&self, feature: Feature) -> FeatureSupport {
        match feature {
            Feature::PullMaxBytes => FeatureSupport {
                ok: self.max_bytes_supported.load(Ordering::Relaxed),
                min: "2.8.3",
            },
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// Frame constructors.

pub fn status_frame(code: u16, description: &str) -> Message {
    Message {
        status: Some(code),
        description: Some(description.to_string()),
        ..Default::default()
    }
}

pub fn data_frame(
    subject: &str,
    stream: &str,
    consumer: &str,
    delivery_seq: u64,
    stream_seq: u64,
    pending: u64,
    payload: &[u8],
) -> Message {
    Message {
        subject: subject.to_string(),
        reply: Some(format!(
            "$JS.ACK.{stream}.{consumer}.1.{stream_seq}.{delivery_seq}.1700000000000000000.{pending}"
        )),
        payload: Bytes::copy_from_slice(payload),
        ..Default::default()
    }
}

pub fn heartbeat_frame(last_consumer: u64, stalled: Option<&str>) -> Message {
    let mut headers = HeaderMap::new();
    headers.insert(header::LAST_CONSUMER, last_consumer.to_string());
    if let Some(subject) = stalled {
        headers.insert(header::CONSUMER_STALLED, subject.to_string());
    }
    Message {
        headers,
        status: Some(100),
        description: Some("Idle Heartbeat".to_string()),
        ..Default::default()
    }
}

pub fn flow_control_frame(reply: &str) -> Message {
    Message {
        reply: Some(reply.to_string()),
        status: Some(100),
        description: Some("FlowControl Request".to_string()),
        ..Default::default()
    }
}

pub fn api_reply(payload: impl serde::Serialize) -> Message {
    Message {
        payload: Bytes::from(serde_json::to_vec(&payload).unwrap()),
        ..Default::default()
    }
}

pub fn not_found_reply() -> Message {
    api_reply(serde_json::json!({
        "error": { "code": 404, "err_code": 10014, "description": "consumer not found" }
    }))
}

/// Echoes the requested consumer config back as the created consumer, the way
/// the broker acknowledges a create.
pub fn echo_consumer_create(name_prefix: &'static str) -> RequestHandler {
    let mut count = 0u64;
    Box::new(move |request: &Published| {
        let create: jetstream_proto::ConsumerCreateRequest =
            serde_json::from_slice(&request.payload).unwrap();
        count += 1;
        let name = create
            .config
            .durable_name
            .clone()
            .unwrap_or_else(|| format!("{name_prefix}{count}"));
        Ok(api_reply(jetstream_proto::ConsumerInfo {
            stream_name: create.stream_name,
            name,
            config: create.config,
            delivered: Default::default(),
            ack_floor: Default::default(),
            num_ack_pending: 0,
            num_redelivered: 0,
            num_waiting: 0,
            num_pending: 0,
            push_bound: false,
        }))
    })
}

/// Polls until `cond` holds; panics after ~1s of simulated or real time.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
