//! JetStream subscriptions. One pump task per subscription receives raw
//! frames from the transport inbox, multiplexes them (data, flow control,
//! heartbeats, status) and feeds the application through a queued iterator
//! or a callback. Ordered consumers additionally verify the delivery
//! sequence and silently recreate the server-side consumer on a gap.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use jetstream_proto::{
    header, ConsumerConfig, ConsumerInfo, DeliverPolicy, FrameKind, Message, PullRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::JetStreamClient;
use crate::error::{classify, Classified, ClassifyContext, JsError};
use crate::heartbeat::{IdleHeartbeatMonitor, DEFAULT_MAX_OUT};
use crate::message::JsMessage;
use crate::queued::{queued, MessageIterator, QueuedSink};
use crate::transport::{Feature, SubscribeOptions, RawSubscription, Transport};

/// Sequences recorded for the ordered-consumer invariant: `delivery_seq`
/// advances by exactly one per accepted message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderedConsumerSequence {
    pub stream_seq: u64,
    pub delivery_seq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowControlStats {
    pub heartbeat_count: u64,
    pub fc_count: u64,
    pub consumer_restarts: u64,
}

/// What the user options resolved to for one subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    pub stream: String,
    pub config: ConsumerConfig,
    /// Inbox the server delivers to.
    pub deliver: String,
    /// Bound to a pre-existing consumer rather than created by us.
    pub attached: bool,
    /// Server-assigned consumer name.
    pub name: String,
    pub last: Option<ConsumerInfo>,
    pub ordered_consumer_sequence: OrderedConsumerSequence,
    pub flow_control: FlowControlStats,
}

pub type DeliverCallback = Box<dyn FnMut(Result<JsMessage, JsError>) + Send>;

enum DeliverTarget {
    Queue(QueuedSink<JsMessage>),
    Callback(DeliverCallback),
}

pub(crate) struct SubscribeSetup {
    pub client: JetStreamClient,
    pub raw: RawSubscription,
    pub info: SubscriptionInfo,
    pub ordered: bool,
    pub auto_ack: bool,
    pub callback: Option<DeliverCallback>,
}

const QUEUE_CAPACITY: usize = 1024;

pub(crate) fn start(setup: SubscribeSetup) -> JsSubscription {
    let SubscribeSetup {
        client,
        raw,
        info,
        ordered,
        auto_ack,
        callback,
    } = setup;

    let transport = client.transport_handle();
    let sid = raw.sid;
    let context = client.classify_context();
    let idle_heartbeat = info
        .config
        .deliver_subject
        .as_ref()
        .and(info.config.idle_heartbeat)
        .filter(|nanos| *nanos > 0)
        .map(Duration::from_nanos);

    let info = Arc::new(Mutex::new(info));
    let monitor = Arc::new(Mutex::new(None));
    let (hb_tx, hb_rx) = mpsc::channel(8);

    if let Some(interval) = idle_heartbeat {
        let beats = hb_tx.clone();
        *monitor.lock().unwrap() = Some(IdleHeartbeatMonitor::new(
            interval,
            DEFAULT_MAX_OUT,
            None,
            Box::new(move |count| {
                let _ = beats.try_send(count);
                true
            }),
        ));
    }

    let (target, iterator, cancel) = match callback {
        Some(callback) => {
            let cancel = CancellationToken::new();
            (DeliverTarget::Callback(callback), None, cancel)
        }
        None => {
            let (sink, mut iterator) = queued(QUEUE_CAPACITY);
            if auto_ack {
                iterator.set_post_yield(Box::new(|msg: &JsMessage| {
                    let handle = msg.ack_handle();
                    Box::pin(handle.ack())
                }));
            }
            let cancel = sink.cancellation();
            (DeliverTarget::Queue(sink), Some(iterator), cancel)
        }
    };

    let pump = Pump {
        transport: transport.clone(),
        client: client.clone(),
        raw,
        target,
        info: info.clone(),
        monitor: monitor.clone(),
        hb_rx,
        cancel: cancel.clone(),
        ordered,
        auto_ack,
        context,
    };
    let pump = tokio::spawn(pump.run());

    JsSubscription {
        client,
        transport,
        info,
        monitor,
        hb_tx,
        iterator,
        cancel,
        sid,
        pump: Some(pump),
        closed: false,
    }
}

pub struct JsSubscription {
    client: JetStreamClient,
    transport: Arc<dyn Transport>,
    info: Arc<Mutex<SubscriptionInfo>>,
    monitor: Arc<Mutex<Option<IdleHeartbeatMonitor>>>,
    hb_tx: mpsc::Sender<usize>,
    iterator: Option<MessageIterator<JsMessage>>,
    cancel: CancellationToken,
    sid: u64,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for JsSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsSubscription")
            .field("sid", &self.sid)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl JsSubscription {
    /// Next message, or the terminal error, or `None` once the subscription
    /// ended. Always `None` in callback mode.
    pub async fn next(&mut self) -> Option<Result<JsMessage, JsError>> {
        match self.iterator.as_mut() {
            Some(iterator) => iterator.next().await,
            None => None,
        }
    }

    /// Moves the message iterator out, e.g. to hand it to a worker task.
    pub fn take_messages(&mut self) -> Option<MessageIterator<JsMessage>> {
        self.iterator.take()
    }

    pub fn info(&self) -> SubscriptionInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn consumer_restarts(&self) -> u64 {
        self.info.lock().unwrap().flow_control.consumer_restarts
    }

    /// Stops the pump and the transport subscription. Messages already
    /// buffered remain readable. Idempotent.
    pub async fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.cancel();
        }
        let _ = self.transport.unsubscribe(self.sid).await;
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }

    /// Stops receiving and lets buffered messages be consumed.
    pub async fn drain(&mut self) {
        self.unsubscribe().await;
    }

    /// Drains, then deletes the server-side consumer.
    pub async fn destroy(&mut self) -> Result<(), JsError> {
        self.drain().await;
        let (stream, name) = {
            let info = self.info.lock().unwrap();
            (info.stream.clone(), info.config.durable_name.clone().unwrap_or_else(|| info.name.clone()))
        };
        if name.is_empty() {
            return Err(JsError::Config("consumer name unknown; nothing to destroy".into()));
        }
        self.client.delete_consumer(&stream, &name).await
    }

    /// Fetches fresh [ConsumerInfo] and caches it as `last`.
    pub async fn consumer_info(&self) -> Result<ConsumerInfo, JsError> {
        let (stream, name) = {
            let info = self.info.lock().unwrap();
            (info.stream.clone(), info.config.durable_name.clone().unwrap_or_else(|| info.name.clone()))
        };
        let fresh = self.client.consumer_info(&stream, &name).await?;
        self.info.lock().unwrap().last = Some(fresh.clone());
        Ok(fresh)
    }
}

impl Drop for JsSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.cancel();
        }
    }
}

/// Options for an explicit [JsPullSubscription::pull].
#[derive(Clone, Debug)]
pub struct PullOptions {
    pub batch: usize,
    pub no_wait: bool,
    pub max_bytes: Option<usize>,
    pub expires: Option<Duration>,
    pub idle_heartbeat: Option<Duration>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            batch: 1,
            no_wait: false,
            max_bytes: None,
            expires: None,
            idle_heartbeat: None,
        }
    }
}

#[derive(Debug)]
pub struct JsPullSubscription {
    sub: JsSubscription,
}

impl JsPullSubscription {
    pub(crate) fn new(sub: JsSubscription) -> Self {
        Self { sub }
    }

    pub async fn next(&mut self) -> Option<Result<JsMessage, JsError>> {
        self.sub.next().await
    }

    pub fn info(&self) -> SubscriptionInfo {
        self.sub.info()
    }

    pub async fn unsubscribe(&mut self) {
        self.sub.unsubscribe().await;
    }

    pub async fn drain(&mut self) {
        self.sub.drain().await;
    }

    pub async fn destroy(&mut self) -> Result<(), JsError> {
        self.sub.destroy().await
    }

    pub async fn consumer_info(&self) -> Result<ConsumerInfo, JsError> {
        self.sub.consumer_info().await
    }

    /// Asks the server for the next batch of messages on this consumer.
    pub async fn pull(&self, options: PullOptions) -> Result<(), JsError> {
        if options.max_bytes.is_some() {
            let support = self.sub.transport.feature(Feature::PullMaxBytes);
            if !support.ok {
                return Err(JsError::Config(format!(
                    "max_bytes on pull requires server {}",
                    support.min
                )));
            }
        }
        if let Some(heartbeat) = options.idle_heartbeat {
            let expires = options
                .expires
                .filter(|expires| !expires.is_zero())
                .ok_or_else(|| {
                    JsError::Config("pull with idle_heartbeat requires expires".into())
                })?;
            if expires <= heartbeat {
                return Err(JsError::Config(
                    "pull expires must exceed idle_heartbeat".into(),
                ));
            }
        }

        {
            let mut slot = self.sub.monitor.lock().unwrap();
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            if let (Some(heartbeat), Some(expires)) = (options.idle_heartbeat, options.expires) {
                let beats = self.sub.hb_tx.clone();
                *slot = Some(IdleHeartbeatMonitor::new(
                    heartbeat,
                    DEFAULT_MAX_OUT,
                    Some(expires),
                    Box::new(move |count| {
                        let _ = beats.try_send(count);
                        true
                    }),
                ));
            }
        }

        let (stream, consumer, deliver) = {
            let info = self.sub.info.lock().unwrap();
            let consumer = info
                .config
                .durable_name
                .clone()
                .unwrap_or_else(|| info.name.clone());
            (info.stream.clone(), consumer, info.deliver.clone())
        };

        let request = PullRequest {
            batch: options.batch.max(1),
            no_wait: options.no_wait,
            max_bytes: options.max_bytes,
            expires: options.expires.map(|expires| expires.as_nanos() as u64),
            idle_heartbeat: options
                .idle_heartbeat
                .map(|heartbeat| heartbeat.as_nanos() as u64),
        };
        let subject = self
            .sub
            .client
            .api_subject(&format!("CONSUMER.MSG.NEXT.{stream}.{consumer}"));
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        self.sub
            .transport
            .publish(subject, Some(deliver), None, payload)
            .await?;
        Ok(())
    }
}

struct Pump {
    transport: Arc<dyn Transport>,
    client: JetStreamClient,
    raw: RawSubscription,
    target: DeliverTarget,
    info: Arc<Mutex<SubscriptionInfo>>,
    monitor: Arc<Mutex<Option<IdleHeartbeatMonitor>>>,
    hb_rx: mpsc::Receiver<usize>,
    cancel: CancellationToken,
    ordered: bool,
    auto_ack: bool,
    context: ClassifyContext,
}

impl Pump {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(count) = self.hb_rx.recv() => {
                    if self.on_missed_heartbeat(count).await.is_break() {
                        break;
                    }
                }
                frame = self.raw.messages.recv() => match frame {
                    Some(frame) => {
                        if self.process(frame).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.finish(None).await;
    }

    fn work(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().as_ref() {
            monitor.work();
        }
    }

    async fn process(&mut self, frame: Message) -> ControlFlow<()> {
        self.work();
        match frame.frame_kind() {
            FrameKind::Heartbeat => self.on_heartbeat(frame).await,
            FrameKind::FlowControl => {
                self.on_flow_control(frame).await;
                ControlFlow::Continue(())
            }
            FrameKind::Status(code) => self.on_status(code, frame).await,
            FrameKind::Data => self.on_data(frame).await,
        }
    }

    async fn on_heartbeat(&mut self, frame: Message) -> ControlFlow<()> {
        let recorded = {
            let mut info = self.info.lock().unwrap();
            info.flow_control.heartbeat_count += 1;
            info.ordered_consumer_sequence
        };

        if self.ordered {
            let last_delivered = frame
                .headers
                .get(header::LAST_CONSUMER)
                .and_then(|value| value.parse::<u64>().ok());
            if let Some(last_delivered) = last_delivered {
                if last_delivered != recorded.delivery_seq {
                    log::debug!(
                        "heartbeat reports consumer sequence {last_delivered}, recorded {}",
                        recorded.delivery_seq
                    );
                    return self.recreate(recorded.stream_seq + 1).await;
                }
            }
        }

        if let Some(stalled) = frame.headers.get(header::CONSUMER_STALLED) {
            let _ = self
                .transport
                .publish(stalled.to_string(), None, None, Bytes::new())
                .await;
        }
        ControlFlow::Continue(())
    }

    async fn on_flow_control(&mut self, frame: Message) {
        self.info.lock().unwrap().flow_control.fc_count += 1;
        if let Some(reply) = frame.reply {
            let _ = self.transport.publish(reply, None, None, Bytes::new()).await;
        }
    }

    async fn on_status(&mut self, code: u16, frame: Message) -> ControlFlow<()> {
        let description = frame.description.unwrap_or_default();
        match classify(code, &description, self.context) {
            Classified::None => {
                log::debug!("ignoring unknown protocol frame with status {code}");
                ControlFlow::Continue(())
            }
            Classified::Transient(kind) => {
                match &mut self.target {
                    DeliverTarget::Queue(_) => {
                        log::debug!("hiding transient {kind} from iterator");
                    }
                    DeliverTarget::Callback(callback) => {
                        callback(Err(JsError::status(kind, code, description)));
                    }
                }
                ControlFlow::Continue(())
            }
            Classified::Terminal(kind) => {
                self.finish(Some(JsError::status(kind, code, description)))
                    .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_data(&mut self, frame: Message) -> ControlFlow<()> {
        let msg = match JsMessage::from_frame(frame, self.transport.clone()) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("dropping frame without JetStream metadata: {err}");
                return ControlFlow::Continue(());
            }
        };

        if self.ordered {
            let recorded = self.info.lock().unwrap().ordered_consumer_sequence;
            let expected = recorded.delivery_seq + 1;
            if msg.info.delivery_seq != expected {
                log::debug!(
                    "delivery sequence gap: expected {expected}, got {}",
                    msg.info.delivery_seq
                );
                return self.recreate(recorded.stream_seq + 1).await;
            }
            let mut info = self.info.lock().unwrap();
            info.ordered_consumer_sequence.delivery_seq = msg.info.delivery_seq;
            info.ordered_consumer_sequence.stream_seq = msg.info.stream_seq;
        }

        let delivered = match &mut self.target {
            DeliverTarget::Queue(sink) => sink.push(msg).await,
            DeliverTarget::Callback(callback) => {
                let ack = self.auto_ack.then(|| msg.ack_handle());
                callback(Ok(msg));
                if let Some(handle) = ack {
                    handle.ack().await;
                }
                true
            }
        };
        if !delivered {
            self.finish(None).await;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn on_missed_heartbeat(&mut self, count: usize) -> ControlFlow<()> {
        if self.ordered {
            if !self.transport.is_connected() {
                return ControlFlow::Continue(());
            }
            let stream_seq = self
                .info
                .lock()
                .unwrap()
                .ordered_consumer_sequence
                .stream_seq;
            return self.recreate(stream_seq + 1).await;
        }

        let synthetic = Message {
            status: Some(409),
            description: Some(format!("Idle Heartbeats Missed: {count}")),
            ..Default::default()
        };
        self.on_status(409, synthetic).await
    }

    /// Silently moves the ordered consumer to a fresh inbox starting at
    /// `start_seq`. Invisible to the iterator on success; terminal on
    /// failure.
    async fn recreate(&mut self, start_seq: u64) -> ControlFlow<()> {
        let stream = self.info.lock().unwrap().stream.clone();
        let new_deliver = self.transport.create_inbox();

        let fresh = match self
            .transport
            .subscribe(new_deliver.clone(), SubscribeOptions::default())
            .await
        {
            Ok(fresh) => fresh,
            Err(err) => {
                self.finish(Some(JsError::OrderedRecreate {
                    stream,
                    sequence: start_seq,
                    reason: err.to_string(),
                }))
                .await;
                return ControlFlow::Break(());
            }
        };
        let old = std::mem::replace(&mut self.raw, fresh);
        let _ = self.transport.unsubscribe(old.sid).await;

        let config = {
            let mut info = self.info.lock().unwrap();
            info.ordered_consumer_sequence.delivery_seq = 0;
            info.flow_control.heartbeat_count = 0;
            info.flow_control.fc_count = 0;
            info.flow_control.consumer_restarts += 1;
            info.deliver = new_deliver.clone();
            info.config.name = None;
            info.config.deliver_subject = Some(new_deliver);
            info.config.deliver_policy = DeliverPolicy::ByStartSequence;
            info.config.opt_start_seq = Some(start_seq);
            info.config.clone()
        };
        self.work();

        match self.client.create_consumer(&stream, config).await {
            Ok(created) => {
                let mut info = self.info.lock().unwrap();
                info.name = created.name.clone();
                info.config = created.config.clone();
                info.last = Some(created);
                ControlFlow::Continue(())
            }
            Err(err) => {
                self.finish(Some(JsError::OrderedRecreate {
                    stream,
                    sequence: start_seq,
                    reason: err.to_string(),
                }))
                .await;
                ControlFlow::Break(())
            }
        }
    }

    /// Tears the subscription down. Idempotent.
    async fn finish(&mut self, err: Option<JsError>) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.cancel();
        }
        match &mut self.target {
            DeliverTarget::Queue(sink) => sink.stop(err).await,
            DeliverTarget::Callback(callback) => {
                if let Some(err) = err {
                    callback(Err(err));
                }
            }
        }
        let _ = self.transport.unsubscribe(self.raw.sid).await;
    }
}
