//! The JetStream client: option normalization, consumer bind/create, publish
//! with expectation headers, one-shot pull, batched fetch and the
//! subscription factories.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use jetstream_proto::{
    header, AckPolicy, ApiResponse, ConsumerConfig, ConsumerCreateRequest, ConsumerDeleteResponse,
    ConsumerInfo, DirectGetRequest, FrameKind, HeaderMap, Message, PubAck, PullRequest,
    StreamNamesRequest, StreamNamesResponse,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time;

use crate::error::{classify, Classified, ClassifyContext, ErrorKind, JsError};
use crate::heartbeat::{IdleHeartbeatMonitor, DEFAULT_MAX_OUT};
use crate::message::JsMessage;
use crate::queued::{queued, Dispatched, Ingestion, MessageIterator, QueuedSink};
use crate::subscription::{
    self, DeliverCallback, JsPullSubscription, JsSubscription, SubscribeSetup, SubscriptionInfo,
};
use crate::transport::{
    Feature, RawSubscription, RequestOptions, SubscribeOptions, Transport, TransportError,
};

const DEFAULT_API_PREFIX: &str = "$JS.API";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

const ORDERED_IDLE_HEARTBEAT: Duration = Duration::from_secs(5);
const ORDERED_ACK_WAIT: Duration = Duration::from_secs(22 * 60 * 60);
const CREATE_ACK_WAIT: Duration = Duration::from_secs(30);

/// Internal feature registry; toggles exist to make otherwise racy server
/// conditions deterministically testable.
#[derive(Clone, Copy, Debug, Default)]
pub struct Toggles {
    /// Treat 409 `Exceeded MaxWaiting` as terminal instead of transient.
    pub fail_on_max_waiting: bool,
}

#[derive(Clone, Debug)]
pub struct JetStreamOptions {
    pub prefix: String,
    pub timeout: Duration,
    pub toggles: Toggles,
}

impl Default for JetStreamOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_API_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
            toggles: Toggles::default(),
        }
    }
}

/// How a consumer should be resolved or created for a subscription.
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// Resolved by subject lookup when absent.
    pub stream: Option<String>,
    pub durable_name: Option<String>,
    pub deliver_group: Option<String>,
    pub filter_subject: Option<String>,
    pub filter_subjects: Vec<String>,
    /// `None` means not set; defaults are applied during normalization.
    pub ack_policy: Option<AckPolicy>,
    pub deliver_policy: Option<jetstream_proto::DeliverPolicy>,
    pub opt_start_seq: Option<u64>,
    pub deliver_subject: Option<String>,
    pub idle_heartbeat: Option<Duration>,
    pub flow_control: bool,
    pub max_deliver: Option<i64>,
    pub ack_wait: Option<Duration>,
    pub max_waiting: Option<i64>,
    pub ordered: bool,
    /// Only bind to an existing consumer; never create one.
    pub bind_only: bool,
    pub manual_ack: bool,
    pub max_messages: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub msg_id: Option<String>,
    pub expected_stream: Option<String>,
    pub expected_last_sequence: Option<u64>,
    pub expected_last_msg_id: Option<String>,
    pub expected_last_subject_sequence: Option<u64>,
    /// Total wire requests allowed; only broker-unavailable is retried.
    pub retries: usize,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            msg_id: None,
            expected_stream: None,
            expected_last_sequence: None,
            expected_last_msg_id: None,
            expected_last_subject_sequence: None,
            retries: 1,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: None,
        }
    }
}

impl PublishOptions {
    fn headers(&self) -> Option<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(id) = &self.msg_id {
            headers.insert(header::MSG_ID, id.clone());
        }
        if let Some(stream) = &self.expected_stream {
            headers.insert(header::EXPECTED_STREAM, stream.clone());
        }
        if let Some(seq) = self.expected_last_sequence {
            headers.insert(header::EXPECTED_LAST_SEQUENCE, seq.to_string());
        }
        if let Some(id) = &self.expected_last_msg_id {
            headers.insert(header::EXPECTED_LAST_MSG_ID, id.clone());
        }
        if let Some(seq) = self.expected_last_subject_sequence {
            headers.insert(header::EXPECTED_LAST_SUBJECT_SEQUENCE, seq.to_string());
        }
        (!headers.is_empty()).then_some(headers)
    }
}

#[derive(Clone, Debug)]
pub struct FetchOptions {
    pub batch: usize,
    pub no_wait: bool,
    pub expires: Option<Duration>,
    pub max_bytes: Option<usize>,
    pub idle_heartbeat: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch: 1,
            no_wait: false,
            expires: None,
            max_bytes: None,
            idle_heartbeat: None,
        }
    }
}

/// Reply of [JetStreamClient::direct_get].
#[derive(Clone, Debug)]
pub struct DirectGetMessage {
    pub subject: String,
    pub seq: u64,
    pub time: String,
    pub stream: String,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

pub(crate) struct ProcessedOptions {
    pub info: SubscriptionInfo,
    pub ordered: bool,
    pub bind_only: bool,
    pub manual_ack: bool,
    pub max_messages: Option<usize>,
    pub requested_multi: bool,
}

#[derive(Clone)]
pub struct JetStreamClient {
    transport: Arc<dyn Transport>,
    options: Arc<JetStreamOptions>,
}

impl JetStreamClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, JetStreamOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: JetStreamOptions) -> Self {
        Self {
            transport,
            options: Arc::new(options),
        }
    }

    pub(crate) fn transport_handle(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn classify_context(&self) -> ClassifyContext {
        ClassifyContext {
            publish: false,
            fail_on_max_waiting: self.options.toggles.fail_on_max_waiting,
        }
    }

    pub(crate) fn api_subject(&self, operation: &str) -> String {
        format!("{}.{operation}", self.options.prefix)
    }

    /// Publishes to a stream subject and waits for the acknowledgment.
    pub async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<PubAck, JsError> {
        let headers = options.headers();
        let attempts = options.retries.max(1);
        let timeout = Some(options.timeout.unwrap_or(self.options.timeout));
        let context = ClassifyContext {
            publish: true,
            fail_on_max_waiting: self.options.toggles.fail_on_max_waiting,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                time::sleep(options.retry_delay).await;
            }

            let reply = match self
                .transport
                .request(
                    subject.to_string(),
                    payload.clone(),
                    RequestOptions {
                        timeout,
                        headers: headers.clone(),
                        no_mux: false,
                    },
                )
                .await
            {
                Ok(reply) => reply,
                Err(TransportError::NoResponders(_)) if attempt < attempts => {
                    log::debug!("broker unavailable publishing to {subject}, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if let Some(code) = reply.status {
                let description = reply.description.unwrap_or_default();
                match classify(code, &description, context) {
                    Classified::Transient(ErrorKind::BrokerUnavailable) if attempt < attempts => {
                        log::debug!("broker unavailable publishing to {subject}, retrying");
                        continue;
                    }
                    classified => {
                        return Err(classified.into_error(code, &description).unwrap_or_else(
                            || JsError::status(ErrorKind::RequestFailed, code, description),
                        ));
                    }
                }
            }

            let ack = serde_json::from_slice::<ApiResponse<PubAck>>(&reply.payload)?
                .into_result()?;
            if ack.stream.is_empty() {
                return Err(JsError::InvalidAck);
            }
            return Ok(ack);
        }
    }

    /// One-shot pull: requests and returns exactly one message.
    pub async fn pull(
        &self,
        stream: &str,
        durable: &str,
        expires: Duration,
    ) -> Result<JsMessage, JsError> {
        validate_name("stream", stream)?;
        validate_name("durable", durable)?;

        let no_wait = expires.is_zero();
        let request = PullRequest {
            batch: 1,
            no_wait,
            expires: (!no_wait).then(|| expires.as_nanos() as u64),
            ..Default::default()
        };
        let subject = self.api_subject(&format!("CONSUMER.MSG.NEXT.{stream}.{durable}"));
        let reply = self
            .transport
            .request(
                subject,
                Bytes::from(serde_json::to_vec(&request)?),
                RequestOptions {
                    timeout: Some(self.options.timeout.max(expires)),
                    headers: None,
                    no_mux: true,
                },
            )
            .await?;

        if let Some(code) = reply.status {
            let description = reply.description.clone().unwrap_or_default();
            return Err(classify(code, &description, self.classify_context())
                .into_error(code, &description)
                .unwrap_or_else(|| {
                    JsError::status(ErrorKind::RequestFailed, code, description)
                }));
        }
        JsMessage::from_frame(reply, self.transport.clone())
    }

    /// Requests up to `batch` messages and returns an iterator over them.
    pub async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        options: FetchOptions,
    ) -> Result<MessageIterator<JsMessage>, JsError> {
        validate_name("stream", stream)?;
        validate_name("durable", durable)?;

        let expires = options.expires.filter(|expires| !expires.is_zero());
        if !options.no_wait && expires.is_none() {
            return Err(JsError::Config(
                "fetch requires no_wait or a positive expires".into(),
            ));
        }
        if options.max_bytes.is_some() {
            let support = self.transport.feature(Feature::PullMaxBytes);
            if !support.ok {
                return Err(JsError::Config(format!(
                    "max_bytes on fetch requires server {}",
                    support.min
                )));
            }
        }
        if let Some(heartbeat) = options.idle_heartbeat {
            let expires = expires.ok_or_else(|| {
                JsError::Config("fetch with idle_heartbeat requires expires".into())
            })?;
            if expires <= heartbeat {
                return Err(JsError::Config(
                    "fetch expires must exceed idle_heartbeat".into(),
                ));
            }
        }

        let batch = options.batch.max(1);
        let inbox = self.transport.create_inbox();
        let raw = self
            .transport
            .subscribe(
                inbox.clone(),
                SubscribeOptions {
                    queue_group: None,
                    max_msgs: Some(batch),
                },
            )
            .await?;

        let (mut sink, mut iterator) = queued::<JsMessage>(batch.clamp(1, 1024));
        let received_bytes = Arc::new(AtomicUsize::new(0));
        if options.max_bytes.is_some() {
            let received_bytes = received_bytes.clone();
            sink.set_ingestion_filter(Box::new(move |msg: &JsMessage| {
                received_bytes.fetch_add(msg.payload.len(), Ordering::Relaxed);
                Ingestion {
                    ingest: true,
                    protocol: true,
                }
            }));
        }
        {
            let max_bytes = options.max_bytes;
            let mut received = 0usize;
            iterator.set_dispatched(Box::new(move |msg: &JsMessage| {
                received += 1;
                if msg.info.pending == 0 {
                    return Dispatched::Stop;
                }
                if received >= batch {
                    return Dispatched::Stop;
                }
                if let Some(cap) = max_bytes {
                    if received_bytes.load(Ordering::Relaxed) >= cap {
                        return Dispatched::Stop;
                    }
                }
                Dispatched::Continue
            }));
        }

        let (beats, misses) = mpsc::channel(4);
        let monitor = options.idle_heartbeat.map(|heartbeat| {
            IdleHeartbeatMonitor::new(
                heartbeat,
                DEFAULT_MAX_OUT,
                expires,
                Box::new(move |count| {
                    let _ = beats.try_send(count);
                    true
                }),
            )
        });

        tokio::spawn(fetch_pump(
            self.transport.clone(),
            raw,
            sink,
            misses,
            monitor,
            expires,
            self.classify_context(),
        ));

        let request = PullRequest {
            batch,
            no_wait: options.no_wait,
            max_bytes: options.max_bytes,
            expires: expires.map(|expires| expires.as_nanos() as u64),
            idle_heartbeat: options
                .idle_heartbeat
                .map(|heartbeat| heartbeat.as_nanos() as u64),
        };
        let subject = self.api_subject(&format!("CONSUMER.MSG.NEXT.{stream}.{durable}"));
        self.transport
            .publish(
                subject,
                Some(inbox),
                None,
                Bytes::from(serde_json::to_vec(&request)?),
            )
            .await?;

        Ok(iterator)
    }

    /// Push subscription delivering through an iterator.
    pub async fn subscribe(
        &self,
        subject: &str,
        options: ConsumerOptions,
    ) -> Result<JsSubscription, JsError> {
        self.check_push_options(&options)?;
        self.subscribe_inner(subject, options, None, false).await
    }

    /// Push subscription delivering through a callback; the callback sees
    /// transient errors the iterator variant hides.
    pub async fn subscribe_with_callback(
        &self,
        subject: &str,
        options: ConsumerOptions,
        callback: DeliverCallback,
    ) -> Result<JsSubscription, JsError> {
        self.check_push_options(&options)?;
        self.subscribe_inner(subject, options, Some(callback), false)
            .await
    }

    pub async fn pull_subscribe(
        &self,
        subject: &str,
        options: ConsumerOptions,
    ) -> Result<JsPullSubscription, JsError> {
        if options.ordered {
            return Err(JsError::Config("pull subscriptions cannot be ordered".into()));
        }
        if options.deliver_subject.is_some() {
            return Err(JsError::Config(
                "pull subscriptions cannot have a deliver subject".into(),
            ));
        }
        let sub = self.subscribe_inner(subject, options, None, true).await?;
        Ok(JsPullSubscription::new(sub))
    }

    fn check_push_options(&self, options: &ConsumerOptions) -> Result<(), JsError> {
        let deliverable = options.ordered
            || options.bind_only
            || options.deliver_subject.is_some()
            || options.durable_name.is_some();
        if !deliverable {
            return Err(JsError::Config(
                "push subscription requires a deliver subject, a durable to bind, or ordered"
                    .into(),
            ));
        }
        Ok(())
    }

    async fn subscribe_inner(
        &self,
        subject: &str,
        options: ConsumerOptions,
        callback: Option<DeliverCallback>,
        pull: bool,
    ) -> Result<JsSubscription, JsError> {
        let mut processed = self.process_options(subject, &options, pull).await?;

        // Subscribe before creating the consumer so no deliveries are lost.
        let raw = self
            .transport
            .subscribe(
                processed.info.deliver.clone(),
                SubscribeOptions {
                    queue_group: processed.info.config.deliver_group.clone(),
                    max_msgs: processed.max_messages,
                },
            )
            .await?;

        if let Err(err) = self.maybe_create_consumer(&mut processed).await {
            let _ = self.transport.unsubscribe(raw.sid).await;
            return Err(err);
        }

        let auto_ack =
            !processed.manual_ack && processed.info.config.ack_policy != AckPolicy::None;
        Ok(subscription::start(SubscribeSetup {
            client: self.clone(),
            raw,
            info: processed.info,
            ordered: processed.ordered,
            auto_ack,
            callback,
        }))
    }

    /// Resolves user options into concrete subscription state.
    pub(crate) async fn process_options(
        &self,
        subject: &str,
        opts: &ConsumerOptions,
        pull: bool,
    ) -> Result<ProcessedOptions, JsError> {
        if opts.ordered {
            if pull {
                return Err(JsError::Config("ordered consumers are push based".into()));
            }
            if !matches!(opts.ack_policy, None | Some(AckPolicy::None)) {
                return Err(JsError::Config(
                    "ordered consumers require ack policy none".into(),
                ));
            }
            if opts.durable_name.is_some() {
                return Err(JsError::Config("ordered consumers cannot be durable".into()));
            }
            if opts.deliver_subject.is_some() {
                return Err(JsError::Config(
                    "ordered consumers cannot set a deliver subject".into(),
                ));
            }
            if opts.deliver_group.is_some() {
                return Err(JsError::Config(
                    "ordered consumers cannot have a deliver group".into(),
                ));
            }
            if opts.max_deliver.map_or(false, |max| max > 1) {
                return Err(JsError::Config(
                    "ordered consumers allow at most one delivery".into(),
                ));
            }
        }

        let mut config = ConsumerConfig {
            durable_name: opts.durable_name.clone(),
            deliver_policy: opts.deliver_policy.unwrap_or_default(),
            opt_start_seq: opts.opt_start_seq,
            max_deliver: opts.max_deliver,
            filter_subject: opts.filter_subject.clone(),
            filter_subjects: (!opts.filter_subjects.is_empty())
                .then(|| opts.filter_subjects.clone()),
            deliver_subject: opts.deliver_subject.clone(),
            deliver_group: opts.deliver_group.clone(),
            idle_heartbeat: opts.idle_heartbeat.map(|heartbeat| heartbeat.as_nanos() as u64),
            flow_control: opts.flow_control,
            ack_wait: opts.ack_wait.map(|wait| wait.as_nanos() as u64),
            max_waiting: opts.max_waiting,
            ..Default::default()
        };
        let requested_multi = config.filter_subjects.is_some();

        if opts.ordered {
            config.deliver_subject = Some(self.transport.create_inbox());
            config.ack_policy = AckPolicy::None;
            config.max_deliver = Some(1);
            config.flow_control = true;
            if config.idle_heartbeat.is_none() {
                config.idle_heartbeat = Some(ORDERED_IDLE_HEARTBEAT.as_nanos() as u64);
            }
            config.ack_wait = Some(ORDERED_ACK_WAIT.as_nanos() as u64);
            config.mem_storage = true;
            config.num_replicas = Some(1);
        } else {
            config.ack_policy = match opts.ack_policy {
                Some(policy) => policy,
                None if pull => AckPolicy::Explicit,
                None => AckPolicy::All,
            };
        }
        if pull && config.ack_policy != AckPolicy::Explicit {
            return Err(JsError::Config(
                "pull subscriptions require explicit acknowledgment".into(),
            ));
        }

        let stream = match &opts.stream {
            Some(stream) => {
                validate_name("stream", stream)?;
                stream.clone()
            }
            None => self.find_stream(subject).await?,
        };

        let mut attached = false;
        let mut name = opts.durable_name.clone().unwrap_or_default();
        let mut last = None;
        if let Some(durable) = &opts.durable_name {
            validate_name("durable", durable)?;
            match self.consumer_info(&stream, durable).await {
                Ok(existing) => {
                    let requested = config.filter_subject.as_deref().unwrap_or(subject);
                    if let Some(filter) = existing.config.filter_subject.as_deref() {
                        if !filter.is_empty() && filter != requested {
                            return Err(JsError::Config(format!(
                                "subject {requested} does not match consumer filter subject {filter}"
                            )));
                        }
                    }
                    if existing.push_bound && config.deliver_group.is_none() {
                        return Err(JsError::Config(format!(
                            "duplicate subscription to consumer {durable}"
                        )));
                    }
                    match (
                        config.deliver_group.as_deref(),
                        existing.config.deliver_group.as_deref(),
                    ) {
                        (Some(requested), Some(group)) if requested != group => {
                            return Err(JsError::Config(format!(
                                "cannot create a queue subscription {requested} for a consumer in group {group}"
                            )));
                        }
                        (Some(requested), None) => {
                            return Err(JsError::Config(format!(
                                "cannot create a queue subscription {requested} for a consumer without a group"
                            )));
                        }
                        (None, Some(group)) => {
                            return Err(JsError::Config(format!(
                                "consumer expects queue group {group}"
                            )));
                        }
                        _ => {}
                    }
                    name = existing.name.clone();
                    config = existing.config.clone();
                    attached = true;
                    last = Some(existing);
                }
                Err(JsError::Api(err)) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        if !attached && config.filter_subject.is_none() && config.filter_subjects.is_none() {
            config.filter_subject = Some(subject.to_string());
        }

        let deliver = config
            .deliver_subject
            .clone()
            .unwrap_or_else(|| self.transport.create_inbox());

        Ok(ProcessedOptions {
            info: SubscriptionInfo {
                stream,
                config,
                deliver,
                attached,
                name,
                last,
                ordered_consumer_sequence: Default::default(),
                flow_control: Default::default(),
            },
            ordered: opts.ordered,
            bind_only: opts.bind_only,
            manual_ack: opts.manual_ack,
            max_messages: opts.max_messages,
            requested_multi,
        })
    }

    pub(crate) async fn maybe_create_consumer(
        &self,
        processed: &mut ProcessedOptions,
    ) -> Result<(), JsError> {
        if processed.info.attached {
            return Ok(());
        }
        if processed.bind_only {
            let durable = processed
                .info
                .config
                .durable_name
                .clone()
                .unwrap_or_default();
            return Err(JsError::Config(format!(
                "unable to bind: consumer {durable} not found on stream {}",
                processed.info.stream
            )));
        }

        let mut config = processed.info.config.clone();
        if config.ack_wait.is_none() {
            config.ack_wait = Some(CREATE_ACK_WAIT.as_nanos() as u64);
        }

        let created = self.create_consumer(&processed.info.stream, config).await?;
        if processed.requested_multi
            && created
                .config
                .filter_subjects
                .as_ref()
                .map_or(true, |filters| filters.is_empty())
        {
            return Err(JsError::Config(
                "server did not honor multiple filter subjects; a newer server is required"
                    .into(),
            ));
        }

        processed.info.name = created.name.clone();
        processed.info.config = created.config.clone();
        processed.info.last = Some(created);
        Ok(())
    }

    pub(crate) async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, JsError> {
        let request = ConsumerCreateRequest {
            stream_name: stream.to_string(),
            config,
        };
        self.api_request(
            self.api_subject(&format!("CONSUMER.CREATE.{stream}")),
            Bytes::from(serde_json::to_vec(&request)?),
        )
        .await
    }

    pub async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerInfo, JsError> {
        self.api_request(
            self.api_subject(&format!("CONSUMER.INFO.{stream}.{name}")),
            Bytes::new(),
        )
        .await
    }

    pub async fn delete_consumer(&self, stream: &str, name: &str) -> Result<(), JsError> {
        let _: ConsumerDeleteResponse = self
            .api_request(
                self.api_subject(&format!("CONSUMER.DELETE.{stream}.{name}")),
                Bytes::new(),
            )
            .await?;
        Ok(())
    }

    /// Fetches a message straight from the stream, bypassing consumers.
    pub async fn direct_get(
        &self,
        stream: &str,
        request: DirectGetRequest,
    ) -> Result<DirectGetMessage, JsError> {
        validate_name("stream", stream)?;
        if request.seq.is_none() && request.last_by_subj.is_none() {
            return Err(JsError::Config(
                "direct get requires seq or last_by_subj".into(),
            ));
        }

        let reply = self
            .transport
            .request(
                format!("$JS.API.DIRECT.GET.{stream}"),
                Bytes::from(serde_json::to_vec(&request)?),
                RequestOptions {
                    timeout: Some(self.options.timeout),
                    headers: None,
                    no_mux: false,
                },
            )
            .await?;

        if let Some(code) = reply.status {
            let description = reply.description.clone().unwrap_or_default();
            return Err(classify(code, &description, self.classify_context())
                .into_error(code, &description)
                .unwrap_or_else(|| {
                    JsError::status(ErrorKind::RequestFailed, code, description)
                }));
        }

        let get = |name: &str| -> Result<String, JsError> {
            reply
                .headers
                .get(name)
                .map(str::to_string)
                .ok_or_else(|| JsError::Config(format!("direct get reply is missing {name}")))
        };
        let seq = get(header::SEQUENCE)?
            .parse()
            .map_err(|_| JsError::Config("direct get reply carries a bad sequence".into()))?;
        Ok(DirectGetMessage {
            subject: get(header::SUBJECT)?,
            seq,
            time: get(header::TIME_STAMP)?,
            stream: get(header::STREAM)?,
            headers: reply.headers,
            payload: reply.payload,
        })
    }

    pub(crate) async fn find_stream(&self, subject: &str) -> Result<String, JsError> {
        let request = StreamNamesRequest {
            subject: Some(subject.to_string()),
        };
        let response: StreamNamesResponse = self
            .api_request(
                self.api_subject("STREAM.NAMES"),
                Bytes::from(serde_json::to_vec(&request)?),
            )
            .await?;
        response
            .streams
            .and_then(|streams| streams.into_iter().next())
            .ok_or_else(|| JsError::Config(format!("no stream matches subject {subject}")))
    }

    async fn api_request<T: DeserializeOwned>(
        &self,
        subject: String,
        payload: Bytes,
    ) -> Result<T, JsError> {
        let reply = self
            .transport
            .request(
                subject,
                payload,
                RequestOptions {
                    timeout: Some(self.options.timeout),
                    headers: None,
                    no_mux: false,
                },
            )
            .await?;

        if let Some(code) = reply.status {
            let description = reply.description.clone().unwrap_or_default();
            return Err(classify(code, &description, ClassifyContext::default())
                .into_error(code, &description)
                .unwrap_or_else(|| {
                    JsError::status(ErrorKind::RequestFailed, code, description)
                }));
        }

        let response: ApiResponse<T> = serde_json::from_slice(&reply.payload)?;
        Ok(response.into_result()?)
    }
}

async fn fetch_pump(
    transport: Arc<dyn Transport>,
    mut raw: RawSubscription,
    mut sink: QueuedSink<JsMessage>,
    mut misses: mpsc::Receiver<usize>,
    monitor: Option<IdleHeartbeatMonitor>,
    expires: Option<Duration>,
    context: ClassifyContext,
) {
    let cancel = sink.cancellation();
    let deadline = expires.map(|expires| time::Instant::now() + expires);

    loop {
        let expiry = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = expiry => {
                // Drain frames that already arrived, then end quietly.
                while let Ok(frame) = raw.messages.try_recv() {
                    if fetch_frame(&transport, &mut sink, monitor.as_ref(), frame, context)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
                sink.stop(None).await;
                break;
            }
            Some(count) = misses.recv() => {
                sink.stop(Some(JsError::status(
                    ErrorKind::IdleHeartbeatMissed,
                    409,
                    format!("Idle Heartbeats Missed: {count}"),
                )))
                .await;
                break;
            }
            frame = raw.messages.recv() => match frame {
                Some(frame) => {
                    if fetch_frame(&transport, &mut sink, monitor.as_ref(), frame, context)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
                None => {
                    sink.stop(None).await;
                    break;
                }
            },
        }
    }

    if let Some(monitor) = monitor {
        monitor.cancel();
    }
    let _ = transport.unsubscribe(raw.sid).await;
}

async fn fetch_frame(
    transport: &Arc<dyn Transport>,
    sink: &mut QueuedSink<JsMessage>,
    monitor: Option<&IdleHeartbeatMonitor>,
    frame: Message,
    context: ClassifyContext,
) -> ControlFlow<()> {
    if let Some(monitor) = monitor {
        monitor.work();
    }

    match frame.frame_kind() {
        FrameKind::Heartbeat => ControlFlow::Continue(()),
        FrameKind::FlowControl => {
            if let Some(reply) = frame.reply {
                let _ = transport.publish(reply, None, None, Bytes::new()).await;
            }
            ControlFlow::Continue(())
        }
        FrameKind::Status(code) => {
            let description = frame.description.unwrap_or_default();
            match classify(code, &description, context) {
                Classified::None => {
                    log::debug!("ignoring status {code} during fetch");
                    ControlFlow::Continue(())
                }
                Classified::Transient(ErrorKind::NoMessages | ErrorKind::RequestTimeout) => {
                    sink.stop(None).await;
                    ControlFlow::Break(())
                }
                Classified::Transient(kind) => {
                    log::debug!("ignoring transient {kind} during fetch");
                    ControlFlow::Continue(())
                }
                Classified::Terminal(kind) => {
                    sink.stop(Some(JsError::status(kind, code, description))).await;
                    ControlFlow::Break(())
                }
            }
        }
        FrameKind::Data => match JsMessage::from_frame(frame, transport.clone()) {
            Ok(msg) => {
                if !sink.push(msg).await {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            Err(err) => {
                log::warn!("dropping fetch frame without JetStream metadata: {err}");
                ControlFlow::Continue(())
            }
        },
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), JsError> {
    if name.is_empty() {
        return Err(JsError::Config(format!("{kind} name is required")));
    }
    if name.contains(['.', '*', '>', ' ', '\t']) {
        return Err(JsError::Config(format!(
            "{kind} name cannot contain '.', '*', '>' or whitespace: {name}"
        )));
    }
    Ok(())
}
