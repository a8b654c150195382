//! Client-side JetStream delivery core. Turns the transport's publish /
//! subscribe / request primitives into one-shot pulls, batched fetches and
//! long-lived push, ordered and pull subscriptions, handling consumer
//! bind/create, flow control, idle-heartbeat liveness, ordered-consumer
//! recovery and publish acknowledgments with expectation headers.

mod client;
mod error;
mod heartbeat;
mod message;
mod queued;
mod subscription;
mod transport;

pub use client::{
    ConsumerOptions, DirectGetMessage, FetchOptions, JetStreamClient, JetStreamOptions,
    PublishOptions, Toggles,
};
pub use error::{classify, Classified, ClassifyContext, ErrorKind, JsError};
pub use heartbeat::{IdleHeartbeatMonitor, MissHandler, DEFAULT_MAX_OUT};
pub use message::JsMessage;
pub use queued::MessageIterator;
pub use subscription::{
    DeliverCallback, FlowControlStats, JsPullSubscription, JsSubscription,
    OrderedConsumerSequence, PullOptions, SubscriptionInfo,
};
pub use transport::{
    Feature, FeatureSupport, RawSubscription, RequestOptions, SubscribeOptions, Transport,
    TransportError,
};
