use std::fmt;

use jetstream_proto::{ApiError, InfoError};

use crate::transport::TransportError;

/// The conditions a subscription or request can run into. `Display` is the
/// CamelCase name itself so user-visible error strings always carry it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NoMessages,
    RequestTimeout,
    MaxBatchExceeded,
    MaxExpiresExceeded,
    MaxBytesExceeded,
    MaxMessageSizeExceeded,
    MaxWaitingExceeded,
    IdleHeartbeatMissed,
    ConsumerDeleted,
    ConsumerIsPushBased,
    InvalidAck,
    RequestFailed,
    BrokerUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoMessages => "NoMessages",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::MaxBatchExceeded => "MaxBatchExceeded",
            ErrorKind::MaxExpiresExceeded => "MaxExpiresExceeded",
            ErrorKind::MaxBytesExceeded => "MaxBytesExceeded",
            ErrorKind::MaxMessageSizeExceeded => "MaxMessageSizeExceeded",
            ErrorKind::MaxWaitingExceeded => "MaxWaitingExceeded",
            ErrorKind::IdleHeartbeatMissed => "IdleHeartbeatMissed",
            ErrorKind::ConsumerDeleted => "ConsumerDeleted",
            ErrorKind::ConsumerIsPushBased => "ConsumerIsPushBased",
            ErrorKind::InvalidAck => "InvalidAck",
            ErrorKind::RequestFailed => "RequestFailed",
            ErrorKind::BrokerUnavailable => "BrokerUnavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JsError {
    #[error("{kind} (status {status}): {description}")]
    Status {
        kind: ErrorKind,
        status: u16,
        description: String,
    },

    #[error("InvalidAck: publish acknowledgment did not name a stream")]
    InvalidAck,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Metadata(#[from] InfoError),

    #[error("malformed api payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("ordered consumer recreate failed for stream {stream} at sequence {sequence}: {reason}")]
    OrderedRecreate {
        stream: String,
        sequence: u64,
        reason: String,
    },
}

impl JsError {
    pub(crate) fn status(kind: ErrorKind, status: u16, description: impl Into<String>) -> Self {
        JsError::Status {
            kind,
            status,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            JsError::Status { kind, .. } => Some(*kind),
            JsError::InvalidAck => Some(ErrorKind::InvalidAck),
            _ => None,
        }
    }
}

/// Whether the surrounding operation changes how a status is classified.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassifyContext {
    pub publish: bool,
    pub fail_on_max_waiting: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classified {
    None,
    Transient(ErrorKind),
    Terminal(ErrorKind),
}

impl Classified {
    pub(crate) fn into_error(self, status: u16, description: &str) -> Option<JsError> {
        match self {
            Classified::None => None,
            Classified::Transient(kind) | Classified::Terminal(kind) => {
                Some(JsError::status(kind, status, description))
            }
        }
    }
}

/// Server phrasings of the 409 conditions that end a pull.
const TERMINAL_CONFLICTS: &[(&str, ErrorKind)] = &[
    ("exceeded maxrequestbatch", ErrorKind::MaxBatchExceeded),
    ("exceeded maxrequestexpires", ErrorKind::MaxExpiresExceeded),
    ("exceeded maxrequestmaxbytes", ErrorKind::MaxBytesExceeded),
    ("message size exceeds maxbytes", ErrorKind::MaxMessageSizeExceeded),
    ("consumer deleted", ErrorKind::ConsumerDeleted),
    ("consumer is push based", ErrorKind::ConsumerIsPushBased),
];

pub fn classify(status: u16, description: &str, context: ClassifyContext) -> Classified {
    match status {
        100 => Classified::None,
        code if (200..300).contains(&code) => Classified::None,
        404 => Classified::Transient(ErrorKind::NoMessages),
        408 => Classified::Transient(ErrorKind::RequestTimeout),
        409 => classify_conflict(description, context),
        503 => {
            if context.publish {
                Classified::Transient(ErrorKind::BrokerUnavailable)
            } else {
                Classified::Terminal(ErrorKind::BrokerUnavailable)
            }
        }
        _ => Classified::Terminal(ErrorKind::RequestFailed),
    }
}

fn classify_conflict(description: &str, context: ClassifyContext) -> Classified {
    let description = description.to_ascii_lowercase();

    for (needle, kind) in TERMINAL_CONFLICTS {
        if description.contains(needle) {
            return Classified::Terminal(*kind);
        }
    }

    if description.contains("exceeded maxwaiting") {
        return if context.fail_on_max_waiting {
            Classified::Terminal(ErrorKind::MaxWaitingExceeded)
        } else {
            Classified::Transient(ErrorKind::MaxWaitingExceeded)
        };
    }

    if description.contains("idle heartbeats missed") {
        return Classified::Transient(ErrorKind::IdleHeartbeatMissed);
    }

    Classified::Terminal(ErrorKind::RequestFailed)
}
