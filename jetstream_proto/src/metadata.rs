//! JetStream delivery metadata is embedded in the reply subject of every data
//! frame: `$JS.ACK.<stream>.<consumer>.<delivered>.<stream seq>.<consumer seq>.
//! <timestamp>.<pending>`, optionally preceded by `<domain>.<account hash>`
//! right after `ACK` on newer servers.

pub const ACK_PREFIX: &str = "$JS.ACK.";

const V1_TOKENS: usize = 9;
const V2_TOKENS: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsMessageInfo {
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered (1 for the first attempt).
    pub delivery_count: u64,
    pub stream_seq: u64,
    pub delivery_seq: u64,
    pub timestamp_ns: u64,
    /// Messages still pending on the consumer after this delivery.
    pub pending: u64,
    pub domain: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InfoError {
    #[error("reply subject is not a JetStream ack: {0}")]
    NotAnAck(String),

    #[error("JetStream ack subject has an unexpected token count: {0}")]
    BadTokenCount(usize),

    #[error("JetStream ack subject carries a non-numeric token: {0}")]
    BadNumber(String),
}

pub fn parse_message_info(reply: &str) -> Result<JsMessageInfo, InfoError> {
    if !reply.starts_with(ACK_PREFIX) {
        return Err(InfoError::NotAnAck(reply.to_string()));
    }

    let tokens: Vec<&str> = reply.split('.').collect();
    let (domain, rest) = match tokens.len() {
        V1_TOKENS => (None, &tokens[2..]),
        // `_` marks the default domain.
        n if n >= V2_TOKENS => {
            let domain = match tokens[2] {
                "_" => None,
                d => Some(d.to_string()),
            };
            (domain, &tokens[4..])
        }
        n => return Err(InfoError::BadTokenCount(n)),
    };

    let number = |token: &str| -> Result<u64, InfoError> {
        token
            .parse()
            .map_err(|_| InfoError::BadNumber(token.to_string()))
    };

    Ok(JsMessageInfo {
        stream: rest[0].to_string(),
        consumer: rest[1].to_string(),
        delivery_count: number(rest[2])?,
        stream_seq: number(rest[3])?,
        delivery_seq: number(rest[4])?,
        timestamp_ns: number(rest[5])?,
        pending: number(rest[6])?,
        domain,
    })
}
