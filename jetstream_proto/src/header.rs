use std::collections::HashMap;

// Publish headers.
pub const MSG_ID: &str = "Nats-Msg-Id";
pub const EXPECTED_STREAM: &str = "Nats-Expected-Stream";
pub const EXPECTED_LAST_SEQUENCE: &str = "Nats-Expected-Last-Sequence";
pub const EXPECTED_LAST_MSG_ID: &str = "Nats-Expected-Last-Msg-Id";
pub const EXPECTED_LAST_SUBJECT_SEQUENCE: &str = "Nats-Expected-Last-Subject-Sequence";

// Heartbeat headers.
pub const LAST_CONSUMER: &str = "Nats-Last-Consumer";
pub const CONSUMER_STALLED: &str = "Nats-Consumer-Stalled";

// Direct-get reply headers.
pub const SUBJECT: &str = "Nats-Subject";
pub const SEQUENCE: &str = "Nats-Sequence";
pub const TIME_STAMP: &str = "Nats-Time-Stamp";
pub const STREAM: &str = "Nats-Stream";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeaderName(String);

impl<T: Into<String>> From<T> for HeaderName {
    fn from(value: T) -> Self {
        Self(value.into())
    }
}

impl HeaderName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderValue(String);

impl<T: Into<String>> From<T> for HeaderValue {
    fn from(value: T) -> Self {
        Self(value.into())
    }
}

impl HeaderValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap(HashMap<HeaderName, Vec<HeaderValue>>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous values stored under `name`.
    pub fn insert(&mut self, name: impl Into<HeaderName>, value: impl Into<HeaderValue>) {
        self.0.insert(name.into(), vec![value.into()]);
    }

    pub fn append(&mut self, name: impl Into<HeaderName>, value: impl Into<HeaderValue>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&HeaderName(name.to_string()))
            .and_then(|values| values.first())
            .map(HeaderValue::as_str)
    }

    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &str> {
        self.0
            .get(&HeaderName(name.to_string()))
            .into_iter()
            .flatten()
            .map(HeaderValue::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &[HeaderValue])> {
        self.0.iter().map(|(name, values)| (name, values.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces() {
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID, "a");
        headers.insert(MSG_ID, "b");
        assert_eq!(headers.get(MSG_ID), Some("b"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn append_accumulates() {
        let mut headers = HeaderMap::new();
        headers.append("X-Custom", "one");
        headers.append("X-Custom", "two");
        assert_eq!(headers.get("X-Custom"), Some("one"));
        assert_eq!(headers.get_all("X-Custom").collect::<Vec<_>>(), ["one", "two"]);
    }

    #[test]
    fn missing() {
        let headers = HeaderMap::new();
        assert_eq!(headers.get(LAST_CONSUMER), None);
        assert!(headers.is_empty());
    }
}
