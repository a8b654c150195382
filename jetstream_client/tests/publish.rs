mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::*;
use jetstream_client::{JetStreamClient, JsError, PublishOptions};
use jetstream_proto::{header, HeaderMap, PubAck};

fn ack(stream: &str, seq: u64, duplicate: bool) -> PubAck {
    PubAck {
        stream: stream.to_string(),
        seq,
        duplicate,
        domain: None,
    }
}

#[tokio::test]
async fn carries_expectation_headers() {
    let transport = Arc::new(MockTransport::new());
    let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
    {
        let seen = seen.clone();
        transport.on_request(
            "orders.new",
            Box::new(move |request| {
                *seen.lock().unwrap() = request.headers.clone();
                Ok(api_reply(ack("ORDERS", 1, false)))
            }),
        );
    }

    let client = JetStreamClient::new(transport.clone());
    let acked = client
        .publish(
            "orders.new",
            Bytes::from_static(b"hello"),
            PublishOptions {
                msg_id: Some("m-1".into()),
                expected_stream: Some("ORDERS".into()),
                expected_last_sequence: Some(9),
                expected_last_msg_id: Some("m-0".into()),
                expected_last_subject_sequence: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(acked.stream, "ORDERS");
    assert_eq!(acked.seq, 1);
    assert!(!acked.duplicate);

    let headers = seen.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get(header::MSG_ID), Some("m-1"));
    assert_eq!(headers.get(header::EXPECTED_STREAM), Some("ORDERS"));
    assert_eq!(headers.get(header::EXPECTED_LAST_SEQUENCE), Some("9"));
    assert_eq!(headers.get(header::EXPECTED_LAST_MSG_ID), Some("m-0"));
    assert_eq!(headers.get(header::EXPECTED_LAST_SUBJECT_SEQUENCE), Some("4"));
}

#[tokio::test]
async fn republishing_a_msg_id_reports_a_duplicate() {
    let transport = Arc::new(MockTransport::new());
    let mut calls = 0;
    transport.on_request(
        "orders.new",
        Box::new(move |_| {
            calls += 1;
            Ok(api_reply(ack("ORDERS", 1, calls > 1)))
        }),
    );

    let client = JetStreamClient::new(transport.clone());
    let options = || PublishOptions {
        msg_id: Some("X".into()),
        ..Default::default()
    };

    let first = client
        .publish("orders.new", Bytes::from_static(b"hello"), options())
        .await
        .unwrap();
    assert!(!first.duplicate);

    let second = client
        .publish("orders.new", Bytes::from_static(b"hello"), options())
        .await
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.seq, first.seq);
}

#[tokio::test(start_paused = true)]
async fn retries_broker_unavailable_until_it_succeeds() {
    let transport = Arc::new(MockTransport::new());
    let mut calls = 0;
    transport.on_request(
        "orders.new",
        Box::new(move |_| {
            calls += 1;
            if calls < 3 {
                Ok(status_frame(503, "no responders available"))
            } else {
                Ok(api_reply(ack("ORDERS", 7, false)))
            }
        }),
    );

    let client = JetStreamClient::new(transport.clone());
    let acked = client
        .publish(
            "orders.new",
            Bytes::from_static(b"hello"),
            PublishOptions {
                retries: 3,
                retry_delay: Duration::from_millis(250),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(acked.seq, 7);
    assert_eq!(transport.request_count("orders.new"), 3);
}

#[tokio::test(start_paused = true)]
async fn broker_unavailable_surfaces_after_retries_are_exhausted() {
    let transport = Arc::new(MockTransport::new());
    transport.on_request(
        "orders.new",
        Box::new(|_| Ok(status_frame(503, "no responders available"))),
    );

    let client = JetStreamClient::new(transport.clone());
    let err = client
        .publish(
            "orders.new",
            Bytes::from_static(b"hello"),
            PublishOptions {
                retries: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("BrokerUnavailable"), "{err}");
    assert_eq!(transport.request_count("orders.new"), 2);
}

#[tokio::test]
async fn an_ack_without_a_stream_is_invalid_and_not_retried() {
    let transport = Arc::new(MockTransport::new());
    transport.on_request("orders.new", Box::new(|_| Ok(api_reply(ack("", 0, false)))));

    let client = JetStreamClient::new(transport.clone());
    let err = client
        .publish(
            "orders.new",
            Bytes::from_static(b"hello"),
            PublishOptions {
                retries: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, JsError::InvalidAck));
    assert_eq!(transport.request_count("orders.new"), 1);
}

#[tokio::test]
async fn api_errors_propagate_without_retry() {
    let transport = Arc::new(MockTransport::new());
    transport.on_request(
        "orders.new",
        Box::new(|_| {
            Ok(api_reply(serde_json::json!({
                "error": { "code": 400, "err_code": 10070, "description": "wrong last sequence" }
            })))
        }),
    );

    let client = JetStreamClient::new(transport.clone());
    let err = client
        .publish(
            "orders.new",
            Bytes::from_static(b"hello"),
            PublishOptions {
                retries: 3,
                expected_last_sequence: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("wrong last sequence"), "{err}");
    assert_eq!(transport.request_count("orders.new"), 1);
}
