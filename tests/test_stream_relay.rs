//! Stream relay tests
//!
//! Ordering, termination and cancellation guarantees as observed by a caller
//! consuming `Dispatcher::submit_stream`.


use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use task_router::error::ErrorKind;
use task_router::protocol::{RawRunRequest, StreamEvent, StreamEventKind};
use task_router::testing::{MockTransport, StreamStep};
use test_helpers::{settle, test_config, TestRouter};
use tokio_test::{assert_pending, assert_ready};

fn raw(request_id: &str) -> RawRunRequest {
    RawRunRequest::new("bias_scan", request_id, json!({}))
}

fn frame(sequence: u64, kind: &str) -> StreamStep {
    StreamStep::Frame(json!({"sequence": sequence, "kind": kind, "payload": {"step": sequence}}))
}

async fn router_with_stream(steps: Vec<StreamStep>) -> TestRouter {
    let transport = Arc::new(MockTransport::new());
    transport.set_stream("bias_scan", steps);
    TestRouter::with_transport(test_config(), transport)
        .preflighted()
        .await
}

fn assert_contiguous(events: &[StreamEvent], request_id: &str) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
        assert_eq!(event.request_id, request_id);
    }
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "exactly one terminal frame expected");
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_caller_observes_exactly_the_backend_sequence() {
    let router = router_with_stream(vec![
        frame(0, "PROGRESS"),
        frame(1, "PROGRESS"),
        frame(2, "OUTPUT"),
        frame(3, "DONE"),
    ])
    .await;

    let events: Vec<StreamEvent> = router
        .dispatcher
        .submit_stream(raw("s-1"))
        .unwrap()
        .collect()
        .await;

    let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StreamEventKind::Progress,
            StreamEventKind::Progress,
            StreamEventKind::Output,
            StreamEventKind::Done,
        ]
    );
    assert_eq!(events[1].payload, json!({"step": 1}));
    assert_contiguous(&events, "s-1");
}

#[tokio::test]
async fn test_nothing_follows_done() {
    let router = router_with_stream(vec![
        frame(0, "OUTPUT"),
        frame(1, "DONE"),
        frame(2, "OUTPUT"),
        frame(3, "ERROR"),
    ])
    .await;

    let events: Vec<StreamEvent> = router
        .dispatcher
        .submit_stream(raw("s-1"))
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, StreamEventKind::Done);
}

#[tokio::test]
async fn test_backend_without_sequence_numbers_is_numbered_by_relay() {
    let router = router_with_stream(vec![
        StreamStep::Frame(json!({"kind": "progress", "payload": {"pct": 50}})),
        StreamStep::Frame(json!({"kind": "output"})),
        StreamStep::Frame(json!({"kind": "done"})),
    ])
    .await;

    let events: Vec<StreamEvent> = router
        .dispatcher
        .submit_stream(raw("s-1"))
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[1].payload, json!({}));
    assert_contiguous(&events, "s-1");
}

#[tokio::test]
async fn test_dropped_connection_synthesizes_truncation() {
    for steps in [
        vec![frame(0, "PROGRESS"), frame(1, "OUTPUT")],
        vec![frame(0, "PROGRESS"), StreamStep::Disconnect],
        vec![],
    ] {
        let router = router_with_stream(steps).await;

        let events: Vec<StreamEvent> = router
            .dispatcher
            .submit_stream(raw("s-1"))
            .unwrap()
            .collect()
            .await;

        let last = events.last().unwrap();
        assert_eq!(last.kind, StreamEventKind::Error);
        assert_eq!(last.payload["kind"], ErrorKind::UpstreamStreamTruncated.as_str());
        assert!(last.payload["message"].is_string());
        assert_contiguous(&events, "s-1");
    }
}

#[tokio::test]
async fn test_garbage_and_unknown_frames_are_malformed() {
    for bad in [
        StreamStep::Garbage("{not json".into()),
        StreamStep::Frame(json!({"kind": "HEARTBEAT"})),
        StreamStep::Frame(json!({"payload": {}})),
        StreamStep::Frame(json!(["PROGRESS"])),
        frame(5, "PROGRESS"),
    ] {
        let router = router_with_stream(vec![frame(0, "PROGRESS"), bad]).await;

        let events: Vec<StreamEvent> = router
            .dispatcher
            .submit_stream(raw("s-1"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].payload["kind"],
            ErrorKind::MalformedUpstreamResponse.as_str()
        );
    }
}

#[tokio::test]
async fn test_stream_exceeding_endpoint_timeout() {
    let router = router_with_stream(vec![
        frame(0, "PROGRESS"),
        StreamStep::Delay(Duration::from_secs(5)),
        frame(1, "DONE"),
    ])
    .await;

    let started = std::time::Instant::now();
    let events: Vec<StreamEvent> = router
        .dispatcher
        .submit_stream(raw("s-1"))
        .unwrap()
        .collect()
        .await;

    // default_timeout_ms = 1000 in the test config
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].payload["kind"], ErrorKind::UpstreamTimeout.as_str());
}

#[tokio::test]
async fn test_client_drop_cancels_upstream() {
    let router = router_with_stream(vec![frame(0, "PROGRESS"), StreamStep::Hang]).await;

    let mut stream = router.dispatcher.submit_stream(raw("s-drop")).unwrap();
    assert_eq!(stream.next().await.unwrap().kind, StreamEventKind::Progress);
    assert_eq!(router.dispatcher.open_streams(), 1);

    drop(stream);
    settle().await;

    assert_eq!(router.dispatcher.open_streams(), 0);
    assert_eq!(router.transport.cancelled_ids(), vec!["s-drop".to_string()]);
}

#[tokio::test]
async fn test_explicit_cancel_stops_events_immediately() {
    let router = router_with_stream(vec![frame(0, "PROGRESS"), StreamStep::Hang]).await;

    let mut stream = router.dispatcher.submit_stream(raw("s-cancel")).unwrap();
    stream.next().await.unwrap();

    {
        let mut next = tokio_test::task::spawn(stream.next());
        assert_pending!(next.poll());
    }

    stream.cancel();
    {
        let mut next = tokio_test::task::spawn(stream.next());
        assert_eq!(assert_ready!(next.poll()), None);
    }

    settle().await;
    assert_eq!(router.transport.cancelled_ids(), vec!["s-cancel".to_string()]);
    assert_eq!(router.dispatcher.open_streams(), 0);
}

#[tokio::test]
async fn test_completed_stream_is_not_cancelled() {
    let router = router_with_stream(vec![frame(0, "DONE")]).await;

    let events: Vec<StreamEvent> = router
        .dispatcher
        .submit_stream(raw("s-1"))
        .unwrap()
        .collect()
        .await;
    settle().await;

    assert_eq!(events.len(), 1);
    assert!(router.transport.cancelled_ids().is_empty());
}

#[tokio::test]
async fn test_stream_is_lazy() {
    let router = router_with_stream(vec![frame(0, "DONE")]).await;

    let stream = router.dispatcher.submit_stream(raw("s-lazy")).unwrap();
    settle().await;
    assert_eq!(router.transport.stream_call_count(), 0);

    drop(stream);
    settle().await;
    assert_eq!(router.transport.stream_call_count(), 0);
    assert!(router.transport.cancelled_ids().is_empty());
}

#[tokio::test]
async fn test_streaming_unsupported_for_blocking_agents() {
    let router = TestRouter::new(test_config()).preflighted().await;

    let err = router
        .dispatcher
        .submit_stream(RawRunRequest::new("perf_analysis", "s-1", json!({})))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StreamingUnsupported);
    assert_eq!(router.transport.total_call_count(), 0);
}

#[tokio::test]
async fn test_concurrent_streams_are_independent() {
    let router = router_with_stream(vec![
        frame(0, "PROGRESS"),
        StreamStep::Delay(Duration::from_millis(50)),
        frame(1, "DONE"),
    ])
    .await;

    let a = router.dispatcher.submit_stream(raw("a")).unwrap();
    let b = router.dispatcher.submit_stream(raw("b")).unwrap();
    let (a, b): (Vec<StreamEvent>, Vec<StreamEvent>) = tokio::join!(a.collect(), b.collect());

    assert_contiguous(&a, "a");
    assert_contiguous(&b, "b");
    assert_eq!(router.dispatcher.open_streams(), 0);
}
