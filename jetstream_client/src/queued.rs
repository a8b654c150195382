//! A bounded, cancellable sequence of typed values fed by a subscription's
//! pump task. The hooks are captured as function values to keep the ingress
//! path branch-light: the ingestion filter splits a frame into payload vs.
//! protocol observation, the protocol filter drops protocol-only frames
//! before enqueue, and the dispatched hook runs on the consumer side after
//! each yield (batch accounting, auto-ack).

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::JsError;

pub(crate) struct Ingestion {
    /// Hand the payload to the application.
    pub ingest: bool,
    /// Count the frame for flow-control and ordering bookkeeping even when
    /// the payload is discarded.
    pub protocol: bool,
}

pub(crate) type IngestionFilter<T> = Box<dyn FnMut(&T) -> Ingestion + Send>;
pub(crate) type ProtocolFilter<T> = Box<dyn FnMut(&T, bool) -> bool + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Continue,
    Stop,
}

pub(crate) type DispatchedFn<T> = Box<dyn FnMut(&T) -> Dispatched + Send>;
pub(crate) type PostYieldFn<T> = Box<dyn FnMut(&T) -> BoxFuture<'static, ()> + Send>;

pub(crate) fn queued<T>(capacity: usize) -> (QueuedSink<T>, MessageIterator<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let cancel = CancellationToken::new();
    (
        QueuedSink {
            tx: Some(tx),
            ingestion_filter: None,
            protocol_filter: None,
            cancel: cancel.clone(),
        },
        MessageIterator {
            messages: ReceiverStream::new(rx),
            dispatched: None,
            post_yield: None,
            in_flight: None,
            cancel,
            done: false,
        },
    )
}

/// Producer half, owned by the subscription's pump task.
pub(crate) struct QueuedSink<T> {
    tx: Option<mpsc::Sender<Result<T, JsError>>>,
    ingestion_filter: Option<IngestionFilter<T>>,
    protocol_filter: Option<ProtocolFilter<T>>,
    cancel: CancellationToken,
}

impl<T> QueuedSink<T> {
    pub fn set_ingestion_filter(&mut self, filter: IngestionFilter<T>) {
        self.ingestion_filter = Some(filter);
    }

    pub fn set_protocol_filter(&mut self, filter: ProtocolFilter<T>) {
        self.protocol_filter = Some(filter);
    }

    /// Fires when the consumer half stops or a terminal error was delivered.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the hooks and enqueues the item if both keep it. Returns false
    /// once the consumer half is gone.
    pub async fn push(&mut self, item: T) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };

        let ingest = match self.ingestion_filter.as_mut() {
            Some(filter) => {
                let decision = filter(&item);
                if !decision.ingest && !decision.protocol {
                    return true;
                }
                decision.ingest
            }
            None => true,
        };

        let keep = match self.protocol_filter.as_mut() {
            Some(filter) => filter(&item, ingest),
            None => true,
        };
        if !keep || !ingest {
            return true;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = tx.send(Ok(item)) => sent.is_ok(),
        }
    }

    /// Ends the sequence: with an error the next consumer read surfaces it,
    /// without one the iterator simply runs dry. Idempotent.
    pub async fn stop(&mut self, err: Option<JsError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if let Some(err) = err {
            let _ = tx.send(Err(err)).await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_none()
    }
}

/// An item whose post-yield action is still running; held across polls so
/// the action finishes before the item is handed out.
struct InFlight<T> {
    item: T,
    after: BoxFuture<'static, ()>,
    finished: bool,
}

/// Consumer half, handed to the application.
pub struct MessageIterator<T> {
    messages: ReceiverStream<Result<T, JsError>>,
    dispatched: Option<DispatchedFn<T>>,
    post_yield: Option<PostYieldFn<T>>,
    in_flight: Option<InFlight<T>>,
    cancel: CancellationToken,
    done: bool,
}

impl<T> std::fmt::Debug for MessageIterator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIterator")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T> MessageIterator<T> {
    pub(crate) fn set_dispatched(&mut self, hook: DispatchedFn<T>) {
        self.dispatched = Some(hook);
    }

    pub(crate) fn set_post_yield(&mut self, hook: PostYieldFn<T>) {
        self.post_yield = Some(hook);
    }

    /// Stops the producer side; already-yielded items are unaffected.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.done = true;
        self.cancel.cancel();
    }
}

impl<T: Unpin> MessageIterator<T> {
    /// Next item, or the stop error, or `None` once the sequence ended.
    pub async fn next(&mut self) -> Option<Result<T, JsError>> {
        StreamExt::next(self).await
    }
}

impl<T: Unpin> Stream for MessageIterator<T> {
    type Item = Result<T, JsError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(mut in_flight) = this.in_flight.take() {
                match in_flight.after.poll_unpin(cx) {
                    Poll::Pending => {
                        this.in_flight = Some(in_flight);
                        return Poll::Pending;
                    }
                    Poll::Ready(()) => {
                        if in_flight.finished {
                            this.stop();
                        }
                        return Poll::Ready(Some(Ok(in_flight.item)));
                    }
                }
            }

            if this.done {
                return Poll::Ready(None);
            }

            match this.messages.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    this.cancel.cancel();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(Ok(item))) => {
                    let mut finished = false;
                    if let Some(hook) = this.dispatched.as_mut() {
                        finished = hook(&item) == Dispatched::Stop;
                    }
                    if let Some(hook) = this.post_yield.as_mut() {
                        let after = hook(&item);
                        this.in_flight = Some(InFlight {
                            item,
                            after,
                            finished,
                        });
                        continue;
                    }
                    if finished {
                        this.stop();
                    }
                    return Poll::Ready(Some(Ok(item)));
                }
            }
        }
    }
}

impl<T> Drop for MessageIterator<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn yields_in_order_then_runs_dry() {
        let (mut sink, mut iter) = queued::<u32>(8);
        assert!(sink.push(1).await);
        assert!(sink.push(2).await);
        sink.stop(None).await;

        assert!(matches!(iter.next().await, Some(Ok(1))));
        assert!(matches!(iter.next().await, Some(Ok(2))));
        assert!(iter.next().await.is_none());
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn iterates_as_a_stream() {
        let (mut sink, iter) = queued::<u32>(8);
        for n in 1..=3 {
            sink.push(n).await;
        }
        sink.stop(None).await;

        let collected: Vec<u32> = iter.map(|item| item.unwrap()).collect().await;
        assert_eq!(collected, [1, 2, 3]);
    }

    #[tokio::test]
    async fn stop_error_surfaces_once() {
        let (mut sink, mut iter) = queued::<u32>(8);
        sink.push(1).await;
        sink.stop(Some(JsError::InvalidAck)).await;
        // A second stop is a no-op.
        sink.stop(Some(JsError::InvalidAck)).await;

        assert!(matches!(iter.next().await, Some(Ok(1))));
        assert!(matches!(iter.next().await, Some(Err(JsError::InvalidAck))));
        assert!(iter.next().await.is_none());
    }

    #[tokio::test]
    async fn protocol_filter_drops_frames() {
        let (mut sink, mut iter) = queued::<u32>(8);
        sink.set_protocol_filter(Box::new(|item, _ingest| item % 2 == 0));
        for n in 0..5 {
            sink.push(n).await;
        }
        sink.stop(None).await;

        let mut seen = vec![];
        while let Some(Ok(n)) = iter.next().await {
            seen.push(n);
        }
        assert_eq!(seen, [0, 2, 4]);
    }

    #[tokio::test]
    async fn ingestion_filter_discards_payload_but_still_reaches_protocol_filter() {
        let (mut sink, mut iter) = queued::<u32>(8);
        let seen_by_protocol = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = seen_by_protocol.clone();

        sink.set_ingestion_filter(Box::new(|item| Ingestion {
            ingest: *item < 10,
            protocol: true,
        }));
        sink.set_protocol_filter(Box::new(move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            true
        }));

        sink.push(1).await;
        sink.push(99).await;
        sink.stop(None).await;

        assert!(matches!(iter.next().await, Some(Ok(1))));
        assert!(iter.next().await.is_none());
        assert_eq!(seen_by_protocol.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn dispatched_stop_cancels_the_producer() {
        let (mut sink, mut iter) = queued::<u32>(8);
        iter.set_dispatched(Box::new(|item| {
            if *item >= 2 {
                Dispatched::Stop
            } else {
                Dispatched::Continue
            }
        }));
        let cancelled = sink.cancellation();

        for n in 1..=3 {
            sink.push(n).await;
        }

        assert!(matches!(iter.next().await, Some(Ok(1))));
        assert!(matches!(iter.next().await, Some(Ok(2))));
        assert!(iter.next().await.is_none());
        assert!(cancelled.is_cancelled());
    }

    #[tokio::test]
    async fn post_yield_runs_per_item() {
        let (mut sink, mut iter) = queued::<u32>(8);
        let acked = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = acked.clone();
        iter.set_post_yield(Box::new(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })
        }));

        sink.push(1).await;
        sink.push(2).await;
        sink.stop(None).await;
        while iter.next().await.is_some() {}

        assert_eq!(acked.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
