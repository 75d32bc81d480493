use crate::config::TrafficConfig;
use crate::proxy::context::{BoxBody, BoxError};
use crate::store::Store;
use crate::upstream::prober::epoch_ms;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How a proxied response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream body was delivered in full.
    Complete,
    /// The client went away before the stream finished.
    ClientAbort,
    /// The upstream failed after bytes had been streamed.
    UpstreamAbort,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::ClientAbort => "client-abort",
            Outcome::UpstreamAbort => "upstream-abort",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "client-abort" => Outcome::ClientAbort,
            "upstream-abort" => Outcome::UpstreamAbort,
            _ => Outcome::Complete,
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One proxied request, written after the response stream settles.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub ts: u64,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub mirror_id: Option<i64>,
    pub upstream_status: u16,
    pub bytes_out: u64,
    pub duration_ms: u64,
    pub image_ref: Option<String>,
    pub outcome: Outcome,
}

struct QueueInner {
    records: Mutex<VecDeque<TrafficRecord>>,
    capacity: usize,
    batch_size: usize,
    notify: Notify,
    dropped: AtomicU64,
}

/// Bounded hand-off between the streaming hot path and the store writer.
/// `push` never blocks and never fails: when the queue is full the oldest
/// record is discarded and counted.
#[derive(Clone)]
pub struct TrafficQueue {
    inner: Arc<QueueInner>,
}

impl TrafficQueue {
    pub fn new(cfg: &TrafficConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                records: Mutex::new(VecDeque::with_capacity(cfg.queue_capacity)),
                capacity: cfg.queue_capacity,
                batch_size: cfg.batch_size,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn push(&self, record: TrafficRecord) {
        let should_wake = {
            let mut records = self.inner.records.lock().unwrap();
            if records.len() >= self.inner.capacity {
                records.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mirrorgate_traffic_dropped_total").increment(1);
            }
            records.push_back(record);
            records.len() >= self.inner.batch_size
        };
        // Wake the consumer only when a full batch is ready; the flush timer
        // handles stragglers.
        if should_wake {
            self.inner.notify.notify_one();
        }
    }

    pub fn drain(&self, max: usize) -> Vec<TrafficRecord> {
        let mut records = self.inner.records.lock().unwrap();
        let take = records.len().min(max);
        records.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    async fn batch_ready(&self) {
        self.inner.notify.notified().await;
    }
}

/// Drain the queue into the store in batches until shutdown. The single
/// consumer keeps SQLite writes off the request path entirely.
pub async fn run_consumer(
    queue: TrafficQueue,
    store: Store,
    cfg: TrafficConfig,
    shutdown: Arc<Notify>,
) {
    // Register for shutdown once, before any flush: `notify_waiters` does
    // not store a permit, so a future created after the signal would miss it.
    let shutdown_notified = shutdown.notified();
    tokio::pin!(shutdown_notified);

    loop {
        let stopping = tokio::select! {
            _ = tokio::time::sleep(cfg.flush_interval()) => false,
            _ = queue.batch_ready() => false,
            _ = shutdown_notified.as_mut() => true,
        };

        loop {
            let batch = queue.drain(cfg.batch_size);
            if batch.is_empty() {
                break;
            }
            let store = store.clone();
            let written = batch.len();
            let result =
                tokio::task::spawn_blocking(move || store.insert_traffic(&batch)).await;
            match result {
                Ok(Ok(())) => debug!("traffic: flushed batch, records={}", written),
                Ok(Err(e)) => warn!("traffic: batch write failed, records={}, error={}", written, e),
                Err(e) => warn!("traffic: writer task panicked: {}", e),
            }
        }

        if stopping {
            debug!("traffic: consumer stopped");
            return;
        }
    }
}

/// Everything known about a request before its response body streams.
pub struct PendingRecord {
    pub queue: TrafficQueue,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub mirror_id: Option<i64>,
    pub upstream_status: u16,
    pub image_ref: Option<String>,
    pub start: Instant,
}

impl PendingRecord {
    fn finalize(self, bytes_out: u64, outcome: Outcome) {
        metrics::counter!(
            "mirrorgate_bytes_streamed_total",
            "outcome" => outcome.as_str(),
        )
        .increment(bytes_out);
        self.queue.push(TrafficRecord {
            ts: epoch_ms(),
            client_ip: self.client_ip,
            method: self.method,
            path: self.path,
            mirror_id: self.mirror_id,
            upstream_status: self.upstream_status,
            bytes_out,
            duration_ms: self.start.elapsed().as_millis() as u64,
            image_ref: self.image_ref,
            outcome,
        });
    }
}

/// Byte-counting pass-through around the streamed upstream body.
///
/// Frames flow untouched; the wrapper only observes and enforces the
/// idle-during-stream cutoff. Exactly one record is emitted per response: at
/// end-of-stream, on a mid-stream upstream error or idle timeout, or from
/// `Drop` when the client disconnects and hyper discards the body.
pub struct CountingBody {
    inner: BoxBody,
    pending: Option<PendingRecord>,
    bytes: u64,
    idle_timeout: Duration,
    idle: Pin<Box<tokio::time::Sleep>>,
}

impl CountingBody {
    pub fn new(inner: BoxBody, pending: PendingRecord, idle_timeout: Duration) -> Self {
        Self {
            inner,
            pending: Some(pending),
            bytes: 0,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }

    fn settle(&mut self, outcome: Outcome) {
        if let Some(pending) = self.pending.take() {
            pending.finalize(self.bytes, outcome);
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.bytes += data.len() as u64;
                }
                let deadline = tokio::time::Instant::now() + self.idle_timeout;
                self.idle.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.settle(Outcome::UpstreamAbort);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.settle(Outcome::Complete);
                Poll::Ready(None)
            }
            Poll::Pending => {
                if self.idle.as_mut().poll(cx).is_ready() {
                    self.settle(Outcome::UpstreamAbort);
                    let err = std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "upstream idle during stream",
                    );
                    return Poll::Ready(Some(Err(err.into())));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        // Report end only once the record is settled, so the final
        // `poll_frame` → `None` always runs and completion is not
        // misclassified as a client abort by `Drop`.
        self.pending.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        // Reaching Drop with the record still pending means the stream never
        // finished — the client went away.
        self.settle(Outcome::ClientAbort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    fn test_cfg(capacity: usize, batch: usize) -> TrafficConfig {
        TrafficConfig {
            queue_capacity: capacity,
            batch_size: batch,
            flush_interval_secs: 1,
        }
    }

    fn record(path: &str) -> TrafficRecord {
        TrafficRecord {
            ts: 1,
            client_ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            mirror_id: Some(1),
            upstream_status: 200,
            bytes_out: 0,
            duration_ms: 1,
            image_ref: None,
            outcome: Outcome::Complete,
        }
    }

    fn pending(queue: &TrafficQueue) -> PendingRecord {
        PendingRecord {
            queue: queue.clone(),
            client_ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/v2/library/nginx/blobs/sha256:x".to_string(),
            mirror_id: Some(1),
            upstream_status: 200,
            image_ref: Some("library/nginx".to_string()),
            start: Instant::now(),
        }
    }

    #[test]
    fn full_queue_drops_oldest_without_blocking() {
        let queue = TrafficQueue::new(&test_cfg(3, 100));
        for i in 0..5 {
            queue.push(record(&format!("/r{i}")));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);

        let drained = queue.drain(10);
        let paths: Vec<&str> = drained.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/r2", "/r3", "/r4"]);
    }

    #[test]
    fn drain_respects_batch_size() {
        let queue = TrafficQueue::new(&test_cfg(100, 100));
        for i in 0..7 {
            queue.push(record(&format!("/r{i}")));
        }
        assert_eq!(queue.drain(5).len(), 5);
        assert_eq!(queue.drain(5).len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn counting_body_reports_exact_bytes_on_completion() {
        let queue = TrafficQueue::new(&test_cfg(16, 100));
        let payload = Bytes::from(vec![0xabu8; 4096]);
        let inner: BoxBody = Full::new(payload.clone())
            .map_err(|never| match never {})
            .boxed();

        let body = CountingBody::new(inner, pending(&queue), Duration::from_secs(60));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, payload);

        let records = queue.drain(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes_out, 4096);
        assert_eq!(records[0].outcome, Outcome::Complete);
    }

    #[tokio::test]
    async fn dropped_body_records_client_abort() {
        let queue = TrafficQueue::new(&test_cfg(16, 100));
        let inner: BoxBody = Full::new(Bytes::from_static(b"unsent"))
            .map_err(|never| match never {})
            .boxed();

        drop(CountingBody::new(inner, pending(&queue), Duration::from_secs(60)));

        let records = queue.drain(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes_out, 0);
        assert_eq!(records[0].outcome, Outcome::ClientAbort);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out_as_upstream_abort() {
        struct NeverBody;
        impl Body for NeverBody {
            type Data = Bytes;
            type Error = BoxError;
            fn poll_frame(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
                Poll::Pending
            }
        }

        let queue = TrafficQueue::new(&test_cfg(16, 100));
        let inner: BoxBody = BodyExt::boxed(NeverBody);
        let body = CountingBody::new(inner, pending(&queue), Duration::from_secs(60));

        assert!(body.collect().await.is_err());
        let records = queue.drain(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::UpstreamAbort);
    }

    #[tokio::test]
    async fn consumer_flushes_to_store_and_drains_on_shutdown() {
        let store = Store::open_in_memory().unwrap();
        let cfg = test_cfg(100, 2);
        let queue = TrafficQueue::new(&cfg);
        let shutdown = Arc::new(Notify::new());

        let consumer = tokio::spawn(run_consumer(
            queue.clone(),
            store.clone(),
            cfg,
            shutdown.clone(),
        ));

        queue.push(record("/a"));
        queue.push(record("/b"));
        queue.push(record("/c"));

        // Batch of two triggers a wake; the final record rides the timer or
        // the shutdown flush.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.notify_waiters();
        consumer.await.unwrap();

        assert_eq!(store.stats().unwrap().total_requests, 3);
        assert!(queue.is_empty());
    }
}
