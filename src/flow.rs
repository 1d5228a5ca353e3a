//! Flow control: metric-limited buffering, batching, and throttling.

use crate::{
    common::*,
    buffered::{stream, stream_with, DefaultStream},
    config::{ConnectOptions, StreamOptions},
    deferred::Deferred,
    graph::{anchor_edge, connect},
    rt,
    stream::{EventSink, EventSource, EventStream, PutResult, TakeResult},
};

// buffered view

struct BufferShared<T> {
    metric: Box<dyn Fn(&T) -> usize + Send + Sync>,
    limit: usize,
    size: AtomicUsize,
    last_put: Mutex<Deferred<bool>>,
}

/// A view over an unbounded inner stream with a soft limit on the summed
/// metric of buffered messages.
///
/// Every put is accepted immediately; once the counter crosses the limit,
/// puts hand back a shared deferred that resolves only when takes bring the
/// counter back to the limit or below. The timed put variant does not
/// enforce its timeout against that gate — a known limitation; callers that
/// need a hard deadline must filter on the consumer side.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    inner: DefaultStream<T>,
    #[derivative(Debug = "ignore")]
    shared: Arc<BufferShared<T>>,
}

impl<T> Clone for BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Creates a metric-limited buffered stream.
pub fn buffered_stream<T>(
    metric: impl Fn(&T) -> usize + Send + Sync + 'static,
    limit: usize,
) -> BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    BufferedStream {
        inner: stream_with(StreamOptions::default().capacity(usize::MAX)),
        shared: Arc::new(BufferShared {
            metric: Box::new(metric),
            limit,
            size: AtomicUsize::new(0),
            last_put: Mutex::new(Deferred::resolved(true)),
        }),
    }
}

impl<T> BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    fn settle(shared: &BufferShared<T>, msg: &T) {
        let cost = (shared.metric)(msg);
        let previous = shared.size.fetch_sub(cost, SeqCst);
        if previous > shared.limit && previous - cost <= shared.limit {
            shared.last_put.lock().unwrap().succeed(true);
        }
    }
}

impl<T> EventStream for BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    fn description(&self) -> String {
        format!(
            "buffer(limit={}, size={})",
            self.shared.limit,
            self.shared.size.load(SeqCst),
        )
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.on_closed(callback);
    }
}

impl<T> EventSink<T> for BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    fn put(&self, msg: T) -> Deferred<bool> {
        if self.inner.is_closed() {
            return Deferred::resolved(false);
        }
        let cost = (self.shared.metric)(&msg);
        let accepted = self.inner.put(msg);

        let previous = self.shared.size.fetch_add(cost, SeqCst);
        let over = previous + cost > self.shared.limit;
        if over && previous <= self.shared.limit {
            // upward crossing: rotate the gate; the crossing put itself gets
            // the old, resolved deferred
            let mut last_put = self.shared.last_put.lock().unwrap();
            let rotated = mem::replace(&mut *last_put, Deferred::new());
            rotated.succeed(true);
            rotated
        } else if over {
            self.shared.last_put.lock().unwrap().clone()
        } else {
            accepted
        }
    }

    fn try_put(&self, msg: T, _timeout: Duration) -> Deferred<PutResult> {
        // the timeout is deliberately not enforced against the drainage gate
        self.put(msg).map(|accepted| {
            if accepted {
                PutResult::Accepted
            } else {
                PutResult::Closed
            }
        })
    }
}

impl<T> EventSource<T> for BufferedStream<T>
where
    T: 'static + Send + Clone,
{
    fn take(&self) -> Deferred<Option<T>> {
        let shared = self.shared.clone();
        self.inner.take().map(move |msg| {
            if let Some(msg) = &msg {
                Self::settle(&shared, msg);
            }
            msg
        })
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        let shared = self.shared.clone();
        self.inner.try_take(timeout).map(move |result| {
            if let TakeResult::Msg(msg) = &result {
                Self::settle(&shared, msg);
            }
            result
        })
    }

    fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }

    fn on_drained(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.on_drained(callback);
    }

    fn downstream(&self) -> Vec<crate::graph::Edge> {
        self.inner.downstream()
    }

    fn register_downstream(&self, edge: crate::graph::Edge) {
        self.inner.register_downstream(edge);
    }
}

// batch / throttle / buffer combinators

/// Flow-control methods available on every cloneable event source.
pub trait FlowExt<T>: EventSource<T> + Clone + Sized + 'static
where
    T: 'static + Send + Clone,
{
    /// Buffers up to `limit` messages ahead of the consumer.
    fn buffer(&self, limit: usize) -> BufferedStream<T> {
        self.buffer_weighted(|_| 1, limit)
    }

    /// Buffers messages until their summed `metric` reaches `limit`.
    fn buffer_weighted(
        &self,
        metric: impl Fn(&T) -> usize + Send + Sync + 'static,
        limit: usize,
    ) -> BufferedStream<T> {
        let buffered = buffered_stream(metric, limit);
        connect(self, &buffered, ConnectOptions::default().description("buffer"));
        buffered
    }

    /// Groups messages into vectors of up to `max_size`, emitting earlier
    /// when `max_latency` has passed since the earliest buffered message.
    /// A partial batch is emitted when the source drains.
    fn batch(&self, max_size: usize, max_latency: Option<Duration>) -> DefaultStream<Vec<T>> {
        self.batch_weighted(|_| 1, max_size, max_latency)
    }

    /// Like [`batch`](Self::batch), with batch size measured by the summed
    /// `metric` of its messages.
    fn batch_weighted(
        &self,
        metric: impl Fn(&T) -> usize + Send + 'static,
        max_size: usize,
        max_latency: Option<Duration>,
    ) -> DefaultStream<Vec<T>> {
        assert!(max_size >= 1, "the batch size must be at least 1");

        let out = stream::<Vec<T>>();
        let src = self.clone();
        let sink = out.clone();
        let anchor = anchor_edge::<T, _, _>(self, &out, "batch");
        rt::spawn(async move {
            let _anchor = anchor;
            loop {
                let first = match src.take().await {
                    Ok(Some(msg)) => msg,
                    _ => break,
                };
                let opened = Instant::now();
                let mut weight = metric(&first);
                let mut batch = vec![first];
                let mut drained = false;
                while weight < max_size {
                    let next = match max_latency {
                        Some(latency) => {
                            let remaining = latency.saturating_sub(opened.elapsed());
                            src.try_take(remaining)
                                .await
                                .unwrap_or(TakeResult::Drained)
                        }
                        None => match src.take().await {
                            Ok(Some(msg)) => TakeResult::Msg(msg),
                            _ => TakeResult::Drained,
                        },
                    };
                    match next {
                        TakeResult::Msg(msg) => {
                            weight += metric(&msg);
                            batch.push(msg);
                        }
                        TakeResult::Elapsed => break,
                        TakeResult::Drained => {
                            drained = true;
                            break;
                        }
                    }
                }
                if !sink.put(batch).await.unwrap_or(false) {
                    src.close();
                    break;
                }
                if drained {
                    break;
                }
            }
            sink.close();
        });
        out
    }

    /// Limits the source to `max_rate` messages per second, with up to one
    /// second of idle credit.
    fn throttle(&self, max_rate: f64) -> DefaultStream<T> {
        self.throttle_with_backlog(max_rate, max_rate)
    }

    /// Limits the source to `max_rate` messages per second.
    ///
    /// Time spent waiting accumulates as credit, capped at `max_backlog`
    /// periods; accumulated credit lets a burst pass without pacing.
    fn throttle_with_backlog(&self, max_rate: f64, max_backlog: f64) -> DefaultStream<T> {
        assert!(
            max_rate.is_finite() && max_rate > 0.0,
            "the rate must be a positive number"
        );

        let period = Duration::from_secs_f64(1.0 / max_rate);
        let out = stream::<T>();
        let src = self.clone();
        let sink = out.clone();
        let anchor = anchor_edge::<T, _, _>(self, &out, "throttle");
        rt::spawn(async move {
            let _anchor = anchor;
            let mut backlog = 0.0f64;
            loop {
                let opened = Instant::now();
                match src.take().await {
                    Ok(Some(msg)) => {
                        if !sink.put(msg).await.unwrap_or(false) {
                            src.close();
                            break;
                        }
                    }
                    _ => break,
                }
                let elapsed = opened.elapsed();
                let credit = elapsed.as_secs_f64() / period.as_secs_f64() - 1.0;
                if backlog + credit >= 1.0 {
                    backlog = (backlog + credit - 1.0).min(max_backlog);
                } else if let Some(remaining) = period.checked_sub(elapsed) {
                    rt::sleep(remaining).await;
                }
            }
            sink.close();
        });
        out
    }
}

impl<T, S> FlowExt<T> for S
where
    T: 'static + Send + Clone,
    S: EventSource<T> + Clone + 'static,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::SourceExt as _;

    fn src_of<T: 'static + Send + Clone>(values: impl IntoIterator<Item = T>) -> DefaultStream<T> {
        let s = stream_with::<T>(64);
        for value in values {
            s.put(value);
        }
        s.close();
        s
    }

    #[tokio::test]
    async fn buffer_gates_puts_over_the_limit() {
        let b = buffered_stream::<i32>(|_| 1, 2);
        assert_eq!(b.put(1).await, Ok(true));
        assert_eq!(b.put(2).await, Ok(true));

        // the crossing put gets the rotated, already-resolved gate
        assert_eq!(b.put(3).await, Ok(true));

        let gated = b.put(4);
        assert!(!gated.is_realized());

        assert_eq!(b.take().await, Ok(Some(1)));
        assert!(!gated.is_realized());
        assert_eq!(b.take().await, Ok(Some(2)));
        assert_eq!(gated.await, Ok(true));

        assert_eq!(b.take().await, Ok(Some(3)));
        assert_eq!(b.take().await, Ok(Some(4)));
    }

    #[tokio::test]
    async fn buffer_conserves_messages_through_connect() {
        let collected: Vec<_> = src_of(0..5).buffer(1).drain().collect().await;
        assert_eq!(collected, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn batch_splits_by_size() {
        let batches: Vec<_> = src_of([1, 2, 3, 4, 5]).batch(3, None).drain().collect().await;
        assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[tokio::test]
    async fn batch_weighted_splits_by_metric() {
        let batches: Vec<_> = src_of(["a", "bb", "ccc", "dd"])
            .batch_weighted(|msg| msg.len(), 3, None)
            .drain()
            .collect()
            .await;
        assert_eq!(batches, vec![vec!["a", "bb"], vec!["ccc"], vec!["dd"]]);
    }

    #[tokio::test]
    async fn batch_emits_on_latency_and_on_drain() {
        let src = stream_with::<i32>(4);
        let batched = src.batch(3, Some(Duration::from_millis(50)));

        {
            let src = src.clone();
            rt::spawn(async move {
                src.put(1);
                rt::sleep(Duration::from_millis(10)).await;
                src.put(2);
                rt::sleep(Duration::from_millis(110)).await;
                src.put(3);
                src.close();
            });
        }

        let batches: Vec<_> = batched.drain().collect().await;
        assert_eq!(batches, vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn throttle_paces_and_conserves() {
        let started = Instant::now();
        let collected: Vec<_> = src_of(0..10).throttle(20.0).drain().collect().await;
        let elapsed = started.elapsed();

        assert_eq!(collected, (0..10).collect::<Vec<_>>());
        assert!(
            elapsed >= Duration::from_millis(300),
            "10 messages at 20/s finished in {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn throttle_emits_at_most_rate_plus_backlog() {
        let src = stream_with::<i32>(256);
        for value in 0..100 {
            src.put(value);
        }
        let throttled = src.throttle(10.0);

        let mut received = 0;
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match throttled.try_take(remaining).await {
                Ok(TakeResult::Msg(_)) => received += 1,
                _ => break,
            }
        }
        // 0.5s at 10/s, plus the first immediate message and slack
        assert!(received <= 11, "received {received} messages in 500ms");
        src.close();
    }
}
