//! Combinators over event sources.
//!
//! Every combinator produces a fresh [`DefaultStream`] and wires the input
//! into it, either through [`connect_via`] (so the per-message callback's
//! deferred carries backpressure) or through a spawned loop that awaits one
//! put before issuing the next take.

use crate::{
    common::*,
    buffered::{stream, stream_with, DefaultStream},
    deferred::{self, Deferred},
    error::Error,
    graph::{anchor_edge, connect_via},
    rt,
    stream::{EventSink, EventSource, EventStream, SourceRef, TakeResult},
    xform::Transducer,
};
use std::panic::{self, AssertUnwindSafe};

/// Combinator methods available on every cloneable event source.
pub trait SourceExt<T>: EventSource<T> + Clone + Sized + 'static
where
    T: 'static + Send + Clone,
{
    /// Applies `f` to each message.
    ///
    /// ```rust
    /// use futures::StreamExt as _;
    /// use millrace::{prelude::*, stream_with};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let s = stream_with::<i32>(4);
    ///     for value in [0, 1, 2] {
    ///         s.put(value);
    ///     }
    ///     s.close();
    ///
    ///     let doubled: Vec<_> = s.map(|value| value * 2).drain().collect().await;
    ///     assert_eq!(doubled, vec![0, 2, 4]);
    /// }
    /// ```
    fn map<U, F>(&self, mut f: F) -> DefaultStream<U>
    where
        U: 'static + Send + Clone,
        F: FnMut(T) -> U + Send + 'static,
    {
        let out = stream();
        let sink = out.clone();
        connect_via(self, move |msg| sink.put(f(msg)), &out, "map");
        out
    }

    /// Passes through the messages satisfying `pred`.
    fn filter<F>(&self, mut pred: F) -> DefaultStream<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let out = stream();
        let sink = out.clone();
        connect_via(
            self,
            move |msg| {
                if pred(&msg) {
                    sink.put(msg)
                } else {
                    Deferred::resolved(true)
                }
            },
            &out,
            "filter",
        );
        out
    }

    /// Applies `f` and emits each element of the returned collection, in
    /// order, before the next message is taken.
    fn mapcat<U, I, F>(&self, mut f: F) -> DefaultStream<U>
    where
        U: 'static + Send + Clone,
        I: IntoIterator<Item = U>,
        F: FnMut(T) -> I + Send + 'static,
    {
        let out = stream();
        let sink = out.clone();
        connect_via(
            self,
            move |msg| {
                let mut chain = Deferred::resolved(true);
                for item in f(msg) {
                    let sink = sink.clone();
                    chain = chain.chain(move |accepted| {
                        if accepted {
                            sink.put(item)
                        } else {
                            Deferred::resolved(false)
                        }
                    });
                }
                chain
            },
            &out,
            "mapcat",
        );
        out
    }

    /// Emits the running accumulation of `f` over the source, starting from
    /// `init` when supplied (and emitting it), otherwise seeding the
    /// accumulator with the first message. An `Err` from `f` closes input
    /// and output.
    fn reductions<F>(&self, init: Option<T>, mut f: F) -> DefaultStream<T>
    where
        F: FnMut(T, T) -> Result<T, Error> + Send + 'static,
    {
        let out = stream();
        let src = self.clone();
        let sink = out.clone();
        let anchor = anchor_edge::<T, _, _>(self, &out, "reductions");
        rt::spawn(async move {
            let _anchor = anchor;
            let mut acc = init;
            if let Some(seed) = acc.clone() {
                if !sink.put(seed).await.unwrap_or(false) {
                    src.close();
                    return;
                }
            }
            loop {
                match src.take().await {
                    Ok(Some(msg)) => {
                        let next = match acc.take() {
                            None => msg,
                            Some(acc) => match f(acc, msg) {
                                Ok(next) => next,
                                Err(error) => {
                                    tracing::warn!(%error, "reductions fn failed, closing");
                                    src.close();
                                    break;
                                }
                            },
                        };
                        acc = Some(next.clone());
                        if !sink.put(next).await.unwrap_or(false) {
                            src.close();
                            break;
                        }
                    }
                    _ => break,
                }
            }
            sink.close();
        });
        out
    }

    /// Resolves to the final accumulation of `f` over the source.
    ///
    /// An `Err` from `f` resolves the deferred to the accumulator at the
    /// point of failure — the source's current reduction — rather than an
    /// error. Callers that need to distinguish must encode failure in the
    /// accumulator.
    fn reduce<F>(&self, init: Option<T>, mut f: F) -> Deferred<T>
    where
        F: FnMut(T, T) -> Result<T, Error> + Send + 'static,
    {
        let src = self.clone();
        let result = Deferred::new();
        let link = result.clone();
        rt::spawn(async move {
            let mut acc = match init {
                Some(acc) => acc,
                None => match src.take().await {
                    Ok(Some(msg)) => msg,
                    _ => {
                        link.fail(Error::failure(
                            "reduce of a drained source with no initial value",
                        ));
                        return;
                    }
                },
            };
            loop {
                match src.take().await {
                    Ok(Some(msg)) => match f(acc.clone(), msg) {
                        Ok(next) => acc = next,
                        Err(error) => {
                            tracing::warn!(%error, "reduce fn failed, resolving to last accumulator");
                            link.succeed(acc);
                            return;
                        }
                    },
                    _ => break,
                }
            }
            link.succeed(acc);
        });
        result
    }

    /// Feeds the source through an operator into a stream of `capacity`.
    /// A terminating operator closes both input and output; the operator's
    /// `flush` runs when the source drains.
    fn transform<U, X>(&self, mut xform: X, capacity: usize) -> DefaultStream<U>
    where
        U: 'static + Send + Clone,
        X: Transducer<T, U> + 'static,
    {
        let out = stream_with(capacity);
        let src = self.clone();
        let sink = out.clone();
        let anchor = anchor_edge::<T, _, _>(self, &out, "transform");
        rt::spawn(async move {
            let _anchor = anchor;
            'outer: loop {
                match src.take().await {
                    Ok(Some(msg)) => {
                        let mut outputs = Vec::new();
                        let flow = xform.step(msg, &mut outputs);
                        for item in outputs {
                            if !sink.put(item).await.unwrap_or(false) {
                                src.close();
                                break 'outer;
                            }
                        }
                        if flow.is_break() {
                            src.close();
                            break;
                        }
                    }
                    _ => break,
                }
            }
            let mut tail = Vec::new();
            xform.flush(&mut tail);
            for item in tail {
                if !sink.put(item).await.unwrap_or(false) {
                    break;
                }
            }
            sink.close();
        });
        out
    }

    /// Emits a stream of sub-streams split wherever `f` of consecutive
    /// messages differs.
    ///
    /// The next sub-stream is not opened until the consumer advances the
    /// outer take, and each sub-stream must be drained for its run to flow;
    /// messages of a sub-stream the consumer closed early are dropped. A
    /// panic in `f` closes both input and output.
    fn lazily_partition_by<K, F>(&self, mut f: F) -> DefaultStream<DefaultStream<T>>
    where
        K: PartialEq + Send + 'static,
        F: FnMut(&T) -> K + Send + 'static,
    {
        let out = stream::<DefaultStream<T>>();
        let src = self.clone();
        let sink = out.clone();
        let anchor = anchor_edge::<T, _, _>(self, &out, "lazily-partition-by");
        rt::spawn(async move {
            let _anchor = anchor;
            let mut current: Option<(K, DefaultStream<T>)> = None;
            loop {
                match src.take().await {
                    Ok(Some(msg)) => {
                        let key = match panic::catch_unwind(AssertUnwindSafe(|| f(&msg))) {
                            Ok(key) => key,
                            Err(_) => {
                                tracing::warn!("partition key fn panicked, closing");
                                src.close();
                                break;
                            }
                        };
                        let same_run = current
                            .as_ref()
                            .map(|(previous, _)| *previous == key)
                            .unwrap_or(false);
                        if !same_run {
                            if let Some((_, partition)) = current.take() {
                                partition.close();
                            }
                            let partition = stream::<T>();
                            if !sink.put(partition.clone()).await.unwrap_or(false) {
                                src.close();
                                break;
                            }
                            current = Some((key, partition));
                        }
                        let partition = &current.as_ref().expect("current partition").1;
                        let _ = partition.put(msg).await;
                    }
                    _ => break,
                }
            }
            if let Some((_, partition)) = current.take() {
                partition.close();
            }
            sink.close();
        });
        out
    }

    /// A [`futures::Stream`](futures::stream::Stream) of successive takes,
    /// ending when the source drains.
    fn drain(&self) -> Drain<T> {
        Drain {
            source: Arc::new(self.clone()),
            timeout: None,
            pending: None,
        }
    }

    /// Like [`drain`](Self::drain), but also ending at the first take that
    /// does not complete within `timeout`.
    fn drain_timeout(&self, timeout: Duration) -> Drain<T> {
        Drain {
            source: Arc::new(self.clone()),
            timeout: Some(timeout),
            pending: None,
        }
    }
}

impl<T, S> SourceExt<T> for S
where
    T: 'static + Send + Clone,
    S: EventSource<T> + Clone + 'static,
{
}

// drain

enum PendingTake<T> {
    Plain(Deferred<Option<T>>),
    Timed(Deferred<TakeResult<T>>),
}

/// Stream for the [`drain`](SourceExt::drain) and
/// [`drain_timeout`](SourceExt::drain_timeout) methods.
#[must_use = "streams do nothing unless you consume or poll them"]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Drain<T> {
    #[derivative(Debug = "ignore")]
    source: SourceRef<T>,
    timeout: Option<Duration>,
    #[derivative(Debug = "ignore")]
    pending: Option<PendingTake<T>>,
}

impl<T> Stream for Drain<T>
where
    T: 'static + Send + Clone,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.pending.is_none() {
            this.pending = Some(match this.timeout {
                None => PendingTake::Plain(this.source.take()),
                Some(timeout) => PendingTake::Timed(this.source.try_take(timeout)),
            });
        }
        match this.pending.as_mut().expect("pending take") {
            PendingTake::Plain(deferred) => match Pin::new(deferred).poll(cx) {
                Ready(Ok(Some(msg))) => {
                    this.pending = None;
                    Ready(Some(msg))
                }
                Ready(_) => Ready(None),
                Pending => Pending,
            },
            PendingTake::Timed(deferred) => match Pin::new(deferred).poll(cx) {
                Ready(Ok(TakeResult::Msg(msg))) => {
                    this.pending = None;
                    Ready(Some(msg))
                }
                Ready(_) => Ready(None),
                Pending => Pending,
            },
        }
    }
}

// free functions over several sources

/// Pairs messages from two sources until either drains; closing the output
/// closes both inputs.
pub fn zip<A, B, Sa, Sb>(a: &Sa, b: &Sb) -> DefaultStream<(A, B)>
where
    A: 'static + Send + Clone,
    B: 'static + Send + Clone,
    Sa: EventSource<A> + Clone + 'static,
    Sb: EventSource<B> + Clone + 'static,
{
    let out = stream();
    let sink = out.clone();
    let a = a.clone();
    let b = b.clone();
    let anchors = (
        anchor_edge::<A, _, _>(&a, &out, "zip"),
        anchor_edge::<B, _, _>(&b, &out, "zip"),
    );
    rt::spawn(async move {
        let _anchors = anchors;
        loop {
            match deferred::zip2(a.take(), b.take()).await {
                Ok((Some(x), Some(y))) => {
                    if !sink.put((x, y)).await.unwrap_or(false) {
                        a.close();
                        b.close();
                        break;
                    }
                }
                _ => break,
            }
        }
        sink.close();
    });
    out
}

/// Zips any number of same-typed sources into vectors of one message each.
pub fn zip_all<T, S>(sources: Vec<S>) -> DefaultStream<Vec<T>>
where
    T: 'static + Send + Clone,
    S: EventSource<T> + Clone + 'static,
{
    let out = stream();
    if sources.is_empty() {
        out.close();
        return out;
    }
    let sink = out.clone();
    let anchors: Vec<_> = sources
        .iter()
        .map(|source| anchor_edge::<T, _, _>(source, &out, "zip-all"))
        .collect();
    rt::spawn(async move {
        let _anchors = anchors;
        loop {
            let takes: Vec<_> = sources.iter().map(|source| source.take()).collect();
            match deferred::zip(takes).await {
                Ok(values) => match values.into_iter().collect::<Option<Vec<T>>>() {
                    Some(row) => {
                        if !sink.put(row).await.unwrap_or(false) {
                            for source in &sources {
                                source.close();
                            }
                            break;
                        }
                    }
                    None => break,
                },
                Err(_) => break,
            }
        }
        sink.close();
    });
    out
}

/// Applies `f` across paired messages of two sources.
pub fn map2<A, B, C, Sa, Sb, F>(f: F, a: &Sa, b: &Sb) -> DefaultStream<C>
where
    A: 'static + Send + Clone,
    B: 'static + Send + Clone,
    C: 'static + Send + Clone,
    Sa: EventSource<A> + Clone + 'static,
    Sb: EventSource<B> + Clone + 'static,
    F: FnMut((A, B)) -> C + Send + 'static,
{
    zip(a, b).map(f)
}

/// Flattens a source of sources, exhausting each inner source before taking
/// the next. Closing the output closes the outer source.
pub fn concat<T, S, Src>(source: &Src) -> DefaultStream<T>
where
    T: 'static + Send + Clone,
    S: EventSource<T> + Clone + Send + 'static,
    Src: EventSource<S> + Clone + 'static,
{
    let out = stream();
    let sink = out.clone();
    let outer = source.clone();
    let anchor = anchor_edge::<S, _, _>(source, &out, "concat");
    rt::spawn(async move {
        let _anchor = anchor;
        'outer: loop {
            match outer.take().await {
                Ok(Some(inner)) => loop {
                    match inner.take().await {
                        Ok(Some(msg)) => {
                            if !sink.put(msg).await.unwrap_or(false) {
                                inner.close();
                                outer.close();
                                break 'outer;
                            }
                        }
                        _ => break,
                    }
                },
                _ => break,
            }
        }
        sink.close();
    });
    out
}

/// Unwraps a source whose messages are themselves deferreds, in order.
/// A message that fails logs and closes the output.
pub fn realize_each<T, Src>(source: &Src) -> DefaultStream<T>
where
    T: 'static + Send + Clone,
    Src: EventSource<Deferred<T>> + Clone + 'static,
{
    let out = stream();
    let sink = out.clone();
    connect_via(
        source,
        move |msg: Deferred<T>| {
            let sink = sink.clone();
            msg.chain(move |value| sink.put(value))
        },
        &out,
        "realize-each",
    );
    out
}

/// Emits `f()` every `period` into a capacity-1 stream.
///
/// When a put cannot complete within the period, the next emission lands on
/// the first period boundary after the put resolves. A rejected put or an
/// `Err` from `f` stops the task and closes the stream.
pub fn periodically<T, F>(
    period: Duration,
    initial_delay: Option<Duration>,
    mut f: F,
) -> DefaultStream<T>
where
    T: 'static + Send + Clone,
    F: FnMut() -> Result<T, Error> + Send + 'static,
{
    assert!(!period.is_zero(), "the period must be non-zero");

    let out = stream_with::<T>(1);
    let sink = out.clone();
    rt::spawn(async move {
        rt::sleep(initial_delay.unwrap_or(Duration::ZERO)).await;
        let epoch = Instant::now();
        loop {
            let value = match f() {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(%error, "periodic emission failed, closing");
                    break;
                }
            };
            match sink.put(value).await {
                Ok(true) => {}
                _ => break,
            }
            let elapsed = epoch.elapsed();
            let into_period = elapsed.as_nanos() % period.as_nanos();
            rt::sleep(period - Duration::from_nanos(into_period as u64)).await;
        }
        sink.close();
    });
    out
}
