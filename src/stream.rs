//! The sink/source capability contract.
//!
//! Every stream implements some subset of [`EventStream`], [`EventSink`],
//! and [`EventSource`]. Puts and takes never block the caller: they return a
//! [`Deferred`] that resolves when the operation completes, and closure,
//! drainage, and timeouts are reported through dedicated enum variants
//! rather than in-band sentinel values.

use crate::{common::*, config::ConnectOptions, deferred::Deferred, graph::Edge};

/// Operations shared by both halves of a stream.
pub trait EventStream: Send + Sync {
    fn description(&self) -> String;

    /// True when backpressure is realized by blocking a thread inside an
    /// adapter rather than by deferreds. Nothing in this crate is
    /// synchronous; blocking-queue-backed adapters would be.
    fn is_synchronous(&self) -> bool {
        false
    }

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Registers a callback invoked once when the stream closes. Runs
    /// immediately when it already has.
    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Outcome of a timed put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// The message was buffered or consumed by a take.
    Accepted,
    /// The sink was closed at the time of the put.
    Closed,
    /// The put could not complete within its timeout; the message was
    /// discarded.
    Elapsed,
}

/// Outcome of a timed take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeResult<T> {
    Msg(T),
    /// The source was closed and its buffer empty.
    Drained,
    /// No message arrived within the timeout.
    Elapsed,
}

/// An endpoint that accepts messages.
pub trait EventSink<T>: EventStream {
    /// Offers a message. Resolves `true` when accepted, `false` when the
    /// sink was closed.
    fn put(&self, msg: T) -> Deferred<bool>;

    /// Offers a message with a deadline.
    fn try_put(&self, msg: T, timeout: Duration) -> Deferred<PutResult>;
}

/// A custom transfer installed by a source in place of the generic
/// take/put loop of [`connect`](crate::connect).
pub type Connector<T> = Box<dyn FnOnce(SinkRef<T>, ConnectOptions) -> BoxFuture<'static, ()> + Send>;

/// An endpoint that produces messages.
pub trait EventSource<T>: EventStream {
    /// Requests the next message. Resolves `None` when the source is
    /// drained.
    fn take(&self) -> Deferred<Option<T>>;

    /// Requests the next message with a deadline.
    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>>;

    /// True once the source is closed and its buffer empty.
    fn is_drained(&self) -> bool;

    /// Registers a callback invoked once when the source drains. Runs
    /// immediately when it already has.
    fn on_drained(&self, callback: Box<dyn FnOnce() + Send>);

    /// The live edges attached downstream of this source.
    fn downstream(&self) -> Vec<Edge> {
        Vec::new()
    }

    fn register_downstream(&self, edge: Edge) {
        drop(edge);
    }

    /// An adapter-optimised transfer loop, when the source provides one.
    fn connector(&self) -> Option<Connector<T>> {
        None
    }
}

/// Type-erased sink handle.
pub type SinkRef<T> = Arc<dyn EventSink<T>>;

/// Type-erased source handle.
pub type SourceRef<T> = Arc<dyn EventSource<T>>;

// forwarding impls, so `Arc<S>` and `Arc<dyn ...>` carry the capabilities
// of what they wrap

impl<S> EventStream for Arc<S>
where
    S: EventStream + ?Sized,
{
    fn description(&self) -> String {
        (**self).description()
    }

    fn is_synchronous(&self) -> bool {
        (**self).is_synchronous()
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        (**self).on_closed(callback)
    }
}

impl<T, S> EventSink<T> for Arc<S>
where
    S: EventSink<T> + ?Sized,
{
    fn put(&self, msg: T) -> Deferred<bool> {
        (**self).put(msg)
    }

    fn try_put(&self, msg: T, timeout: Duration) -> Deferred<PutResult> {
        (**self).try_put(msg, timeout)
    }
}

impl<T, S> EventSource<T> for Arc<S>
where
    S: EventSource<T> + ?Sized,
{
    fn take(&self) -> Deferred<Option<T>> {
        (**self).take()
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        (**self).try_take(timeout)
    }

    fn is_drained(&self) -> bool {
        (**self).is_drained()
    }

    fn on_drained(&self, callback: Box<dyn FnOnce() + Send>) {
        (**self).on_drained(callback)
    }

    fn downstream(&self) -> Vec<Edge> {
        (**self).downstream()
    }

    fn register_downstream(&self, edge: Edge) {
        (**self).register_downstream(edge)
    }

    fn connector(&self) -> Option<Connector<T>> {
        (**self).connector()
    }
}

// proxies

/// Narrows a stream to its sink capability.
pub struct SinkProxy<T> {
    inner: SinkRef<T>,
}

impl<T> SinkProxy<T> {
    pub fn new(sink: SinkRef<T>) -> Self {
        Self { inner: sink }
    }
}

impl<T> Clone for SinkProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> EventStream for SinkProxy<T> {
    fn description(&self) -> String {
        self.inner.description()
    }

    fn is_synchronous(&self) -> bool {
        self.inner.is_synchronous()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.on_closed(callback)
    }
}

impl<T> EventSink<T> for SinkProxy<T> {
    fn put(&self, msg: T) -> Deferred<bool> {
        self.inner.put(msg)
    }

    fn try_put(&self, msg: T, timeout: Duration) -> Deferred<PutResult> {
        self.inner.try_put(msg, timeout)
    }
}

/// Narrows a stream to its source capability.
pub struct SourceProxy<T> {
    inner: SourceRef<T>,
}

impl<T> SourceProxy<T> {
    pub fn new(source: SourceRef<T>) -> Self {
        Self { inner: source }
    }
}

impl<T> Clone for SourceProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> EventStream for SourceProxy<T> {
    fn description(&self) -> String {
        self.inner.description()
    }

    fn is_synchronous(&self) -> bool {
        self.inner.is_synchronous()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.on_closed(callback)
    }
}

impl<T> EventSource<T> for SourceProxy<T> {
    fn take(&self) -> Deferred<Option<T>> {
        self.inner.take()
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        self.inner.try_take(timeout)
    }

    fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }

    fn on_drained(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.on_drained(callback)
    }

    fn downstream(&self) -> Vec<Edge> {
        self.inner.downstream()
    }

    fn register_downstream(&self, edge: Edge) {
        self.inner.register_downstream(edge)
    }

    fn connector(&self) -> Option<Connector<T>> {
        self.inner.connector()
    }
}

// splice

/// Packages a sink half and a source half as one stream.
pub struct Spliced<T> {
    sink: SinkRef<T>,
    source: SourceRef<T>,
}

/// Combines two stream halves: puts go to `sink`, takes come from `source`,
/// and `close` closes both.
pub fn splice<T>(sink: SinkRef<T>, source: SourceRef<T>) -> Spliced<T> {
    Spliced { sink, source }
}

impl<T> Clone for Spliced<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            source: self.source.clone(),
        }
    }
}

impl<T> EventStream for Spliced<T> {
    fn description(&self) -> String {
        format!(
            "splice({}, {})",
            self.sink.description(),
            self.source.description()
        )
    }

    fn is_synchronous(&self) -> bool {
        self.sink.is_synchronous() || self.source.is_synchronous()
    }

    fn close(&self) {
        self.sink.close();
        self.source.close();
    }

    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        self.sink.on_closed(callback)
    }
}

impl<T> EventSink<T> for Spliced<T> {
    fn put(&self, msg: T) -> Deferred<bool> {
        self.sink.put(msg)
    }

    fn try_put(&self, msg: T, timeout: Duration) -> Deferred<PutResult> {
        self.sink.try_put(msg, timeout)
    }
}

impl<T> EventSource<T> for Spliced<T> {
    fn take(&self) -> Deferred<Option<T>> {
        self.source.take()
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        self.source.try_take(timeout)
    }

    fn is_drained(&self) -> bool {
        self.source.is_drained()
    }

    fn on_drained(&self, callback: Box<dyn FnOnce() + Send>) {
        self.source.on_drained(callback)
    }

    fn downstream(&self) -> Vec<Edge> {
        self.source.downstream()
    }

    fn register_downstream(&self, edge: Edge) {
        self.source.register_downstream(edge)
    }

    fn connector(&self) -> Option<Connector<T>> {
        self.source.connector()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered::stream;

    #[tokio::test]
    async fn splice_routes_and_closes_both_halves() {
        let front = stream::<i32>();
        let back = stream::<i32>();
        let spliced = splice(
            Arc::new(front.clone()) as SinkRef<i32>,
            Arc::new(back.clone()) as SourceRef<i32>,
        );

        let put = spliced.put(1);
        assert_eq!(front.take().await, Ok(Some(1)));
        assert_eq!(put.await, Ok(true));

        let take = spliced.take();
        back.put(2);
        assert_eq!(take.await, Ok(Some(2)));

        assert!(!spliced.is_synchronous());
        spliced.close();
        assert!(front.is_closed());
        assert!(back.is_closed());
    }

    #[tokio::test]
    async fn proxies_forward_one_capability() {
        let s = stream::<i32>();
        let sink = SinkProxy::new(Arc::new(s.clone()) as SinkRef<i32>);
        let source = SourceProxy::new(Arc::new(s.clone()) as SourceRef<i32>);

        let put = sink.put(9);
        assert_eq!(source.take().await, Ok(Some(9)));
        assert_eq!(put.await, Ok(true));

        sink.close();
        assert!(source.is_drained());
    }
}
