//! The connection graph: edges, the generic transfer loop, and callback
//! sinks.
//!
//! Topology is recorded on the source side. Each edge holds the sink weakly,
//! so an abandoned pipeline does not keep its downstream alive; dead or
//! closed edges are pruned whenever the edge list is touched.

use crate::{
    common::*,
    config::ConnectOptions,
    deferred::Deferred,
    rt,
    stream::{EventSink, EventSource, EventStream, PutResult, SinkRef, SourceRef},
};
use std::panic::{self, AssertUnwindSafe};

// edges

/// A directed source→sink relationship.
#[derive(Clone)]
pub struct Edge {
    description: String,
    sink: Weak<dyn EventStream>,
}

impl Edge {
    pub fn new(description: impl Into<String>, sink: Arc<dyn EventStream>) -> Self {
        Self {
            description: description.into(),
            sink: Arc::downgrade(&sink),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The sink this edge leads to, when still reachable.
    pub fn sink(&self) -> Option<Arc<dyn EventStream>> {
        self.sink.upgrade()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.sink
            .upgrade()
            .map(|sink| !sink.is_closed())
            .unwrap_or(false)
    }
}

impl Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("description", &self.description)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Registers an edge from `source` to `out` and returns a handle that keeps
/// the edge's weak reference upgradeable; the loop that feeds `out` owns it
/// for the life of the transfer.
pub(crate) fn anchor_edge<T, Src, Out>(
    source: &Src,
    out: &Out,
    description: &str,
) -> Arc<dyn EventStream>
where
    Src: EventSource<T> + ?Sized,
    Out: EventStream + Clone + 'static,
{
    let anchor: Arc<dyn EventStream> = Arc::new(out.clone());
    source.register_downstream(Edge::new(description, anchor.clone()));
    anchor
}

// connect

/// Wires `source` into `sink` and spawns the transfer loop.
///
/// The loop issues one take at a time and does not request the next message
/// until the previous put resolves; this is the backpressure invariant every
/// combinator builds on. Drain and closure propagate per
/// [`ConnectOptions`]: a drained source closes the sink (unless
/// `downstream` is unset), a rejected put closes the source when `upstream`
/// is set or no other live downstream remains, and an elapsed timed put
/// closes the sink so one slow message cannot stall the pipeline.
pub fn connect<T, Src, Snk>(source: &Src, sink: &Snk, options: impl Into<ConnectOptions>)
where
    T: 'static + Send + Clone,
    Src: EventSource<T> + Clone + 'static,
    Snk: EventSink<T> + Clone + 'static,
{
    let source: SourceRef<T> = Arc::new(source.clone());
    let sink: SinkRef<T> = Arc::new(sink.clone());
    let options = options.into();

    let description = options
        .description
        .clone()
        .unwrap_or_else(|| "connect".to_owned());
    source.register_downstream(Edge::new(description, sink.clone()));

    match source.connector() {
        Some(custom) => {
            rt::spawn(custom(sink, options));
        }
        None => {
            rt::spawn(transfer(source, sink, options));
        }
    }
}

async fn transfer<T>(source: SourceRef<T>, sink: SinkRef<T>, options: ConnectOptions)
where
    T: 'static + Send + Clone,
{
    loop {
        let msg = match source.take().await {
            Ok(Some(msg)) => msg,
            _ => {
                if options.downstream {
                    sink.close();
                }
                break;
            }
        };

        let accepted = match options.timeout {
            Some(timeout) => match sink.try_put(msg, timeout).await {
                Ok(PutResult::Accepted) => true,
                Ok(PutResult::Elapsed) => {
                    sink.close();
                    false
                }
                _ => false,
            },
            None => sink.put(msg).await.unwrap_or(false),
        };

        if !accepted {
            if options.upstream || source.downstream().is_empty() {
                source.close();
            }
            break;
        }
    }
}

// callback sinks

struct CallbackShared<T> {
    f: Mutex<Box<dyn FnMut(T) -> Deferred<bool> + Send>>,
    downstream: Option<Arc<dyn EventStream>>,
    closed: AtomicBool,
    on_closed: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl<T> CallbackShared<T> {
    fn close(&self) {
        if self.closed.swap(true, SeqCst) {
            return;
        }
        let callbacks = mem::take(&mut *self.on_closed.lock().unwrap());
        for callback in callbacks {
            callback();
        }
        if let Some(downstream) = &self.downstream {
            downstream.close();
        }
    }
}

/// A sink that invokes a user function per message.
///
/// The deferred returned by the function gates the next take of whatever
/// transfer loop feeds this sink. A failed deferred — or a panic raised
/// inside the function itself — closes the sink (and its downstream) and
/// resolves the put `false`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CallbackSink<T> {
    #[derivative(Debug = "ignore")]
    shared: Arc<CallbackShared<T>>,
}

impl<T> Clone for CallbackSink<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> CallbackSink<T>
where
    T: 'static + Send + Clone,
{
    pub fn new(
        f: impl FnMut(T) -> Deferred<bool> + Send + 'static,
        downstream: Option<Arc<dyn EventStream>>,
    ) -> Self {
        Self {
            shared: Arc::new(CallbackShared {
                f: Mutex::new(Box::new(f)),
                downstream,
                closed: AtomicBool::new(false),
                on_closed: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<T> EventStream for CallbackSink<T>
where
    T: 'static + Send + Clone,
{
    fn description(&self) -> String {
        match &self.shared.downstream {
            Some(downstream) => format!("callback -> {}", downstream.description()),
            None => "callback".to_owned(),
        }
    }

    fn close(&self) {
        self.shared.close();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(SeqCst)
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.is_closed() {
            callback();
        } else {
            self.shared.on_closed.lock().unwrap().push(callback);
        }
    }
}

impl<T> EventSink<T> for CallbackSink<T>
where
    T: 'static + Send + Clone,
{
    fn put(&self, msg: T) -> Deferred<bool> {
        if self.is_closed() {
            return Deferred::resolved(false);
        }
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut f = self.shared.f.lock().unwrap();
            (*f)(msg)
        }));
        let result = match invoked {
            Ok(result) => result,
            Err(_) => {
                // the poisoned callback mutex is unreachable once closed
                tracing::warn!("callback sink panicked, closing");
                self.shared.close();
                return Deferred::resolved(false);
            }
        };
        let shared = Arc::downgrade(&self.shared);
        result.catch(move |error| {
            tracing::warn!(%error, "callback sink failed, closing");
            if let Some(shared) = shared.upgrade() {
                shared.close();
            }
            Some(false)
        })
    }

    fn try_put(&self, msg: T, timeout: Duration) -> Deferred<PutResult> {
        self.put(msg)
            .map(|accepted| {
                if accepted {
                    PutResult::Accepted
                } else {
                    PutResult::Closed
                }
            })
            .timeout_or(timeout, PutResult::Elapsed)
    }
}

// connect-via

/// Connects `source` through a callback sink whose downstream is `dst`.
///
/// `f` receives each message and returns a deferred; the next message is not
/// taken until it resolves. Closing the callback sink (on source drain, or
/// when `f` fails) closes `dst`.
pub fn connect_via<T, Src, Dst, F>(source: &Src, f: F, dst: &Dst, options: impl Into<ConnectOptions>)
where
    T: 'static + Send + Clone,
    Src: EventSource<T> + Clone + 'static,
    Dst: EventStream + Clone + 'static,
    F: FnMut(T) -> Deferred<bool> + Send + 'static,
{
    let downstream: Arc<dyn EventStream> = Arc::new(dst.clone());
    let callback = CallbackSink::new(f, Some(downstream));
    connect(source, &callback, options);
}

/// Drains `source` into `f`, fire-and-forget. The returned deferred
/// resolves when the source drains.
pub fn consume<T, Src, F>(f: F, source: &Src) -> Deferred<()>
where
    T: 'static + Send + Clone,
    Src: EventSource<T> + Clone + 'static,
    F: FnMut(T) + Send + 'static,
{
    let drained = Deferred::new();
    source.on_drained(Box::new({
        let drained = drained.clone();
        move || {
            drained.succeed(());
        }
    }));

    let mut f = f;
    let callback = CallbackSink::new(
        move |msg| {
            f(msg);
            Deferred::resolved(true)
        },
        None,
    );
    connect(source, &callback, ConnectOptions::default().description("consume"));
    drained
}

/// Connects `source` through `f` into an intermediate `proxy`, then `proxy`
/// into `dst`. The first leg does not propagate drain, so the proxy stays
/// open until `source` itself drains.
pub fn connect_via_proxy<T, U, Src, Prx, Dst, F>(
    source: &Src,
    f: F,
    proxy: &Prx,
    dst: &Dst,
    options: impl Into<ConnectOptions>,
) where
    T: 'static + Send + Clone,
    U: 'static + Send + Clone,
    Src: EventSource<T> + Clone + 'static,
    Prx: EventSink<U> + EventSource<U> + Clone + 'static,
    Dst: EventSink<U> + Clone + 'static,
    F: FnMut(T) -> Deferred<bool> + Send + 'static,
{
    let options = options.into();
    source.on_drained(Box::new({
        let proxy = proxy.clone();
        move || proxy.close()
    }));
    connect_via(source, f, proxy, options.clone().downstream(false));

    let second_leg = match &options.description {
        Some(description) => ConnectOptions::default().description(format!("{description} (proxy)")),
        None => ConnectOptions::default(),
    };
    connect(proxy, dst, second_leg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffered::{stream, stream_with};

    #[tokio::test]
    async fn connect_transfers_and_propagates_drain() {
        let src = stream_with::<i32>(4);
        let dst = stream_with::<i32>(4);
        for value in [1, 2, 3] {
            src.put(value);
        }
        src.close();
        connect(&src, &dst, ConnectOptions::default());

        assert_eq!(dst.take().await, Ok(Some(1)));
        assert_eq!(dst.take().await, Ok(Some(2)));
        assert_eq!(dst.take().await, Ok(Some(3)));
        assert_eq!(dst.take().await, Ok(None));
        assert!(dst.is_drained());
    }

    #[tokio::test]
    async fn rejected_put_closes_a_sole_upstream() {
        let src = stream::<i32>();
        let dst = stream::<i32>();
        connect(&src, &dst, ConnectOptions::default());
        dst.close();

        src.put(1);
        rt::sleep(Duration::from_millis(20)).await;
        assert!(src.is_closed());
    }

    #[tokio::test]
    async fn rejected_put_spares_a_source_with_other_downstreams() {
        let src = stream_with::<i32>(4);
        let dst1 = stream_with::<i32>(4);
        let dst2 = stream_with::<i32>(4);
        connect(&src, &dst1, "first");
        connect(&src, &dst2, "second");
        dst1.close();

        src.put(1);
        rt::sleep(Duration::from_millis(20)).await;
        assert!(!src.is_closed());
    }

    #[tokio::test]
    async fn put_timeout_closes_the_sink() {
        let src = stream::<i32>();
        let dst = stream::<i32>();
        connect(
            &src,
            &dst,
            ConnectOptions::default().timeout(Duration::from_millis(10)),
        );

        // nobody ever takes from dst, so the timed put elapses
        src.put(1);
        rt::sleep(Duration::from_millis(50)).await;
        assert!(dst.is_closed());
        assert!(src.is_closed());
    }

    #[tokio::test]
    async fn downstream_lists_live_edges() {
        let src = stream::<i32>();
        let dst = stream::<i32>();
        connect(&src, &dst, "labelled");

        let edges = src.downstream();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].description(), "labelled");

        dst.close();
        rt::sleep(Duration::from_millis(10)).await;
        assert!(src.downstream().is_empty());
    }

    #[tokio::test]
    async fn consume_drains_the_source() {
        let src = stream_with::<i32>(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = consume(
            {
                let seen = seen.clone();
                move |msg| seen.lock().unwrap().push(msg)
            },
            &src,
        );

        for value in [1, 2, 3] {
            src.put(value);
        }
        src.close();
        assert_eq!(done.await, Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn connect_via_issues_one_callback_at_a_time() {
        let src = stream_with::<i32>(4);
        let dst = stream::<i32>();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate: Arc<Mutex<Option<Deferred<bool>>>> = Arc::new(Mutex::new(None));

        connect_via(
            &src,
            {
                let calls = calls.clone();
                let gate = gate.clone();
                move |_msg| {
                    calls.fetch_add(1, SeqCst);
                    let deferred = Deferred::new();
                    *gate.lock().unwrap() = Some(deferred.clone());
                    deferred
                }
            },
            &dst,
            ConnectOptions::default(),
        );

        src.put(1);
        src.put(2);
        rt::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(SeqCst), 1);

        let first = gate.lock().unwrap().take().expect("first callback pending");
        first.succeed(true);
        rt::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_callback_closes_sink_and_downstream() {
        let src = stream::<i32>();
        let dst = stream::<i32>();
        connect_via(
            &src,
            |_msg: i32| Deferred::failed(crate::Error::failure("handler blew up")),
            &dst,
            ConnectOptions::default(),
        );

        assert_eq!(src.put(1).await, Ok(true));
        rt::sleep(Duration::from_millis(20)).await;
        assert!(dst.is_closed());
        assert!(src.is_closed());
    }

    #[tokio::test]
    async fn panicking_callback_closes_sink_and_downstream() {
        let src = stream_with::<i32>(4);
        let dst = stream::<i32>();
        let callback = CallbackSink::new(
            |_msg: i32| panic!("handler blew up"),
            Some(Arc::new(dst.clone()) as Arc<dyn EventStream>),
        );

        assert_eq!(callback.put(1).await, Ok(false));
        assert!(callback.is_closed());
        assert!(dst.is_closed());

        // a closed sink rejects without touching the callback again
        assert_eq!(callback.put(2).await, Ok(false));

        connect(&src, &callback, ConnectOptions::default());
        src.put(3);
        rt::sleep(Duration::from_millis(20)).await;
        assert!(src.is_closed());
    }

    #[tokio::test]
    async fn connect_via_proxy_holds_the_proxy_open() {
        let src = stream_with::<i32>(4);
        let proxy = stream::<i32>();
        let dst = stream_with::<i32>(4);
        connect_via_proxy(
            &src,
            {
                let proxy = proxy.clone();
                move |msg| proxy.put(msg * 10)
            },
            &proxy,
            &dst,
            ConnectOptions::default(),
        );

        src.put(1);
        assert_eq!(dst.take().await, Ok(Some(10)));
        assert!(!proxy.is_closed());

        src.put(2);
        assert_eq!(dst.take().await, Ok(Some(20)));

        src.close();
        assert_eq!(dst.take().await, Ok(None));
        assert!(proxy.is_closed());
    }
}
