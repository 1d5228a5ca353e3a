//! The default buffered stream.
//!
//! A [`DefaultStream`] is a FIFO pairing of puts and takes. With capacity 0
//! it is a rendezvous: a put resolves only once a matching take arrives.
//! With capacity `n`, up to `n` messages are buffered and puts resolve
//! immediately until the buffer fills.
//!
//! All waiter resolution goes through the state lock: a waiter still queued
//! is guaranteed pending, and timed waiters are removed by their timer task
//! before being resolved, so a message is never delivered into a take or put
//! that has already timed out.

use crate::{
    common::*,
    config::{Executor, StreamOptions},
    deferred::Deferred,
    graph::Edge,
    rt,
    stream::{EventSink, EventSource, EventStream, PutResult, TakeResult},
    xform::Transducer,
};

/// Creates a rendezvous stream.
pub fn stream<T>() -> DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    stream_with(StreamOptions::default())
}

/// Creates a stream from [`StreamOptions`].
pub fn stream_with<T>(options: impl Into<StreamOptions<T>>) -> DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    DefaultStream::new(options.into())
}

type Thunk = Box<dyn FnOnce() + Send>;

enum TakeWaiter<T> {
    Plain(Deferred<Option<T>>),
    Timed(Deferred<TakeResult<T>>),
}

impl<T> TakeWaiter<T>
where
    T: 'static + Send + Clone,
{
    fn resolve_msg(self, msg: T) -> Thunk {
        match self {
            Self::Plain(d) => Box::new(move || {
                d.succeed(Some(msg));
            }),
            Self::Timed(d) => Box::new(move || {
                d.succeed(TakeResult::Msg(msg));
            }),
        }
    }

    fn resolve_drained(self) -> Thunk {
        match self {
            Self::Plain(d) => Box::new(move || {
                d.succeed(None);
            }),
            Self::Timed(d) => Box::new(move || {
                d.succeed(TakeResult::Drained);
            }),
        }
    }

    fn resolve_elapsed(self) -> Thunk {
        match self {
            Self::Plain(d) => Box::new(move || {
                d.succeed(None);
            }),
            Self::Timed(d) => Box::new(move || {
                d.succeed(TakeResult::Elapsed);
            }),
        }
    }
}

enum PutWaiter {
    Plain(Deferred<bool>),
    Timed(Deferred<PutResult>),
}

impl PutWaiter {
    fn resolve_accepted(self) -> Thunk {
        match self {
            Self::Plain(d) => Box::new(move || {
                d.succeed(true);
            }),
            Self::Timed(d) => Box::new(move || {
                d.succeed(PutResult::Accepted);
            }),
        }
    }

    fn resolve_closed(self) -> Thunk {
        match self {
            Self::Plain(d) => Box::new(move || {
                d.succeed(false);
            }),
            Self::Timed(d) => Box::new(move || {
                d.succeed(PutResult::Closed);
            }),
        }
    }

    fn resolve_elapsed(self) -> Thunk {
        match self {
            Self::Plain(d) => Box::new(move || {
                d.succeed(false);
            }),
            Self::Timed(d) => Box::new(move || {
                d.succeed(PutResult::Elapsed);
            }),
        }
    }
}

struct Taker<T> {
    id: u64,
    waiter: TakeWaiter<T>,
}

enum Putter<T> {
    /// A put still carrying its message: the stream was at capacity, or a
    /// rendezvous put waiting for its take.
    Bearing { id: u64, msg: T, waiter: PutWaiter },
    /// A put whose outputs were already enqueued past capacity by the
    /// stream's operator; resolves once the buffer shrinks back.
    Parked { id: u64, waiter: PutWaiter },
}

impl<T> Putter<T> {
    fn id(&self) -> u64 {
        match self {
            Self::Bearing { id, .. } | Self::Parked { id, .. } => *id,
        }
    }
}

struct State<T> {
    buffer: VecDeque<T>,
    takers: VecDeque<Taker<T>>,
    putters: VecDeque<Putter<T>>,
    edges: Vec<Edge>,
    xform: Option<Box<dyn Transducer<T>>>,
    on_closed: Vec<Thunk>,
    on_drained: Vec<Thunk>,
    next_waiter_id: u64,
    closed: bool,
    drained: bool,
}

impl<T> State<T> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        id
    }

    fn has_bearing_putter(&self) -> bool {
        self.putters
            .iter()
            .any(|putter| matches!(putter, Putter::Bearing { .. }))
    }
}

struct Shared<T>
where
    T: 'static + Send + Clone,
{
    capacity: usize,
    permanent: bool,
    description: Option<String>,
    executor: Executor,
    state: Mutex<State<T>>,
}

impl<T> Drop for Shared<T>
where
    T: 'static + Send + Clone,
{
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            let takers = mem::take(&mut state.takers);
            let putters = mem::take(&mut state.putters);
            let callbacks = mem::take(&mut state.on_drained);
            for taker in takers {
                match taker.waiter {
                    TakeWaiter::Plain(d) => {
                        d.succeed(None);
                    }
                    TakeWaiter::Timed(d) => {
                        d.succeed(TakeResult::Drained);
                    }
                }
            }
            for putter in putters {
                let waiter = match putter {
                    Putter::Bearing { waiter, .. } | Putter::Parked { waiter, .. } => waiter,
                };
                match waiter {
                    PutWaiter::Plain(d) => {
                        d.succeed(false);
                    }
                    PutWaiter::Timed(d) => {
                        d.succeed(PutResult::Closed);
                    }
                }
            }
            if !state.drained {
                for callback in callbacks {
                    callback();
                }
            }
        }
    }
}

/// The stream type produced by [`stream`] and every combinator.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    #[derivative(Debug = "ignore")]
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    pub fn new(options: StreamOptions<T>) -> Self {
        let StreamOptions {
            capacity,
            permanent,
            description,
            executor,
            xform,
        } = options;

        Self {
            shared: Arc::new(Shared {
                capacity,
                permanent,
                description,
                executor,
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    takers: VecDeque::new(),
                    putters: VecDeque::new(),
                    edges: Vec::new(),
                    xform,
                    on_closed: Vec::new(),
                    on_drained: Vec::new(),
                    next_waiter_id: 0,
                    closed: false,
                    drained: false,
                }),
            }),
        }
    }

    /// This stream as a type-erased sink handle.
    pub fn as_sink(&self) -> Arc<dyn EventSink<T>> {
        Arc::new(self.clone())
    }

    /// This stream as a type-erased source handle.
    pub fn as_source(&self) -> Arc<dyn EventSource<T>> {
        Arc::new(self.clone())
    }

    fn deferred<U>(&self) -> Deferred<U> {
        Deferred::with_executor(self.shared.executor)
    }

    /// Hands `msg` to the oldest waiting take, or buffers it.
    fn dispatch(state: &mut State<T>, msg: T, thunks: &mut Vec<Thunk>) {
        match state.takers.pop_front() {
            Some(taker) => thunks.push(taker.waiter.resolve_msg(msg)),
            None => state.buffer.push_back(msg),
        }
    }

    /// Moves parked puts forward after the buffer shrank.
    fn promote(&self, state: &mut State<T>, thunks: &mut Vec<Thunk>) {
        loop {
            let promotable = match state.putters.front() {
                Some(Putter::Bearing { .. }) => state.buffer.len() < self.shared.capacity,
                Some(Putter::Parked { .. }) => state.buffer.len() <= self.shared.capacity,
                None => false,
            };
            if !promotable {
                break;
            }
            match state.putters.pop_front().expect("front putter") {
                Putter::Bearing { msg, waiter, .. } => {
                    state.buffer.push_back(msg);
                    thunks.push(waiter.resolve_accepted());
                }
                Putter::Parked { waiter, .. } => {
                    thunks.push(waiter.resolve_accepted());
                }
            }
        }
    }

    fn maybe_drain(&self, state: &mut State<T>, thunks: &mut Vec<Thunk>) {
        if state.drained
            || !state.closed
            || !state.buffer.is_empty()
            || state.has_bearing_putter()
        {
            return;
        }
        state.drained = true;
        for taker in state.takers.drain(..) {
            thunks.push(taker.waiter.resolve_drained());
        }
        for putter in state.putters.drain(..) {
            match putter {
                Putter::Parked { waiter, .. } => thunks.push(waiter.resolve_accepted()),
                Putter::Bearing { .. } => unreachable!("drained with a bearing putter"),
            }
        }
        thunks.append(&mut state.on_drained);
    }

    fn close_locked(&self, state: &mut State<T>, thunks: &mut Vec<Thunk>) {
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(mut xform) = state.xform.take() {
            let mut outs = Vec::new();
            xform.flush(&mut outs);
            for out in outs {
                Self::dispatch(state, out, thunks);
            }
        }
        thunks.append(&mut state.on_closed);
        self.maybe_drain(state, thunks);
    }

    fn do_put(&self, msg: T, waiter: PutWaiter, timeout: Option<Duration>) {
        let mut thunks = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                thunks.push(waiter.resolve_closed());
            } else if state.xform.is_some() {
                let (outs, flow) = {
                    let xform = state.xform.as_mut().expect("xform present");
                    let mut outs = Vec::new();
                    let flow = xform.step(msg, &mut outs);
                    (outs, flow)
                };
                for out in outs {
                    Self::dispatch(&mut state, out, &mut thunks);
                }
                if flow.is_break() {
                    thunks.push(waiter.resolve_accepted());
                    self.close_locked(&mut state, &mut thunks);
                } else if state.buffer.len() <= self.shared.capacity {
                    thunks.push(waiter.resolve_accepted());
                } else {
                    let id = state.next_id();
                    state.putters.push_back(Putter::Parked { id, waiter });
                    if let Some(timeout) = timeout {
                        self.arm_put_timer(id, timeout);
                    }
                }
            } else if let Some(taker) = state.takers.pop_front() {
                thunks.push(taker.waiter.resolve_msg(msg));
                thunks.push(waiter.resolve_accepted());
            } else if state.buffer.len() < self.shared.capacity {
                state.buffer.push_back(msg);
                thunks.push(waiter.resolve_accepted());
            } else {
                let id = state.next_id();
                state.putters.push_back(Putter::Bearing { id, msg, waiter });
                if let Some(timeout) = timeout {
                    self.arm_put_timer(id, timeout);
                }
            }
        }
        for thunk in thunks {
            thunk();
        }
    }

    fn do_take(&self, waiter: TakeWaiter<T>, timeout: Option<Duration>) {
        let mut thunks = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(msg) = state.buffer.pop_front() {
                thunks.push(waiter.resolve_msg(msg));
                self.promote(&mut state, &mut thunks);
                self.maybe_drain(&mut state, &mut thunks);
            } else {
                let mut delivered = false;
                let mut waiter = Some(waiter);
                while let Some(putter) = state.putters.pop_front() {
                    match putter {
                        Putter::Bearing {
                            msg, waiter: put, ..
                        } => {
                            thunks.push(put.resolve_accepted());
                            thunks.push(waiter.take().unwrap().resolve_msg(msg));
                            delivered = true;
                            break;
                        }
                        Putter::Parked { waiter: put, .. } => {
                            thunks.push(put.resolve_accepted());
                        }
                    }
                }
                if delivered {
                    self.maybe_drain(&mut state, &mut thunks);
                } else if state.closed {
                    self.maybe_drain(&mut state, &mut thunks);
                    thunks.push(waiter.take().unwrap().resolve_drained());
                } else {
                    let id = state.next_id();
                    state.takers.push_back(Taker {
                        id,
                        waiter: waiter.take().unwrap(),
                    });
                    if let Some(timeout) = timeout {
                        self.arm_take_timer(id, timeout);
                    }
                }
            }
        }
        for thunk in thunks {
            thunk();
        }
    }

    fn arm_put_timer(&self, id: u64, timeout: Duration) {
        let weak = Arc::downgrade(&self.shared);
        rt::spawn(async move {
            rt::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let thunk = {
                let mut state = shared.state.lock().unwrap();
                let position = state.putters.iter().position(|putter| putter.id() == id);
                position.and_then(|pos| state.putters.remove(pos)).map(|putter| {
                    // the message, if any, is dropped with the putter
                    match putter {
                        Putter::Bearing { waiter, .. } | Putter::Parked { waiter, .. } => {
                            waiter.resolve_elapsed()
                        }
                    }
                })
            };
            if let Some(thunk) = thunk {
                thunk();
            }
        });
    }

    fn arm_take_timer(&self, id: u64, timeout: Duration) {
        let weak = Arc::downgrade(&self.shared);
        rt::spawn(async move {
            rt::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let thunk = {
                let mut state = shared.state.lock().unwrap();
                let position = state.takers.iter().position(|taker| taker.id == id);
                position
                    .and_then(|pos| state.takers.remove(pos))
                    .map(|taker| taker.waiter.resolve_elapsed())
            };
            if let Some(thunk) = thunk {
                thunk();
            }
        });
    }
}

impl<T> EventStream for DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    fn description(&self) -> String {
        if let Some(description) = &self.shared.description {
            return description.clone();
        }
        let state = self.shared.state.lock().unwrap();
        format!(
            "stream(capacity={}, buffered={}, closed={})",
            self.shared.capacity,
            state.buffer.len(),
            state.closed,
        )
    }

    fn close(&self) {
        if self.shared.permanent {
            return;
        }
        let mut thunks = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            self.close_locked(&mut state, &mut thunks);
        }
        for thunk in thunks {
            thunk();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) {
        let run = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                true
            } else {
                state.on_closed.push(callback);
                return;
            }
        };
        if run {
            callback();
        }
    }
}

impl<T> EventSink<T> for DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    fn put(&self, msg: T) -> Deferred<bool> {
        let deferred = self.deferred();
        self.do_put(msg, PutWaiter::Plain(deferred.clone()), None);
        deferred
    }

    fn try_put(&self, msg: T, timeout: Duration) -> Deferred<PutResult> {
        let deferred = self.deferred();
        self.do_put(msg, PutWaiter::Timed(deferred.clone()), Some(timeout));
        deferred
    }
}

impl<T> EventSource<T> for DefaultStream<T>
where
    T: 'static + Send + Clone,
{
    fn take(&self) -> Deferred<Option<T>> {
        let deferred = self.deferred();
        self.do_take(TakeWaiter::Plain(deferred.clone()), None);
        deferred
    }

    fn try_take(&self, timeout: Duration) -> Deferred<TakeResult<T>> {
        let deferred = self.deferred();
        self.do_take(TakeWaiter::Timed(deferred.clone()), Some(timeout));
        deferred
    }

    fn is_drained(&self) -> bool {
        self.shared.state.lock().unwrap().drained
    }

    fn on_drained(&self, callback: Box<dyn FnOnce() + Send>) {
        let run = {
            let mut state = self.shared.state.lock().unwrap();
            if state.drained {
                true
            } else {
                state.on_drained.push(callback);
                return;
            }
        };
        if run {
            callback();
        }
    }

    fn downstream(&self) -> Vec<Edge> {
        let mut state = self.shared.state.lock().unwrap();
        state.edges.retain(Edge::is_live);
        state.edges.clone()
    }

    fn register_downstream(&self, edge: Edge) {
        let mut state = self.shared.state.lock().unwrap();
        state.edges.retain(Edge::is_live);
        state.edges.push(edge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rendezvous_pairs_put_with_take() {
        let s = stream::<i32>();
        let put = s.put(1);
        assert!(!put.is_realized());

        assert_eq!(s.take().await, Ok(Some(1)));
        assert_eq!(put.await, Ok(true));
    }

    #[tokio::test]
    async fn waiting_take_receives_later_put() {
        let s = stream::<i32>();
        let take = s.take();
        assert!(!take.is_realized());

        assert_eq!(s.put(5).await, Ok(true));
        assert_eq!(take.await, Ok(Some(5)));
    }

    #[tokio::test]
    async fn buffered_puts_resolve_immediately() {
        let s = stream_with::<i32>(2);
        assert_eq!(s.put(1).await, Ok(true));
        assert_eq!(s.put(2).await, Ok(true));
        let parked = s.put(3);
        assert!(!parked.is_realized());

        assert_eq!(s.take().await, Ok(Some(1)));
        assert_eq!(parked.await, Ok(true));
        assert_eq!(s.take().await, Ok(Some(2)));
        assert_eq!(s.take().await, Ok(Some(3)));
    }

    #[tokio::test]
    async fn pending_puts_drain_after_close() {
        let s = stream::<i32>();
        let first = s.put(1);
        let second = s.put(2);
        s.close();

        assert_eq!(s.put(3).await, Ok(false));
        assert_eq!(s.take().await, Ok(Some(1)));
        assert_eq!(s.take().await, Ok(Some(2)));
        assert_eq!(s.take().await, Ok(None));
        assert_eq!(first.await, Ok(true));
        assert_eq!(second.await, Ok(true));
        assert!(s.is_drained());
    }

    #[tokio::test]
    async fn close_with_empty_buffer_drains_immediately() {
        let s = stream::<i32>();
        let take = s.take();
        s.close();
        assert_eq!(take.await, Ok(None));
        assert!(s.is_drained());
    }

    #[tokio::test]
    async fn timed_take_elapses() {
        let s = stream::<i32>();
        let take = s.try_take(Duration::from_millis(10));
        assert_eq!(take.await, Ok(TakeResult::Elapsed));

        // the elapsed take must not steal a later message
        let put = s.put(1);
        assert_eq!(s.take().await, Ok(Some(1)));
        assert_eq!(put.await, Ok(true));
    }

    #[tokio::test]
    async fn timed_put_elapses_and_discards_its_message() {
        let s = stream::<i32>();
        let put = s.try_put(1, Duration::from_millis(10));
        assert_eq!(put.await, Ok(PutResult::Elapsed));

        let second = s.put(2);
        assert_eq!(s.take().await, Ok(Some(2)));
        assert_eq!(second.await, Ok(true));
    }

    #[tokio::test]
    async fn callbacks_fire_on_close_and_drain() {
        let s = stream_with::<i32>(4);
        let closed = Arc::new(AtomicBool::new(false));
        let drained = Arc::new(AtomicBool::new(false));
        s.on_closed(Box::new({
            let closed = closed.clone();
            move || closed.store(true, SeqCst)
        }));
        s.on_drained(Box::new({
            let drained = drained.clone();
            move || drained.store(true, SeqCst)
        }));

        s.put(1);
        s.close();
        assert!(closed.load(SeqCst));
        assert!(!drained.load(SeqCst));

        assert_eq!(s.take().await, Ok(Some(1)));
        assert!(drained.load(SeqCst));
    }

    #[tokio::test]
    async fn xform_terminates_the_stream() {
        let s = stream_with(StreamOptions::<i32>::default().capacity(8).xform(crate::xform::taking(2)));
        assert_eq!(s.put(1).await, Ok(true));
        assert_eq!(s.put(2).await, Ok(true));
        assert!(s.is_closed());
        assert_eq!(s.put(3).await, Ok(false));

        assert_eq!(s.take().await, Ok(Some(1)));
        assert_eq!(s.take().await, Ok(Some(2)));
        assert_eq!(s.take().await, Ok(None));
    }

    #[tokio::test]
    async fn xform_may_drop_or_multiply_messages() {
        struct Doubling;
        impl Transducer<i32> for Doubling {
            fn step(&mut self, input: i32, out: &mut Vec<i32>) -> ControlFlow<()> {
                if input % 2 == 0 {
                    out.push(input);
                    out.push(input);
                }
                ControlFlow::Continue(())
            }
        }

        let s = stream_with(StreamOptions::<i32>::default().capacity(8).xform(Doubling));
        assert_eq!(s.put(1).await, Ok(true));
        assert_eq!(s.put(2).await, Ok(true));
        s.close();
        assert_eq!(s.take().await, Ok(Some(2)));
        assert_eq!(s.take().await, Ok(Some(2)));
        assert_eq!(s.take().await, Ok(None));
    }

    #[tokio::test]
    async fn xform_flushes_at_close() {
        struct SummingPairs {
            pending: Option<i32>,
        }
        impl Transducer<i32> for SummingPairs {
            fn step(&mut self, input: i32, out: &mut Vec<i32>) -> ControlFlow<()> {
                match self.pending.take() {
                    Some(first) => out.push(first + input),
                    None => self.pending = Some(input),
                }
                ControlFlow::Continue(())
            }

            fn flush(&mut self, out: &mut Vec<i32>) {
                if let Some(first) = self.pending.take() {
                    out.push(first);
                }
            }
        }

        let s = stream_with(
            StreamOptions::<i32>::default()
                .capacity(8)
                .xform(SummingPairs { pending: None }),
        );
        s.put(1);
        s.put(2);
        s.put(10);
        s.close();
        assert_eq!(s.take().await, Ok(Some(3)));
        assert_eq!(s.take().await, Ok(Some(10)));
        assert_eq!(s.take().await, Ok(None));
    }

    #[tokio::test]
    async fn permanent_stream_ignores_close() {
        let s = stream_with(StreamOptions::<i32>::default().permanent(true));
        s.close();
        assert!(!s.is_closed());
    }

    #[tokio::test]
    async fn dropping_the_stream_unparks_waiters() {
        let s = stream::<i32>();
        let take = s.take();
        let put = s.put(1);
        // the put pairs with the take through the queue, so park a second one
        let second = s.put(2);
        drop(s);
        assert_eq!(take.await, Ok(Some(1)));
        assert_eq!(put.await, Ok(true));
        assert_eq!(second.await, Ok(false));
    }

    #[tokio::test]
    async fn task_executor_still_pairs_puts_and_takes() {
        let s = stream_with(StreamOptions::<i32>::default().executor(Executor::Task));
        let put = s.put(7);
        assert_eq!(s.take().await, Ok(Some(7)));
        assert_eq!(put.await, Ok(true));
    }
}
