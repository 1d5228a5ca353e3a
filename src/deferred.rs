//! Single-assignment deferreds.
//!
//! A [`Deferred`] is the synchronization currency of this crate: every put,
//! take, timeout, and combinator step yields one. It resolves at most once,
//! to a value or an [`Error`], and every continuation registered against it
//! observes that final state exactly once, in registration order.

use crate::{common::*, config::Executor, error::Error, rt};

type Callback<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

enum State<T> {
    Pending {
        callbacks: Vec<Callback<T>>,
        wakers: Vec<Waker>,
    },
    Done(Result<T, Error>),
}

struct Shared<T> {
    executor: Executor,
    state: Mutex<State<T>>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let State::Pending { callbacks, wakers } = state {
                for callback in callbacks.drain(..) {
                    callback(Err(Error::Abandoned));
                }
                for waker in wakers.drain(..) {
                    waker.wake();
                }
            }
        }
    }
}

/// A write-once cell with chainable continuations.
///
/// Cloning produces another handle onto the same cell. `Deferred` implements
/// [`Future`], so it can be awaited directly; the output is the resolution
/// `Result`.
pub struct Deferred<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        let label = match &*state {
            State::Pending { .. } => "pending",
            State::Done(Ok(_)) => "success",
            State::Done(Err(_)) => "error",
        };
        f.debug_tuple("Deferred").field(&label).finish()
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    /// Creates a pending deferred whose continuations run inline.
    pub fn new() -> Self {
        Self::with_executor(Executor::Inline)
    }

    /// Creates a pending deferred whose continuations run per `executor`.
    pub fn with_executor(executor: Executor) -> Self {
        Self {
            inner: Arc::new(Shared {
                executor,
                state: Mutex::new(State::Pending {
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    pub fn is_realized(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(_))
    }
}

impl<T> Deferred<T>
where
    T: 'static + Send + Clone,
{
    /// Creates a deferred already resolved to `value`.
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.succeed(value);
        deferred
    }

    /// Creates a deferred already resolved to `error`.
    pub fn failed(error: Error) -> Self {
        let deferred = Self::new();
        deferred.fail(error);
        deferred
    }

    /// Resolves the deferred. Returns `false` when it was already resolved.
    pub fn resolve(&self, result: Result<T, Error>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { callbacks, wakers } => {
                    let callbacks = mem::take(callbacks);
                    let wakers = mem::take(wakers);
                    *state = State::Done(result.clone());
                    (callbacks, wakers)
                }
            }
        };
        match self.inner.executor {
            Executor::Inline => {
                for callback in callbacks {
                    callback(result.clone());
                }
                for waker in wakers {
                    waker.wake();
                }
            }
            Executor::Task => {
                rt::spawn(async move {
                    for callback in callbacks {
                        callback(result.clone());
                    }
                    for waker in wakers {
                        waker.wake();
                    }
                });
            }
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.resolve(Err(error))
    }

    /// Registers a continuation.
    ///
    /// Runs immediately when the deferred is already resolved; otherwise runs
    /// once, in registration order, at resolution.
    pub fn on_resolved(&self, f: impl FnOnce(Result<T, Error>) + Send + 'static) {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(f));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        f(result);
    }

    /// Flat-maps the resolution: once this deferred yields a value, `f`
    /// produces the next deferred in the chain. Errors short-circuit.
    pub fn chain<U, F>(self, f: F) -> Deferred<U>
    where
        U: 'static + Send + Clone,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let out = Deferred::new();
        let link = out.clone();
        self.on_resolved(move |result| match result {
            Ok(value) => f(value).on_resolved(move |next| {
                link.resolve(next);
            }),
            Err(error) => {
                link.fail(error);
            }
        });
        out
    }

    /// Maps the resolved value.
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: 'static + Send + Clone,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(move |value| Deferred::resolved(f(value)))
    }

    /// Intercepts an error. `Some(value)` recovers; `None` re-raises.
    pub fn catch<F>(self, f: F) -> Deferred<T>
    where
        F: FnOnce(&Error) -> Option<T> + Send + 'static,
    {
        let out = Deferred::new();
        let link = out.clone();
        self.on_resolved(move |result| match result {
            Ok(value) => {
                link.succeed(value);
            }
            Err(error) => match f(&error) {
                Some(value) => {
                    link.succeed(value);
                }
                None => {
                    link.fail(error);
                }
            },
        });
        out
    }

    /// Fails with [`Error::Timeout`] when still pending after `duration`.
    pub fn timeout(self, duration: Duration) -> Deferred<T> {
        self.timeout_with(duration, Err(Error::Timeout))
    }

    /// Resolves to `default` when still pending after `duration`.
    pub fn timeout_or(self, duration: Duration, default: T) -> Deferred<T> {
        self.timeout_with(duration, Ok(default))
    }

    fn timeout_with(self, duration: Duration, fallback: Result<T, Error>) -> Deferred<T> {
        let out = Deferred::new();
        let link = out.clone();
        self.on_resolved(move |result| {
            link.resolve(result);
        });
        let timer = out.clone();
        rt::spawn(async move {
            rt::sleep(duration).await;
            timer.resolve(fallback);
        });
        out
    }

    /// Blocks the calling thread until resolution.
    ///
    /// For interop boundaries only; inside a task, await the deferred
    /// instead.
    pub fn wait(self) -> Result<T, Error> {
        let (tx, rx) = flume::bounded(1);
        self.on_resolved(move |result| {
            let _ = tx.send(result);
        });
        drop(self);
        rx.recv().unwrap_or(Err(Error::Abandoned))
    }
}

impl<T> Future for Deferred<T>
where
    T: 'static + Send + Clone,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Done(result) => Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Pending
            }
        }
    }
}

/// Combines deferreds into a deferred of their values, in input order.
/// The first error resolves the output to that error.
pub fn zip<T>(deferreds: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>>
where
    T: 'static + Send + Clone,
{
    let deferreds: Vec<_> = deferreds.into_iter().collect();
    let count = deferreds.len();
    let out = Deferred::new();
    if count == 0 {
        out.succeed(Vec::new());
        return out;
    }

    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; count]));
    let remaining = Arc::new(AtomicUsize::new(count));

    for (index, deferred) in deferreds.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let out = out.clone();
        deferred.on_resolved(move |result| match result {
            Ok(value) => {
                slots.lock().unwrap()[index] = Some(value);
                if remaining.fetch_sub(1, SeqCst) == 1 {
                    let values = slots
                        .lock()
                        .unwrap()
                        .iter_mut()
                        .map(|slot| slot.take().expect("zip slot unfilled"))
                        .collect();
                    out.succeed(values);
                }
            }
            Err(error) => {
                out.fail(error);
            }
        });
    }

    out
}

/// Pairs two deferreds of different types.
pub fn zip2<A, B>(a: Deferred<A>, b: Deferred<B>) -> Deferred<(A, B)>
where
    A: 'static + Send + Clone,
    B: 'static + Send + Clone,
{
    a.chain(move |x| b.map(move |y| (x, y)))
}

/// Control value for [`loop_deferred`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loop<T, S> {
    Break(T),
    Continue(S),
}

/// Trampolined tail-recursive chaining.
///
/// `f` is applied to the loop state and yields a deferred of either the next
/// state or the final value. The turns are driven by a spawned task, so the
/// call stack stays flat no matter how many turns resolve synchronously.
pub fn loop_deferred<S, T, F>(seed: S, mut f: F) -> Deferred<T>
where
    S: 'static + Send + Clone,
    T: 'static + Send + Clone,
    F: FnMut(S) -> Deferred<Loop<T, S>> + Send + 'static,
{
    let out = Deferred::new();
    let link = out.clone();
    rt::spawn(async move {
        let mut state = seed;
        loop {
            match f(state).await {
                Ok(Loop::Continue(next)) => state = next,
                Ok(Loop::Break(value)) => {
                    link.succeed(value);
                    break;
                }
                Err(error) => {
                    link.fail(error);
                    break;
                }
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_at_most_once() {
        let d = Deferred::new();
        assert!(d.succeed(1));
        assert!(!d.succeed(2));
        assert!(!d.fail(Error::Timeout));
        assert_eq!(d.await, Ok(1));
    }

    #[tokio::test]
    async fn continuations_run_in_registration_order() {
        let d = Deferred::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            d.on_resolved(move |_| seen.lock().unwrap().push(label));
        }
        d.succeed(());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn late_registration_runs_immediately() {
        let d = Deferred::resolved(7);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        d.on_resolved(move |result| {
            seen2.store(result.unwrap(), SeqCst);
        });
        assert_eq!(seen.load(SeqCst), 7);
    }

    #[tokio::test]
    async fn chain_on_resolved_applies_directly() {
        let out = Deferred::resolved(1).chain(|v| Deferred::resolved(v + 1));
        assert_eq!(out.await, Ok(2));
    }

    #[tokio::test]
    async fn chain_short_circuits_errors() {
        let out = Deferred::<i32>::failed(Error::failure("boom"))
            .chain(|v| Deferred::resolved(v + 1))
            .map(|v| v * 10);
        assert_eq!(out.await, Err(Error::failure("boom")));
    }

    #[tokio::test]
    async fn catch_recovers_and_reraises() {
        let recovered = Deferred::<i32>::failed(Error::Timeout).catch(|_| Some(-1));
        assert_eq!(recovered.await, Ok(-1));

        let reraised = Deferred::<i32>::failed(Error::Timeout).catch(|_| None);
        assert_eq!(reraised.await, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn zip_collects_in_order() {
        let a = Deferred::new();
        let b = Deferred::new();
        let out = zip([a.clone(), b.clone()]);
        b.succeed(2);
        a.succeed(1);
        assert_eq!(out.await, Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn zip_fails_on_first_error() {
        let a = Deferred::<i32>::new();
        let b = Deferred::new();
        let out = zip([a.clone(), b.clone()]);
        b.fail(Error::Timeout);
        assert_eq!(out.await, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn zip2_pairs_distinct_types() {
        let out = zip2(Deferred::resolved(1), Deferred::resolved("a"));
        assert_eq!(out.await, Ok((1, "a")));
    }

    #[tokio::test]
    async fn timeout_fires_on_pending() {
        let out = Deferred::<i32>::new().timeout(Duration::from_millis(10));
        assert_eq!(out.await, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn zero_timeout_yields_default() {
        let out = Deferred::<i32>::new().timeout_or(Duration::ZERO, 42);
        assert_eq!(out.await, Ok(42));
    }

    #[tokio::test]
    async fn timeout_does_not_override_resolution() {
        let d = Deferred::new();
        d.succeed(5);
        let out = d.timeout(Duration::from_millis(5));
        assert_eq!(out.await, Ok(5));
    }

    #[tokio::test]
    async fn loop_deferred_trampolines() {
        let out = loop_deferred((0u64, 0u64), |(index, sum)| {
            if index == 10 {
                Deferred::resolved(Loop::Break(sum))
            } else {
                Deferred::resolved(Loop::Continue((index + 1, sum + index)))
            }
        });
        assert_eq!(out.await, Ok(45));
    }

    #[tokio::test]
    async fn wait_returns_resolved_value() {
        let d = Deferred::resolved(3);
        assert_eq!(d.wait(), Ok(3));
    }

    #[test]
    fn wait_observes_abandonment() {
        let d = Deferred::<i32>::new();
        let waiter = {
            let d = d.clone();
            std::thread::spawn(move || d.wait())
        };
        drop(d);
        assert_eq!(waiter.join().unwrap(), Err(Error::Abandoned));
    }
}
