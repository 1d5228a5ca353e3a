use crate::xform::Transducer;

/// Where the continuations of a stream's put/take deferreds run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Executor {
    /// Continuations run inline on the thread that resolves the deferred.
    #[default]
    Inline,
    /// Continuations run on a fresh runtime task, keeping slow consumers off
    /// the producer's thread.
    Task,
}

/// Configuration for [`stream_with`](crate::stream_with).
pub struct StreamOptions<T> {
    /// Number of messages that may be buffered before puts park.
    ///
    /// With capacity `0` the stream is a rendezvous: a put resolves only once
    /// a matching take arrives.
    pub capacity: usize,
    /// A permanent stream ignores `close`.
    pub permanent: bool,
    /// Overrides the generated description.
    pub description: Option<String>,
    /// Where waiter continuations are dispatched.
    pub executor: Executor,
    /// Operator applied between put and take.
    pub xform: Option<Box<dyn Transducer<T>>>,
}

impl<T> Default for StreamOptions<T> {
    fn default() -> Self {
        Self {
            capacity: 0,
            permanent: false,
            description: None,
            executor: Executor::Inline,
            xform: None,
        }
    }
}

impl<T> StreamOptions<T> {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn xform(mut self, xform: impl Transducer<T> + 'static) -> Self {
        self.xform = Some(Box::new(xform));
        self
    }
}

impl<T> From<usize> for StreamOptions<T> {
    fn from(capacity: usize) -> Self {
        Self::default().capacity(capacity)
    }
}

/// Configuration for [`connect`](crate::connect).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Closing the sink also closes the source, even when other sinks remain
    /// attached.
    pub upstream: bool,
    /// Draining the source closes the sink.
    pub downstream: bool,
    /// Per-message put timeout; an elapsed put closes the sink so one slow
    /// message cannot block the rest of the pipeline.
    pub timeout: Option<std::time::Duration>,
    /// Labels the edge in [`downstream`](crate::EventSource::downstream)
    /// listings.
    pub description: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            upstream: false,
            downstream: true,
            timeout: None,
            description: None,
        }
    }
}

impl ConnectOptions {
    pub fn upstream(mut self, upstream: bool) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn downstream(mut self, downstream: bool) -> Self {
        self.downstream = downstream;
        self
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<&str> for ConnectOptions {
    fn from(description: &str) -> Self {
        Self::default().description(description)
    }
}
