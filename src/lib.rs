//! Deferred-driven event streams with backpressure.
//!
//! The crate is built around three pieces:
//!
//! - [`Deferred`] — a single-assignment cell with chainable continuations,
//!   timeouts, and error propagation. Every other operation trades in
//!   deferreds.
//! - The sink/source contract ([`EventSink`], [`EventSource`]) — puts and
//!   takes return deferreds instead of blocking, and closure/drainage are
//!   reported as signals, not errors. [`stream()`](fn@stream) builds the
//!   default buffered stream; [`connect`] wires a source into a sink with a
//!   transfer loop that keeps at most one put outstanding.
//! - A combinator algebra over both — [`SourceExt`] and [`FlowExt`] provide
//!   `map`, `filter`, `zip`, `reductions`, `batch`, `throttle`, and
//!   friends, each a small concurrent state machine preserving the
//!   one-outstanding-put backpressure invariant end to end.
//!
//! # Cargo Features
//!
//! One backend runtime feature must be enabled:
//!
//! - `runtime-tokio` (default) runs timers and transfer loops on [tokio].
//! - `runtime-async-std` runs them on async-std.
//!
//! # Example
//!
//! ```rust
//! use futures::StreamExt as _;
//! use millrace::{prelude::*, stream_with};
//!
//! #[tokio::main]
//! async fn main() {
//!     let s = stream_with::<u32>(8);
//!     for value in 0..6 {
//!         s.put(value);
//!     }
//!     s.close();
//!
//!     let batches: Vec<_> = s
//!         .map(|value| value * 2)
//!         .batch(2, None)
//!         .drain()
//!         .collect()
//!         .await;
//!     assert_eq!(batches, vec![vec![0, 2], vec![4, 6], vec![8, 10]]);
//! }
//! ```

/// Commonly used traits.
pub mod prelude {
    pub use super::{
        flow::FlowExt,
        ops::SourceExt,
        stream::{EventSink, EventSource, EventStream},
    };
}

mod buffered;
mod common;
pub mod config;
pub mod deferred;
mod error;
mod flow;
mod graph;
mod ops;
pub mod rt;
mod stream;
pub mod time;
pub mod xform;

pub use buffered::{stream, stream_with, DefaultStream};
pub use config::{ConnectOptions, Executor, StreamOptions};
pub use deferred::{loop_deferred, Deferred, Loop};
pub use error::Error;
pub use flow::{buffered_stream, BufferedStream, FlowExt};
pub use graph::{connect, connect_via, connect_via_proxy, consume, CallbackSink, Edge};
pub use ops::{concat, map2, periodically, realize_each, zip, zip_all, Drain, SourceExt};
pub use stream::{
    splice, Connector, EventSink, EventSource, EventStream, PutResult, SinkProxy, SinkRef,
    SourceProxy, SourceRef, Spliced, TakeResult,
};
