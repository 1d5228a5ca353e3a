pub use derivative::Derivative;
pub use futures::{
    future::{BoxFuture, FutureExt as _},
    stream::{Stream, StreamExt as _},
};
pub use std::{
    collections::VecDeque,
    fmt::{self, Debug, Display},
    future::Future,
    mem,
    ops::ControlFlow,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::*},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll, Poll::*, Waker},
    time::{Duration, Instant},
};
