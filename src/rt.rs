//! Asynchronous runtime methods.

use crate::common::*;

#[cfg(not(any(
    all(feature = "runtime-async-std", not(feature = "runtime-tokio")),
    all(not(feature = "runtime-async-std"), feature = "runtime-tokio"),
)))]
compile_error!(
    "one of 'runtime-tokio', 'runtime-async-std' feature must be enabled for this crate"
);

#[cfg(not(any(
    all(feature = "runtime-async-std", not(feature = "runtime-tokio")),
    all(not(feature = "runtime-async-std"), feature = "runtime-tokio"),
)))]
pub use rt_dummy::*;

#[cfg(all(not(feature = "runtime-async-std"), feature = "runtime-tokio"))]
pub use rt_tokio::*;

#[cfg(all(feature = "runtime-async-std", not(feature = "runtime-tokio")))]
pub use rt_async_std::*;

#[cfg(not(any(
    all(feature = "runtime-async-std", not(feature = "runtime-tokio")),
    all(not(feature = "runtime-async-std"), feature = "runtime-tokio"),
)))]
mod rt_dummy {
    use super::*;
    use std::marker::PhantomData;

    pub fn spawn<F>(_: F) -> JoinHandle<F::Output>
    where
        F: 'static + Future + Send,
        F::Output: 'static + Send,
    {
        panic!();
    }

    pub async fn sleep(_: Duration) {
        panic!();
    }

    #[derive(Debug)]
    #[repr(transparent)]
    pub struct JoinHandle<T> {
        _phantom: PhantomData<T>,
    }

    impl<T> Future for JoinHandle<T> {
        type Output = T;

        fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
            panic!();
        }
    }
}

#[cfg(all(not(feature = "runtime-async-std"), feature = "runtime-tokio"))]
mod rt_tokio {
    use super::*;

    pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
    where
        F: 'static + Future + Send,
        F::Output: 'static + Send,
    {
        JoinHandle(tokio::spawn(future))
    }

    pub async fn sleep(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[derive(Debug)]
    #[repr(transparent)]
    pub struct JoinHandle<T>(tokio::task::JoinHandle<T>);

    impl<T> Future for JoinHandle<T> {
        type Output = T;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            Pin::new(&mut self.0).poll(cx).map(|result| result.unwrap())
        }
    }
}

#[cfg(all(feature = "runtime-async-std", not(feature = "runtime-tokio")))]
mod rt_async_std {
    use super::*;

    pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
    where
        F: 'static + Future + Send,
        F::Output: 'static + Send,
    {
        JoinHandle(async_std::task::spawn(future))
    }

    pub async fn sleep(duration: Duration) {
        async_std::task::sleep(duration).await;
    }

    #[derive(Debug)]
    #[repr(transparent)]
    pub struct JoinHandle<T>(async_std::task::JoinHandle<T>);

    impl<T> Future for JoinHandle<T> {
        type Output = T;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            Pin::new(&mut self.0).poll(cx)
        }
    }
}
