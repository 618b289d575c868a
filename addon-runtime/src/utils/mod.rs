//! Helpers for manipulating built-in streams

mod backoff_resettable;
mod event_flatten;
mod stream_backoff;
mod watch_ext;

pub use backoff_resettable::{ResettableBackoff, ResettableBackoffWrapper};
pub use event_flatten::EventFlatten;
pub use stream_backoff::StreamBackoff;
pub use watch_ext::WatchStreamExt;

use futures::{Future, FutureExt};
use std::{pin::Pin, task::Poll};
use tokio::{runtime::Handle, task::JoinHandle};

/// A [`JoinHandle`] that cancels the [`Future`] when dropped, rather than detaching it
pub struct CancelableJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> CancelableJoinHandle<T>
where
    T: Send + 'static,
{
    /// Spawn `future` onto `runtime`
    pub fn spawn(future: impl Future<Output = T> + Send + 'static, runtime: &Handle) -> Self {
        CancelableJoinHandle {
            inner: runtime.spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort()
    }
}

impl<T> Future for CancelableJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map(|result| match result {
            Ok(output) => output,
            // the task is only aborted when this handle is dropped, so this is a panic to propagate
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        })
    }
}
