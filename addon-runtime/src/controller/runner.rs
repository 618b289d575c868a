use super::future_hash_map::FutureHashMap;
use crate::scheduler::{ScheduleRequest, Scheduler};
use futures::{Future, Stream, StreamExt};
use pin_project::pin_project;
use std::{
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};

/// Pulls keys from a [`Scheduler`] and runs one future per key, several keys in parallel.
///
/// A key that comes due while a future for an equal key is still running is held back until
/// that future finishes. With a `max_concurrent` above zero, keys are also held back while that
/// many futures are in flight.
#[pin_project]
pub struct Runner<T, R, F, MkF> {
    #[pin]
    scheduler: Scheduler<T, R>,
    run_msg: MkF,
    slots: FutureHashMap<T, F>,
    max_concurrent: usize,
}

impl<T, R, F, MkF> Runner<T, R, F, MkF>
where
    F: Future + Unpin,
    MkF: FnMut(&T) -> F,
{
    /// A runner without a concurrency limit
    pub fn new(scheduler: Scheduler<T, R>, run_msg: MkF) -> Self {
        Self {
            scheduler,
            run_msg,
            slots: FutureHashMap::default(),
            max_concurrent: 0,
        }
    }

    /// Run at most `max_concurrent` futures at once, `0` meaning no limit
    #[must_use]
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}

impl<T, R, F, MkF> Stream for Runner<T, R, F, MkF>
where
    T: Eq + Hash + Clone + Unpin,
    R: Stream<Item = ScheduleRequest<T>>,
    F: Future + Unpin,
    MkF: FnMut(&T) -> F,
{
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let slots = this.slots;
        let max_concurrent = *this.max_concurrent;
        if let Poll::Ready(Some(result)) = slots.poll_next_unpin(cx) {
            return Poll::Ready(Some(result));
        }
        loop {
            // Keys that are already running, or that would exceed the limit, stay in the
            // scheduler and are picked up once a slot frees up.
            let next_msg_poll = this
                .scheduler
                .as_mut()
                .hold_unless(|msg| {
                    !slots.contains_key(msg) && (max_concurrent == 0 || slots.len() < max_concurrent)
                })
                .poll_next_unpin(cx);
            match next_msg_poll {
                Poll::Ready(Some(msg)) => {
                    let msg_fut = (this.run_msg)(&msg);
                    slots.insert(msg, msg_fut);
                    cx.waker().wake_by_ref();
                }
                Poll::Ready(None) => {
                    // no more requests, but running futures still have to finish
                    break if !slots.is_empty() {
                        Poll::Pending
                    } else {
                        Poll::Ready(None)
                    };
                }
                Poll::Pending => break Poll::Pending,
            }
        }
    }
}
