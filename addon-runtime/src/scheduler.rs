//! Delays and deduplicates reconcile requests
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request to re-emit `message` at a given `Instant` (`run_at`).
#[derive(Debug)]
pub struct ScheduleRequest<T> {
    /// The message to emit, usually an object reference
    pub message: T,
    /// When to emit it
    pub run_at: Instant,
}

/// Bookkeeping for a message sitting in the delay queue
struct Slot {
    run_at: Instant,
    queue_key: delay_queue::Key,
}

/// A stream of messages released at their scheduled time
///
/// Created by [`scheduler`].
#[pin_project(project = SchedulerProj)]
pub struct Scheduler<T, R> {
    /// Messages waiting for their time to come
    ///
    /// Only touched through `schedule` and `poll_due`, so that `slots` stays in sync.
    queue: DelayQueue<T>,
    /// One slot per queued message, used to merge duplicates
    slots: HashMap<T, Slot>,
    /// Messages that are due, but were refused by the `hold_unless` predicate
    held: HashSet<T>,
    /// Incoming schedule requests
    #[pin]
    requests: Fuse<R>,
}

impl<T, R: Stream> Scheduler<T, R> {
    fn new(requests: R) -> Self {
        Self {
            queue: DelayQueue::new(),
            slots: HashMap::new(),
            held: HashSet::new(),
            requests: requests.fuse(),
        }
    }
}

impl<T: Hash + Eq + Clone, R> SchedulerProj<'_, T, R> {
    /// Queue a message, merging it with an already queued copy
    ///
    /// The earlier `run_at` wins. A message that is already due but held is left alone,
    /// it will be released as soon as the predicate allows.
    fn schedule(&mut self, request: ScheduleRequest<T>) {
        if self.held.contains(&request.message) {
            return;
        }
        match self.slots.entry(request.message) {
            Entry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                if request.run_at < slot.run_at {
                    self.queue.reset_at(&slot.queue_key, request.run_at);
                    slot.run_at = request.run_at;
                }
            }
            Entry::Vacant(slot) => {
                let message = slot.key().clone();
                slot.insert(Slot {
                    run_at: request.run_at,
                    queue_key: self.queue.insert_at(message, request.run_at),
                });
            }
        }
    }

    /// Pop the next due message that `can_take` accepts
    fn poll_due(&mut self, cx: &mut Context<'_>, can_take: impl Fn(&T) -> bool) -> Poll<Option<T>> {
        if let Some(msg) = self.held.iter().find(|msg| can_take(msg)).cloned() {
            self.held.remove(&msg);
            return Poll::Ready(Some(msg));
        }

        loop {
            match self.queue.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let msg = expired.into_inner();
                    self.slots.remove(&msg);
                    if can_take(&msg) {
                        break Poll::Ready(Some(msg));
                    }
                    self.held.insert(msg);
                }
                // held messages keep the stream alive
                Poll::Ready(None) if !self.held.is_empty() => break Poll::Pending,
                Poll::Ready(None) => break Poll::Ready(None),
                Poll::Pending => break Poll::Pending,
            }
        }
    }
}

/// See [`Scheduler::hold_unless`]
pub struct HoldUnless<'a, T, R, C> {
    scheduler: Pin<&'a mut Scheduler<T, R>>,
    can_take: C,
}

impl<T, R, C> Stream for HoldUnless<'_, T, R, C>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
    C: Fn(&T) -> bool + Unpin,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let can_take = &this.can_take;
        let mut scheduler = this.scheduler.as_mut().project();

        while let Poll::Ready(Some(request)) = scheduler.requests.as_mut().poll_next(cx) {
            scheduler.schedule(request);
        }

        match scheduler.poll_due(cx, can_take) {
            Poll::Ready(None) if !scheduler.requests.is_terminated() => Poll::Pending,
            due => due,
        }
    }
}

impl<T, R> Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    /// A filtered view of the [`Scheduler`] that keeps due messages back while
    /// `can_take` refuses them, and releases them as soon as it accepts.
    ///
    /// The view is cheap and loses nothing when dropped, so it is meant to be recreated on
    /// every poll. `can_take` runs for every held message on every poll.
    pub fn hold_unless<C: Fn(&T) -> bool>(self: Pin<&mut Self>, can_take: C) -> HoldUnless<'_, T, R, C> {
        HoldUnless {
            scheduler: self,
            can_take,
        }
    }

    /// Whether `msg` is due but held back by `hold_unless`
    #[cfg(test)]
    pub fn is_held(&self, msg: &T) -> bool {
        self.held.contains(msg)
    }
}

impl<T, R> Stream for Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.hold_unless(|_| true)).poll_next(cx)
    }
}

/// Emits each requested message at its `run_at`
///
/// A message requested again before it was emitted is only emitted once, at the earlier of
/// the two instants.
pub fn scheduler<T: Eq + Hash + Clone, S: Stream<Item = ScheduleRequest<T>>>(requests: S) -> Scheduler<T, S> {
    Scheduler::new(requests)
}

#[cfg(test)]
mod tests {
    use super::{scheduler, ScheduleRequest};
    use futures::{channel::mpsc, poll, stream, FutureExt, StreamExt};
    use tokio::time::{advance, pause, Duration, Instant};

    fn at(message: &'static str, secs: u64) -> ScheduleRequest<&'static str> {
        ScheduleRequest {
            message,
            run_at: Instant::now() + Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn held_messages_are_released_once_accepted() {
        pause();
        let mut scheduler = Box::pin(scheduler(stream::iter(vec![at("flux-a", 0)])));
        assert!(poll!(scheduler.as_mut().hold_unless(|_| false).next()).is_pending());
        assert!(scheduler.is_held(&"flux-a"));

        let released = scheduler.as_mut().hold_unless(|_| true).next().now_or_never();
        assert_eq!(released, Some(Some("flux-a")));
        assert!(!scheduler.is_held(&"flux-a"));
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test]
    async fn held_message_does_not_block_others() {
        let mut scheduler = Box::pin(scheduler(stream::iter(vec![at("flux-a", 0), at("flux-b", 0)])));
        let next = scheduler.as_mut().hold_unless(|m| *m != "flux-a").next().await;
        assert_eq!(next, Some("flux-b"));
    }

    #[tokio::test]
    async fn requests_for_held_messages_are_merged() {
        pause();
        let (tx, rx) = mpsc::unbounded();
        let mut scheduler = Box::pin(scheduler(rx));
        tx.unbounded_send(at("flux-a", 0)).unwrap();
        assert!(poll!(scheduler.as_mut().hold_unless(|_| false).next()).is_pending());
        tx.unbounded_send(at("flux-a", 0)).unwrap();
        drop(tx);
        assert_eq!(scheduler.next().await, Some("flux-a"));
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test]
    async fn messages_are_emitted_in_time_order() {
        pause();
        let mut scheduler = scheduler(stream::iter(vec![at("late", 3), at("early", 1)]));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some("early")));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never(), Some(Some("late")));
        assert_eq!(scheduler.next().await, None);
    }

    #[tokio::test]
    async fn duplicates_run_once_at_the_earliest_time() {
        pause();
        for reversed in [false, true] {
            // relative to the current time, which moves on every round
            let mut requests = vec![at("x", 1), at("x", 3)];
            if reversed {
                requests.reverse();
            }
            let mut scheduler = scheduler(stream::iter(requests));
            assert!(poll!(scheduler.next()).is_pending());
            advance(Duration::from_secs(2)).await;
            assert_eq!(scheduler.next().now_or_never(), Some(Some("x")));
            assert_eq!(scheduler.next().await, None);
        }
    }

    #[tokio::test]
    async fn emitted_messages_can_be_scheduled_again() {
        pause();
        let (tx, rx) = mpsc::unbounded();
        let mut scheduler = scheduler(rx);
        for _ in 0..2 {
            tx.unbounded_send(at("x", 1)).unwrap();
            assert!(poll!(scheduler.next()).is_pending());
            advance(Duration::from_secs(2)).await;
            assert_eq!(scheduler.next().now_or_never(), Some(Some("x")));
            assert!(poll!(scheduler.next()).is_pending());
        }
    }
}
