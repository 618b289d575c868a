use ahash::AHashMap;
use futures::{Future, FutureExt, Stream};
use std::{
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};

/// A set of keyed futures, polled as one stream of their outputs
///
/// At most one future per key. Membership checks are O(1), which is what the runner needs
/// to decide whether a key is currently being reconciled.
///
/// `F` must be [`Unpin`], since the map moves its entries around when it grows.
/// Polling order is arbitrary and makes no fairness promises.
#[derive(Debug)]
pub struct FutureHashMap<K, F> {
    futures: AHashMap<K, F>,
}

impl<K, F> Default for FutureHashMap<K, F> {
    fn default() -> Self {
        Self {
            futures: AHashMap::new(),
        }
    }
}

impl<K, F> FutureHashMap<K, F>
where
    K: Hash + Eq,
{
    /// Inserts `future` into the key `key`, returning the old future if there was one
    pub fn insert(&mut self, key: K, future: F) -> Option<F> {
        self.futures.insert(key, future)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.futures.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }
}

impl<K, F> Stream for FutureHashMap<K, F>
where
    K: Hash + Clone + Eq,
    F: Future + Unpin,
    Self: Unpin,
{
    type Item = F::Output;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let finished = self
            .futures
            .iter_mut()
            .find_map(|(key, future)| match future.poll_unpin(cx) {
                Poll::Ready(out) => Some((key.clone(), out)),
                Poll::Pending => None,
            });
        match finished {
            Some((key, out)) => {
                self.futures.remove(&key);
                Poll::Ready(Some(out))
            }
            None if self.futures.is_empty() => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FutureHashMap;
    use futures::{channel::oneshot, future, poll, StreamExt};
    use std::task::Poll;

    #[tokio::test]
    async fn yields_outputs_and_forgets_finished_keys() {
        let mut map = FutureHashMap::default();
        let (tx, rx) = oneshot::channel::<u8>();
        map.insert("slow", future::Either::Left(rx));
        map.insert("fast", future::Either::Right(future::ready(Ok(2))));
        assert!(map.contains_key(&"fast"));

        assert_eq!(map.next().await, Some(Ok(2)));
        assert!(!map.contains_key(&"fast"));
        assert_eq!(map.len(), 1);
        assert!(poll!(map.next()).is_pending());

        tx.send(1).unwrap();
        assert_eq!(map.next().await, Some(Ok(1)));
        assert_eq!(poll!(map.next()), Poll::Ready(None));
    }
}
