//! Types for store change subscriptions
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A raw event delivered by a store watch
#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// Map the carried object, keeping the event type
    pub fn map<T>(self, f: impl FnOnce(K) -> T) -> WatchEvent<T> {
        match self {
            WatchEvent::Added(k) => WatchEvent::Added(f(k)),
            WatchEvent::Modified(k) => WatchEvent::Modified(f(k)),
            WatchEvent::Deleted(k) => WatchEvent::Deleted(f(k)),
        }
    }

    /// Like [`WatchEvent::map`] for fallible conversions
    pub fn try_map<T, E>(self, f: impl FnOnce(K) -> Result<T, E>) -> Result<WatchEvent<T>, E> {
        Ok(match self {
            WatchEvent::Added(k) => WatchEvent::Added(f(k)?),
            WatchEvent::Modified(k) => WatchEvent::Modified(f(k)?),
            WatchEvent::Deleted(k) => WatchEvent::Deleted(f(k)?),
        })
    }

    /// The object the event is about
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(k) | WatchEvent::Modified(k) | WatchEvent::Deleted(k) => k,
        }
    }
}

impl<K> Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
        }
    }
}
