//! Deduplication of concurrent work by key.
//!
//! Feed readers tend to poll in bursts: a popular profile may be requested by
//! many subscribers at the same moment, and discovery for a profile may be
//! triggered by several users adding it at once. [`Coalescer`] makes sure
//! only one upstream operation per key runs at a time; everyone else who asks
//! for the same key while it runs attaches to it and receives a clone of its
//! result, success or failure.
//!
//! Each run is spawned onto the runtime, so it completes even if every caller
//! waiting on it gives up.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use derive_more::Debug;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::task::JoinError;
use tracing::debug;

struct InFlight<T, E> {
    id: u64,
    result: Shared<BoxFuture<'static, Result<T, E>>>,
}

/// Runs at most one operation per key at a time.
///
/// Cheaply cloneable; clones share state.
#[derive(Debug)]
pub struct Coalescer<T, E> {
    #[debug("{} in flight", inflight.len())]
    inflight: Arc<DashMap<String, InFlight<T, E>>>,
    next_id: Arc<AtomicU64>,
}

impl<T, E> Clone for Coalescer<T, E> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T, E> Default for Coalescer<T, E> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `producer` for `key`, or attach to the run already in flight.
    ///
    /// `producer` is only called when nothing is in flight for the key. The
    /// in-flight marker is removed when the operation settles, so the next
    /// call after that starts a fresh run. Dropping the returned future never
    /// cancels the operation, whether or not other callers are attached.
    ///
    /// `producer` is called while the key's map shard is locked: it must only
    /// construct the future, not use this coalescer. If the spawned run
    /// panics, attached callers receive the [`JoinError`] converted to `E`.
    pub async fn coalesce<F, Fut>(&self, key: &str, producer: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let result = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                debug!(key, "coalesce.attach");
                entry.get().result.clone()
            }
            Entry::Vacant(entry) => {
                debug!(key, "coalesce.start");
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let inflight = Arc::clone(&self.inflight);
                let owned_key = key.to_string();
                let work = producer();
                let handle = tokio::spawn(async move {
                    let result = work.await;
                    inflight.remove_if(&owned_key, |_, entry| entry.id == id);
                    result
                });
                let cleanup = Arc::clone(&self.inflight);
                let owned_key = key.to_string();
                let result = async move {
                    handle.await.unwrap_or_else(|err| {
                        cleanup.remove_if(&owned_key, |_, entry| entry.id == id);
                        Err(E::from(err))
                    })
                }
                .boxed()
                .shared();
                entry.insert(InFlight {
                    id,
                    result: result.clone(),
                });
                result
            }
        };

        result.await
    }

    /// Number of keys with an operation in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
