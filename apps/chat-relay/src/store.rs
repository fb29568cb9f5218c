use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Lazy, endless sequence of `(channel, payload)` pairs for a subscription.
pub type MessageStream = BoxStream<'static, (String, String)>;

pub type StoreHandle = Arc<dyn Store>;

/// Key-value, hash, list and pub/sub primitives of the shared store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn hset(&self, hash: &str, field: &str, value: &str) -> StoreResult<()>;
    async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hexists(&self, hash: &str, field: &str) -> StoreResult<bool>;
    async fn hdel(&self, hash: &str, field: &str) -> StoreResult<()>;
    async fn hgetall(&self, hash: &str) -> StoreResult<HashMap<String, String>>;
    async fn del(&self, key: &str) -> StoreResult<()>;
    async fn rpush(&self, list: &str, value: &str) -> StoreResult<()>;
    async fn ltrim(&self, list: &str, start: isize, stop: isize) -> StoreResult<()>;
    async fn lrange(&self, list: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream>;
}

const PUBSUB_DEPTH: usize = 1024;

/// In-process store with Redis semantics for the primitives the relay uses.
/// Clones share state, so several relays built on clones behave like sibling
/// processes attached to one Redis.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    data: Mutex<MemoryData>,
    pubsub: Mutex<broadcast::Sender<(String, String)>>,
    unavailable: AtomicBool,
    fail_in: AtomicUsize,
}

#[derive(Default)]
struct MemoryData {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_DEPTH);
        Self {
            inner: Arc::new(MemoryInner {
                data: Mutex::new(MemoryData::default()),
                pubsub: Mutex::new(pubsub),
                unavailable: AtomicBool::new(false),
                fail_in: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End every live subscription, as a dropped Redis pub/sub connection
    /// would. Later `subscribe` calls work as before.
    pub fn close_subscriptions(&self) {
        let (fresh, _) = broadcast::channel(PUBSUB_DEPTH);
        drop(std::mem::replace(&mut *self.inner.pubsub.lock(), fresh));
    }

    /// Fail only the `nth` call from now (1-based); the rest succeed.
    pub fn fail_nth_call(&self, nth: usize) {
        self.inner.fail_in.store(nth, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let countdown = self
            .inner
            .fail_in
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if countdown == Ok(1) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self.inner.data.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner
            .data
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner
            .data
            .lock()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let data = self.inner.data.lock();
        Ok(data.hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn hexists(&self, hash: &str, field: &str) -> StoreResult<bool> {
        self.check()?;
        let data = self.inner.data.lock();
        Ok(data
            .hashes
            .get(hash)
            .map(|h| h.contains_key(field))
            .unwrap_or(false))
    }

    async fn hdel(&self, hash: &str, field: &str) -> StoreResult<()> {
        self.check()?;
        let mut data = self.inner.data.lock();
        let emptied = match data.hashes.get_mut(hash) {
            Some(h) => {
                h.remove(field);
                h.is_empty()
            }
            None => false,
        };
        if emptied {
            data.hashes.remove(hash);
        }
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        Ok(self
            .inner
            .data
            .lock()
            .hashes
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        let mut data = self.inner.data.lock();
        data.strings.remove(key);
        data.hashes.remove(key);
        data.lists.remove(key);
        Ok(())
    }

    async fn rpush(&self, list: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner
            .data
            .lock()
            .lists
            .entry(list.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn ltrim(&self, list: &str, start: isize, stop: isize) -> StoreResult<()> {
        self.check()?;
        let mut data = self.inner.data.lock();
        let Some(items) = data.lists.get_mut(list) else {
            return Ok(());
        };
        match resolve_range(items.len(), start, stop) {
            Some((from, to)) => {
                items.truncate(to + 1);
                items.drain(..from);
            }
            None => items.clear(),
        }
        if items.is_empty() {
            data.lists.remove(list);
        }
        Ok(())
    }

    async fn lrange(&self, list: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.check()?;
        let data = self.inner.data.lock();
        let Some(items) = data.lists.get(list) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(items.len(), start, stop) {
            Some((from, to)) => items[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check()?;
        // No subscribers is not an error, same as PUBLISH returning 0.
        let _ = self
            .inner
            .pubsub
            .lock()
            .send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        self.check()?;
        let receiver = self.inner.pubsub.lock().subscribe();
        let wanted = channel.to_string();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(item) => return Some((item, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory subscription lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |(channel, _)| {
            let matches = *channel == wanted;
            async move { matches }
        });
        Ok(stream.boxed())
    }
}

/// Redis list index semantics: negative indices count from the tail, and the
/// range is inclusive. Returns `None` when the range selects nothing.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
