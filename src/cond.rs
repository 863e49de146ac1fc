//! Long-poll condition broadcaster
//!
//! Waiters register a finite key→value mapping and park on a one-shot
//! signal. A broadcast wakes every waiter whose key set is a subset of
//! the broadcast's keys and whose required values match. One mutex
//! guards all registries; waiters that never match see their timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bson::{Bson, Document};
use tokio::sync::oneshot;
use tracing::debug;

const MAX_KEYS: usize = 8;

/// Sorted key tuple of a condition.
type KeySet = Vec<String>;
/// Canonical bytes of the value tuple, in key order.
type ValKey = Vec<u8>;

#[derive(Default)]
struct Inner {
    next_id: u64,
    wait_lists: HashMap<KeySet, HashMap<ValKey, HashMap<u64, oneshot::Sender<()>>>>,
    id_index: HashMap<u64, (KeySet, ValKey)>,
}

pub struct MapCond {
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl Default for MapCond {
    fn default() -> Self {
        MapCond::new(Duration::from_secs(30))
    }
}

impl MapCond {
    pub fn new(timeout: Duration) -> Self {
        MapCond { timeout, inner: Mutex::new(Inner::default()) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn key_set(cond: &Document) -> KeySet {
        if cond.len() > MAX_KEYS {
            panic!("max condition length is {}", MAX_KEYS);
        }
        let mut keys: Vec<String> = cond.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Canonical bytes of `cond`'s values in `keys` order.
    fn val_key(cond: &Document, keys: &[String]) -> ValKey {
        let mut ordered = Document::new();
        for k in keys {
            ordered.insert(k.clone(), cond.get(k).cloned().unwrap_or(Bson::Null));
        }
        bson::to_vec(&ordered).expect("condition values serialize")
    }

    fn register(&self, cond: &Document) -> (u64, oneshot::Receiver<()>) {
        let ks = Self::key_set(cond);
        let vk = Self::val_key(cond, &ks);
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("cond lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .wait_lists
            .entry(ks.clone())
            .or_default()
            .entry(vk.clone())
            .or_default()
            .insert(id, tx);
        inner.id_index.insert(id, (ks, vk));
        (id, rx)
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().expect("cond lock");
        if let Some((ks, vk)) = inner.id_index.remove(&id) {
            if let Some(by_val) = inner.wait_lists.get_mut(&ks) {
                if let Some(wl) = by_val.get_mut(&vk) {
                    wl.remove(&id);
                    if wl.is_empty() {
                        by_val.remove(&vk);
                    }
                }
                if by_val.is_empty() {
                    inner.wait_lists.remove(&ks);
                }
            }
        }
    }

    /// Block until a matching broadcast or the configured timeout.
    /// Returns whether a signal arrived.
    pub async fn wait(&self, cond: &Document) -> bool {
        let (id, rx) = self.register(cond);
        let signalled = tokio::time::timeout(self.timeout, rx).await.is_ok();
        self.remove(id);
        signalled
    }

    /// Signal every waiter whose condition is satisfied by `m`. Each
    /// waiter is delivered at most once.
    pub fn broadcast(&self, m: &Document) {
        let mut inner = self.inner.lock().expect("cond lock");
        let mut woken = 0usize;
        let key_sets: Vec<KeySet> = inner.wait_lists.keys().cloned().collect();
        for ks in key_sets {
            if !ks.iter().all(|k| m.contains_key(k)) {
                continue;
            }
            let vk = Self::val_key(m, &ks);
            let Some(by_val) = inner.wait_lists.get_mut(&ks) else { continue };
            if let Some(wl) = by_val.remove(&vk) {
                for (id, tx) in wl {
                    inner.id_index.remove(&id);
                    let _ = tx.send(());
                    woken += 1;
                }
            }
            if inner.wait_lists.get(&ks).map_or(false, |m| m.is_empty()) {
                inner.wait_lists.remove(&ks);
            }
        }
        if woken > 0 {
            debug!(woken, "condition broadcast");
        }
    }
}
