//! Pre-warmed session pool.
//!
//! The pool never talks to the Driver or Store directly — it's handed a
//! `CreateFunc` closure that does the real work, so the pool itself stays
//! testable against a fake.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::error::Result;

pub type PoolKey = (String, String);

/// Constructs one pool-idle sandbox for `(image, workspace_id)` and returns
/// its session ID, or an error if construction failed.
pub type CreateFunc = Arc<dyn Fn(&str, &str) -> Result<String> + Send + Sync>;

struct Inner {
    queues: HashMap<PoolKey, VecDeque<String>>,
    targets: HashMap<PoolKey, usize>,
}

pub struct Pool {
    inner: Mutex<Inner>,
    create: CreateFunc,
}

impl Pool {
    pub fn new(targets: HashMap<PoolKey, usize>, create: CreateFunc) -> Pool {
        Pool {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                targets,
            }),
            create,
        }
    }

    /// Returns the most recently added idle session for the exact
    /// `(image, workspace_id)` key. An empty-workspace request only matches
    /// empty-workspace entries. The pool lock is held only for the duration
    /// of the pop, never across I/O, so this is the intended hot path.
    pub fn get(&self, image: &str, workspace_id: &str) -> Option<String> {
        let key = (image.to_string(), workspace_id.to_string());
        let mut inner = self.inner.lock().unwrap();
        inner.queues.get_mut(&key).and_then(|q| q.pop_back())
    }

    /// Reserved for future reuse; sessions are destroyed after use today and
    /// the pool relies on background refill instead.
    pub fn put(&self, _session_id: String) {}

    /// Creates up to `count` sessions for `key`, capped at the configured
    /// target size, via the injected `CreateFunc`. Logs and continues past
    /// individual failures so one bad image doesn't block the rest.
    pub fn refill(&self, image: &str, workspace_id: &str, count: usize) {
        let key = (image.to_string(), workspace_id.to_string());
        let target = {
            let inner = self.inner.lock().unwrap();
            *inner.targets.get(&key).unwrap_or(&0)
        };
        let to_create = count.min(target);

        for _ in 0..to_create {
            let current_len = {
                let inner = self.inner.lock().unwrap();
                inner.queues.get(&key).map(|q| q.len()).unwrap_or(0)
            };
            if current_len >= target {
                break;
            }
            match (self.create)(image, workspace_id) {
                Ok(session_id) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner
                        .queues
                        .entry(key.clone())
                        .or_default()
                        .push_back(session_id);
                }
                Err(e) => {
                    warn!(image, workspace_id, error = %e, "pool refill failed for one session");
                }
            }
        }
    }

    /// Refills every configured key up to its target. Intended to run once
    /// at daemon startup.
    pub fn refill_all(&self) {
        let keys: Vec<PoolKey> = {
            let inner = self.inner.lock().unwrap();
            inner.targets.keys().cloned().collect()
        };
        for (image, workspace_id) in keys {
            let target = {
                let inner = self.inner.lock().unwrap();
                *inner.targets.get(&(image.clone(), workspace_id.clone())).unwrap_or(&0)
            };
            info!(image, workspace_id, target, "refilling pool key at startup");
            self.refill(&image, &workspace_id, target);
        }
    }

    /// Removes a pool entry without destroying the underlying sandbox — the
    /// caller (Manager) is responsible for calling `Driver.Destroy` first.
    pub fn forget(&self, image: &str, workspace_id: &str, session_id: &str) {
        let key = (image.to_string(), workspace_id.to_string());
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.queues.get_mut(&key) {
            queue.retain(|id| id != session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_create(counter: Arc<AtomicUsize>) -> CreateFunc {
        Arc::new(move |_image, _workspace| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("pool-sess-{n}"))
        })
    }

    #[test]
    fn refill_stops_at_target() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut targets = HashMap::new();
        targets.insert(("base".to_string(), String::new()), 2);
        let pool = Pool::new(targets, counting_create(counter.clone()));

        pool.refill("base", "", 10);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(pool.get("base", "").is_some());
        assert!(pool.get("base", "").is_some());
        assert!(pool.get("base", "").is_none());
    }

    #[test]
    fn get_on_unknown_key_returns_none() {
        let pool = Pool::new(HashMap::new(), counting_create(Arc::new(AtomicUsize::new(0))));
        assert!(pool.get("missing", "").is_none());
    }

    #[test]
    fn get_is_lifo() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut targets = HashMap::new();
        targets.insert(("base".to_string(), String::new()), 3);
        let pool = Pool::new(targets, counting_create(counter));
        pool.refill("base", "", 3);
        let first = pool.get("base", "").unwrap();
        assert_eq!(first, "pool-sess-2");
    }

    #[test]
    fn empty_workspace_request_does_not_match_bound_workspace_entries() {
        let pool = Pool::new(HashMap::new(), counting_create(Arc::new(AtomicUsize::new(0))));
        assert!(pool.get("base", "").is_none());
        assert!(pool.get("base", "ws-1").is_none());
    }
}
