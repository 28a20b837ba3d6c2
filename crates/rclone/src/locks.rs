use std::{
  collections::HashSet,
  fmt,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::trace;

/// Process-wide set of keys with an operation in flight.
///
/// Acquisition never blocks: a key that is already held is refused
/// immediately and the caller reports the operation as in progress.
#[derive(Debug, Default)]
pub struct KeyedLockRegistry {
  held: Mutex<HashSet<String>>,
}

impl KeyedLockRegistry {
  pub fn new() -> Arc<Self> {
    Arc::new(KeyedLockRegistry::default())
  }

  fn held(&self) -> MutexGuard<'_, HashSet<String>> {
    self.held.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Take `key`, or return `None` when someone else holds it. The key is
  /// released when the returned guard is dropped.
  pub fn try_acquire(self: &Arc<Self>, key: impl Into<String>) -> Option<LockGuard> {
    let key = key.into();
    if !self.held().insert(key.clone()) {
      trace!(%key, "Lock already held");
      return None;
    }

    trace!(%key, "Lock acquired");
    Some(LockGuard {
      registry: Arc::clone(self),
      key,
    })
  }

  pub fn is_held(&self, key: &str) -> bool {
    self.held().contains(key)
  }

  fn release(&self, key: &str) {
    self.held().remove(key);
    trace!(%key, "Lock released");
  }
}

/// Ownership of one key in a [KeyedLockRegistry].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
  registry: Arc<KeyedLockRegistry>,
  key: String,
}

impl LockGuard {
  #[inline]
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl fmt::Debug for LockGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("LockGuard").field(&self.key).finish()
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    self.registry.release(&self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
      atomic::{AtomicUsize, Ordering},
      Barrier,
    },
    thread,
  };

  #[test]
  fn second_acquire_fails_fast() {
    let locks = KeyedLockRegistry::new();
    let guard = locks.try_acquire("vol").unwrap();

    assert!(locks.try_acquire("vol").is_none());
    assert!(locks.try_acquire("other").is_some());
    assert_eq!(guard.key(), "vol");
  }

  #[test]
  fn drop_releases() {
    let locks = KeyedLockRegistry::new();
    drop(locks.try_acquire("vol").unwrap());

    assert!(!locks.is_held("vol"));
    assert!(locks.try_acquire("vol").is_some());
  }

  #[test]
  fn panic_releases() {
    let locks = KeyedLockRegistry::new();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
      let _guard = locks.try_acquire("vol").unwrap();
      panic!("boom");
    }));

    assert!(result.is_err());
    assert!(!locks.is_held("vol"));
  }

  #[test]
  fn only_one_concurrent_holder() {
    const THREADS: usize = 8;
    let locks = KeyedLockRegistry::new();
    let acquired = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));
    let done = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        let locks = locks.clone();
        let acquired = acquired.clone();
        let start = start.clone();
        let done = done.clone();
        thread::spawn(move || {
          start.wait();
          let guard = locks.try_acquire("vol");
          if guard.is_some() {
            acquired.fetch_add(1, Ordering::SeqCst);
          }
          done.wait();
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(acquired.load(Ordering::SeqCst), 1);
    assert!(!locks.is_held("vol"));
  }
}
