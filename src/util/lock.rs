use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Locks `lock`, recovering the guard if a previous holder panicked.
///
/// Shared state behind these mutexes (page maps, in-memory store tables) is
/// always left consistent between statements, so a poisoned guard is still
/// usable.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::mutex_lock;

    #[test]
    fn recovers_poisoned_mutex() {
        let shared = Arc::new(Mutex::new(vec![1]));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(shared.is_poisoned());
        let mut guard = mutex_lock(&shared, "util::lock::tests", "push");
        guard.push(2);
        assert_eq!(*guard, vec![1, 2]);
    }
}
