//! Keyed, cancellable delayed tasks.

use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};

/// Default debounce window for filesystem events.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Schedules one delayed firing per key. Scheduling a key again before it
/// fires restarts its timer, so a burst of events yields one firing.
pub struct ScheduledTasks<K> {
    delay: Duration,
    tasks: HashMap<K, JoinHandle<()>>,
    fired: mpsc::UnboundedSender<K>,
}

impl<K> ScheduledTasks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<K>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                tasks: HashMap::new(),
                fired,
            },
            rx,
        )
    }

    pub fn schedule(&mut self, key: K) {
        if let Some(previous) = self.tasks.remove(&key) {
            previous.abort();
        }
        let delay = self.delay;
        let fired = self.fired.clone();
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(fire_key);
        });
        self.tasks.insert(key, handle);
    }

    /// Drops a pending firing; returns whether one was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Forgets a key after its firing was received.
    pub fn settle(&mut self, key: &K) {
        self.tasks.remove(key);
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl<K> Drop for ScheduledTasks<K> {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bursts_for_one_key_fire_once() {
        let (mut tasks, mut fired) = ScheduledTasks::new(Duration::from_millis(30));
        tasks.schedule("a.css");
        tokio::time::sleep(Duration::from_millis(10)).await;
        tasks.schedule("a.css");
        tasks.schedule("b.css");

        let mut seen = vec![
            fired.recv().await.expect("first"),
            fired.recv().await.expect("second"),
        ];
        seen.sort_unstable();
        assert_eq!(seen, vec!["a.css", "b.css"]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_keys_never_fire() {
        let (mut tasks, mut fired) = ScheduledTasks::new(Duration::from_millis(20));
        tasks.schedule(1u32);
        assert_eq!(tasks.pending(), 1);
        assert!(tasks.cancel(&1));
        assert!(!tasks.cancel(&1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.try_recv().is_err());
        assert_eq!(tasks.pending(), 0);
    }
}
