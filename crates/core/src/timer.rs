//! Cancelable timers
//!
//! Every timer in the system (scheduled actions on clients, role grace,
//! room deletion and vote timeouts on the server) goes through one of the
//! two types here. Both stamp each arming with a generation number and
//! honour a fire only when [`accept`](CancelableTask::accept) sees the
//! current generation, so a timer that was replaced or cancelled after it
//! fired but before its fire was processed has no effect.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single replaceable timer
#[derive(Debug, Default)]
pub struct CancelableTask {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl CancelableTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, cancelling whatever was armed before
    ///
    /// `on_fire` runs on a spawned task after `delay` and receives the
    /// generation of this arming. Returns that generation.
    pub fn replace<F>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation);
        }));
        generation
    }

    /// Disarm the timer. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fire notification
    ///
    /// Returns true and disarms only when `generation` is the current one
    /// and the timer is still armed.
    pub fn accept(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for CancelableTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug)]
struct ArmedTimer {
    handle: JoinHandle<()>,
    generation: u64,
}

/// A family of keyed timers with replace-on-arm semantics
///
/// Generations are unique across the whole set, so a stale fire for a key
/// that was cancelled and later re-armed can never be mistaken for the new
/// arming.
#[derive(Debug)]
pub struct TimerSet<K> {
    armed: HashMap<K, ArmedTimer>,
    next_generation: u64,
}

impl<K> Default for TimerSet<K> {
    fn default() -> Self {
        Self {
            armed: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key`, replacing any timer already armed under it
    pub fn replace<F>(&mut self, key: K, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(K, u64) + Send + 'static,
    {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let fired_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(fired_key, generation);
        });
        self.armed.insert(key, ArmedTimer { handle, generation });
        generation
    }

    /// Disarm `key`. Returns whether it was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fire notification for `key`
    pub fn accept(&mut self, key: &K, generation: u64) -> bool {
        match self.armed.get(key) {
            Some(timer) if timer.generation == generation => {
                self.armed.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    /// Cancel every timer whose key matches `predicate`
    pub fn cancel_where<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let keys: Vec<K> = self.armed.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &keys {
            self.cancel(key);
        }
        keys.len()
    }

    /// Bulk-cancel everything (process shutdown sweep)
    pub fn cancel_all(&mut self) -> usize {
        let count = self.armed.len();
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl<K> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_replace_cancels_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = CancelableTask::new();

        let tx1 = tx.clone();
        let first = task.replace(Duration::from_millis(100), move |g| {
            let _ = tx1.send(g);
        });
        let tx2 = tx.clone();
        let second = task.replace(Duration::from_millis(300), move |g| {
            let _ = tx2.send(g);
        });
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, second);
        assert!(rx.try_recv().is_err());
        assert!(task.accept(fired));
        assert!(!task.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fire_rejected_after_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = CancelableTask::new();
        task.replace(Duration::from_millis(10), move |g| {
            let _ = tx.send(g);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let fired = rx.recv().await.unwrap();

        // Cancelled after the fire was queued but before it was processed
        task.cancel();
        assert!(!task.accept(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_set_generations_unique_across_rearm() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers: TimerSet<&'static str> = TimerSet::new();

        let tx1 = tx.clone();
        let old = timers.replace("room", Duration::from_millis(10), move |k, g| {
            let _ = tx1.send((k, g));
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, stale) = rx.recv().await.unwrap();
        assert_eq!(stale, old);

        timers.cancel(&"room");
        let tx2 = tx.clone();
        let new = timers.replace("room", Duration::from_millis(1_000), move |k, g| {
            let _ = tx2.send((k, g));
        });

        assert!(!timers.accept(&"room", stale));
        assert!(timers.is_armed(&"room"));
        assert!(timers.accept(&"room", new));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_sweeps() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let mut timers: TimerSet<u32> = TimerSet::new();
        for key in 0..5 {
            let tx = tx.clone();
            timers.replace(key, Duration::from_secs(1), move |k, _| {
                let _ = tx.send(k);
            });
        }
        assert_eq!(timers.cancel_where(|k| *k < 2), 2);
        assert_eq!(timers.cancel_all(), 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_fires_before_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = CancelableTask::new();
        let generation = task.replace(Duration::from_millis(250), move |g| {
            let _ = tx.send(g);
        });

        {
            let mut recv = tokio_test::task::spawn(rx.recv());
            tokio_test::assert_pending!(recv.poll());
            tokio::time::advance(Duration::from_millis(100)).await;
            tokio_test::assert_pending!(recv.poll());
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.recv().await, Some(generation));
        assert!(task.accept(generation));
    }
}
