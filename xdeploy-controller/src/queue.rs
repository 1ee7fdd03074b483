use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

struct QueueState<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    in_flight: HashSet<K>,
    closed: bool,
}

struct Schedule<K> {
    failures: HashMap<K, u32>,
    timers: BTreeMap<(Instant, u64), K>,
    deadlines: HashMap<K, (Instant, u64)>,
    seq: u64,
}

/// Deduplicating work queue with delayed and rate limited re-adds.
///
/// A key handed out by [`WorkQueue::next`] stays in flight until
/// [`WorkQueue::done`] is called. Adds that arrive meanwhile mark the key
/// dirty and it is handed out again after `done`, so a key is never processed
/// by two workers at once.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    schedule: Mutex<Schedule<K>>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                in_flight: HashSet::new(),
                closed: false,
            }),
            schedule: Mutex::new(Schedule {
                failures: HashMap::new(),
                timers: BTreeMap::new(),
                deadlines: HashMap::new(),
                seq: 0,
            }),
            notify: Notify::new(),
            backoff_base,
            backoff_max,
        }
    }

    // The guarded data stays consistent between statements, so a panic in
    // another worker does not invalidate it.
    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule<K>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.closed || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.in_flight.contains(&key) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Adds `key` once `delay` has passed. An earlier pending schedule for the
    /// same key is kept.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.state().closed {
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut schedule = self.schedule();
            if let Some((existing, _)) = schedule.deadlines.get(&key)
                && *existing <= at
            {
                return;
            }
            if let Some(old) = schedule.deadlines.remove(&key) {
                schedule.timers.remove(&old);
            }
            schedule.seq += 1;
            let slot = (at, schedule.seq);
            schedule.timers.insert(slot, key.clone());
            schedule.deadlines.insert(key, slot);
        }
        self.notify.notify_waiters();
    }

    /// Re-adds `key` after an exponential, fully jittered backoff
    pub fn add_rate_limited(&self, key: K) {
        let failures = {
            let mut schedule = self.schedule();
            let count = schedule.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let ceiling = self.backoff_ceiling(failures);
        let delay = rand::thread_rng().gen_range(Duration::ZERO..=ceiling);
        self.add_after(key, delay);
    }

    /// Upper bound of the retry delay after `failures` consecutive failures
    pub fn backoff_ceiling(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1 << exp)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }

    pub fn forget(&self, key: &K) {
        self.schedule().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.schedule().failures.get(key).copied().unwrap_or(0)
    }

    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.in_flight.remove(key);
        if state.dirty.contains(key) && !state.closed {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state().closed
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let next_deadline = self.promote_due_timers();

            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
            }

            match next_deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    // Moves every expired timer onto the ready list and returns the next
    // pending deadline.
    fn promote_due_timers(&self) -> Option<Instant> {
        let now = Instant::now();
        let (due, next) = {
            let mut schedule = self.schedule();
            let mut due = Vec::new();
            while let Some(entry) = schedule.timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let key = entry.remove();
                schedule.deadlines.remove(&key);
                due.push(key);
            }
            let next = schedule.timers.keys().next().map(|(at, _)| *at);
            (due, next)
        };
        for key in due {
            self.add(key);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn make_queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_deduplicates() {
        let queue = make_queue();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_key_is_requeued_on_done() {
        let queue = make_queue();
        queue.add("a");
        assert_eq!(queue.next().await, Some("a"));

        queue.add("a");
        assert_eq!(queue.len(), 0);

        queue.done(&"a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some("a"));

        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_later() {
        let queue = make_queue();
        let start = Instant::now();
        queue.add_after("a", Duration::from_secs(5));
        assert!(queue.is_empty());

        assert_eq!(queue.next().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_earliest_wins() {
        let queue = make_queue();
        let start = Instant::now();
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(2));
        queue.add_after("a", Duration::from_secs(30));

        assert_eq!(queue.next().await, Some("a"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_wakes_on_add() {
        let queue = Arc::new(make_queue());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio::task::yield_now().await;
        queue.add("a");
        assert_eq!(waiter.await.expect("join"), Some("a"));
    }

    #[test]
    fn test_backoff_ceiling_grows_and_caps() {
        let queue = make_queue();
        assert_eq!(queue.backoff_ceiling(1), Duration::from_secs(1));
        assert_eq!(queue.backoff_ceiling(2), Duration::from_secs(2));
        assert_eq!(queue.backoff_ceiling(4), Duration::from_secs(8));
        assert_eq!(queue.backoff_ceiling(9), Duration::from_secs(256));
        assert_eq!(queue.backoff_ceiling(10), Duration::from_secs(300));
        assert_eq!(queue.backoff_ceiling(1000), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_counts_failures_until_forget() {
        let queue = make_queue();
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.failures(&"a"), 2);

        let start = Instant::now();
        assert_eq!(queue.next().await, Some("a"));
        assert!(start.elapsed() <= queue.backoff_ceiling(2));

        queue.forget(&"a");
        assert_eq!(queue.failures(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_waiters() {
        let queue = Arc::new(make_queue());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.expect("join"), None);

        queue.add("a");
        assert_eq!(queue.next().await, None);
    }
}
