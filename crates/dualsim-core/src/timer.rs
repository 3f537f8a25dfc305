//! Single-shot delayed messages for the control loops.
//!
//! Each loop owns one [`TimerQueue`] keyed by its own timer enum. Nothing is
//! cancelled implicitly: a handler that invalidates a pending timer must call
//! [`TimerQueue::cancel`] itself. The owning runtime sleeps until
//! [`TimerQueue::next_deadline`] and then drains due entries one at a time,
//! so a handler that cancels a later timer takes effect within the same
//! drain.

use quanta::Instant;

struct Entry<K> {
    deadline: Instant,
    seq: u64,
    key: K,
}

pub struct TimerQueue<K> {
    entries: Vec<Entry<K>>,
    next_seq: u64,
}

impl<K: PartialEq> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Arm `key` to fire at `deadline`. Duplicate keys are allowed; each
    /// entry fires once.
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { deadline, seq, key });
    }

    /// Remove every entry equal to `key`. Returns whether anything was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.cancel_where(|k| k == key) > 0
    }

    pub fn cancel_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(&e.key));
        before - self.entries.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.iter().any(|e| &e.key == key)
    }

    pub fn contains_where(&self, mut pred: impl FnMut(&K) -> bool) -> bool {
        self.entries.iter().any(|e| pred(&e.key))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Pop the earliest entry whose deadline is at or before `now`. Ties
    /// fire in scheduling order.
    pub fn pop_due(&mut self, now: Instant) -> Option<K> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| (e.deadline, e.seq))
            .map(|(i, _)| i)?;
        Some(self.entries.swap_remove(idx).key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: PartialEq> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Key {
        A,
        B,
        C(u8),
    }

    #[test]
    fn fires_in_deadline_order() {
        let (clock, mock) = quanta::Clock::mock();
        let t0 = clock.now();
        let mut q = TimerQueue::new();
        q.schedule(Key::B, t0 + Duration::from_millis(20));
        q.schedule(Key::A, t0 + Duration::from_millis(10));

        assert!(q.pop_due(clock.now()).is_none());
        mock.increment(Duration::from_millis(25));
        let now = clock.now();
        assert_eq!(q.pop_due(now), Some(Key::A));
        assert_eq!(q.pop_due(now), Some(Key::B));
        assert!(q.is_empty());
    }

    #[test]
    fn ties_fire_in_schedule_order() {
        let (clock, _mock) = quanta::Clock::mock();
        let t = clock.now();
        let mut q = TimerQueue::new();
        q.schedule(Key::C(1), t);
        q.schedule(Key::C(2), t);
        q.schedule(Key::C(3), t);
        assert_eq!(q.pop_due(t), Some(Key::C(1)));
        assert_eq!(q.pop_due(t), Some(Key::C(2)));
        assert_eq!(q.pop_due(t), Some(Key::C(3)));
    }

    #[test]
    fn cancel_is_explicit() {
        let (clock, mock) = quanta::Clock::mock();
        let mut q = TimerQueue::new();
        q.schedule(Key::A, clock.now() + Duration::from_millis(5));
        q.schedule(Key::C(1), clock.now() + Duration::from_millis(5));
        q.schedule(Key::C(2), clock.now() + Duration::from_millis(5));
        assert!(q.cancel(&Key::A));
        assert!(!q.cancel(&Key::A));
        assert_eq!(q.cancel_where(|k| matches!(k, Key::C(_))), 2);
        mock.increment(Duration::from_millis(10));
        assert!(q.pop_due(clock.now()).is_none());
    }

    #[test]
    fn next_deadline_tracks_minimum() {
        let (clock, _mock) = quanta::Clock::mock();
        let t0 = clock.now();
        let mut q = TimerQueue::new();
        assert!(q.next_deadline().is_none());
        q.schedule(Key::A, t0 + Duration::from_millis(50));
        q.schedule(Key::B, t0 + Duration::from_millis(30));
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(30)));
        assert!(q.contains(&Key::B));
        assert!(q.contains_where(|k| matches!(k, Key::A)));
    }
}
