//! Timer System
//!
//! One-shot timers on the node clock. The fetcher arms one per in-flight
//! fetch as its watchdog.
//!
//! Design:
//! - TimerQueue is a min-heap sorted by deadline
//! - Each timer carries a small payload handed back when it fires
//! - Cancelled timers stay in the heap and are skipped when popped
//! - Time is milliseconds supplied by the caller (`Node::advance`)

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Unique identifier for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Timer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Timer is active and waiting
    Pending,
    /// Timer has fired
    Fired,
    /// Timer was cancelled
    Cancelled,
}

/// A timer that fires at a specific deadline
#[derive(Debug)]
pub struct Timer<T> {
    pub id: TimerId,
    /// Node clock value at which the timer fires
    pub deadline: u64,
    /// Handed back on expiry
    pub payload: T,
    pub state: TimerState,
}

/// Entry in the timer heap (for ordering)
#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: u64,
    id: TimerId,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; equal deadlines fire in scheduling order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Timer queue - manages all active timers
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<TimerEntry>,
    timers: HashMap<TimerId, Timer<T>>,
    next_id: u64,
}

impl<T: Copy> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedule a one-shot timer `delay_ms` after `now`
    pub fn schedule(&mut self, delay_ms: u64, now: u64, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let deadline = now.saturating_add(delay_ms);
        self.heap.push(TimerEntry { deadline, id });
        self.timers.insert(
            id,
            Timer {
                id,
                deadline,
                payload,
                state: TimerState::Pending,
            },
        );

        id
    }

    /// Cancel a timer
    ///
    /// Returns true if the timer was pending and is now cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.get_mut(&id) {
            Some(timer) if timer.state == TimerState::Pending => {
                timer.state = TimerState::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Fire every timer whose deadline is `<= now`, in deadline order
    pub fn tick(&mut self, now: u64) -> Vec<(TimerId, T)> {
        let mut fired = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };

            if let Some(timer) = self.timers.get_mut(&entry.id)
                && timer.state == TimerState::Pending
            {
                timer.state = TimerState::Fired;
                fired.push((timer.id, timer.payload));
            }
        }

        // Clean up fired/cancelled timers
        self.timers.retain(|_, t| t.state == TimerState::Pending);

        fired
    }

    /// Time until the next pending timer fires
    pub fn time_until_next(&self, now: u64) -> Option<u64> {
        self.timers
            .values()
            .filter(|t| t.state == TimerState::Pending)
            .map(|t| t.deadline.saturating_sub(now))
            .min()
    }

    pub fn pending_count(&self) -> usize {
        self.timers
            .values()
            .filter(|t| t.state == TimerState::Pending)
            .count()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers
            .get(&id)
            .is_some_and(|t| t.state == TimerState::Pending)
    }
}

impl<T: Copy> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oneshot_timer() {
        let mut queue = TimerQueue::new();

        let id = queue.schedule(100, 0, 7u16);
        assert!(queue.is_pending(id));
        assert_eq!(queue.pending_count(), 1);

        assert!(queue.tick(50).is_empty());
        assert!(queue.is_pending(id));

        assert_eq!(queue.tick(100), vec![(id, 7)]);
        assert!(!queue.is_pending(id));
        assert!(queue.tick(1000).is_empty());
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();

        queue.schedule(100, 0, 1u16);
        queue.schedule(50, 0, 2u16);
        queue.schedule(150, 0, 3u16);

        let fired: Vec<u16> = queue.tick(200).into_iter().map(|(_, p)| p).collect();
        assert_eq!(fired, vec![2, 1, 3]);
    }

    #[test]
    fn test_same_deadline_keeps_schedule_order() {
        let mut queue = TimerQueue::new();
        for key in 0..4u16 {
            queue.schedule(10, 0, key);
        }
        let fired: Vec<u16> = queue.tick(10).into_iter().map(|(_, p)| p).collect();
        assert_eq!(fired, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cancel_timer() {
        let mut queue = TimerQueue::new();

        let id = queue.schedule(100, 0, ());
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));

        assert!(queue.tick(100).is_empty());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_time_until_next_skips_cancelled() {
        let mut queue = TimerQueue::new();
        assert!(queue.time_until_next(0).is_none());

        let early = queue.schedule(100, 0, ());
        queue.schedule(300, 0, ());
        assert_eq!(queue.time_until_next(0), Some(100));
        assert_eq!(queue.time_until_next(150), Some(0));

        queue.cancel(early);
        assert_eq!(queue.time_until_next(0), Some(300));
    }
}
