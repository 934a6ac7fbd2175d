use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Handle to a scheduled task, used to cancel it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// TimerQueue is a min-heap of deadlines with cancellable tasks.
///
/// Cancelling removes the task from the table; its heap entry is discarded
/// lazily once it reaches the top. Tasks sharing a deadline fire in the order
/// they were scheduled.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, (Instant, T)>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, task: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((deadline, seq)));
        self.tasks.insert(seq, (deadline, task));
        TimerId(seq)
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.tasks.remove(&id.0).map(|(_, task)| task)
    }

    /// Cancels every task for which `keep` returns false.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.tasks.retain(|_, (_, task)| keep(task));
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.tasks.clear();
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.tasks.contains_key(&id.0)
    }

    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.tasks.get(&id.0).map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest live deadline.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pops the earliest task whose deadline is not after `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        self.discard_cancelled();
        let Reverse((deadline, seq)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        self.tasks.remove(&seq).map(|(_, task)| task)
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.tasks.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
