//! Bounded producer/consumer queue between a production thread and the
//! engine's real-time pull.
//!
//! Single producer, single consumer. The producer parks when the queue is
//! full; the consumer never parks — `try_pop` returns immediately, empty or
//! not. Closing the queue wakes a parked producer so a stopping stream can
//! never wedge its production thread.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded SPSC frame queue with a non-blocking consumer side
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    space: Condvar,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            space: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an item, parking while the queue is full. Returns `false` if
    /// the queue was closed, telling the producer to shut down.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return false;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                return true;
            }
            self.space.wait(&mut state);
        }
    }

    /// Pop the oldest item without ever blocking the caller.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Close the queue: drop buffered items and wake a parked producer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        self.space.notify_all();
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pop_on_empty_returns_immediately() {
        let queue: FrameQueue<u32> = FrameQueue::new(4);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn push_then_pop_is_fifo() {
        let queue = FrameQueue::new(4);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn close_drops_items_and_rejects_push() {
        let queue = FrameQueue::new(4);
        assert!(queue.push(1));
        queue.close();
        assert_eq!(queue.try_pop(), None);
        assert!(!queue.push(2));
    }

    #[test]
    fn close_wakes_a_parked_producer() {
        let queue = Arc::new(FrameQueue::new(1));
        assert!(queue.push(0));

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(1))
        };

        // Give the producer time to park on the full queue.
        std::thread::sleep(Duration::from_millis(50));
        queue.close();

        assert!(!producer.join().expect("producer thread panicked"));
    }

    #[test]
    fn pop_makes_room_for_a_parked_producer() {
        let queue = Arc::new(FrameQueue::new(1));
        assert!(queue.push(10));

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(20))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.try_pop(), Some(10));

        assert!(producer.join().expect("producer thread panicked"));
        assert_eq!(queue.try_pop(), Some(20));
    }
}
