use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::{Symbol, Value};

/// Default number of pending envelopes an object mailbox accepts.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// A message object's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub selector: Symbol,
    pub arguments: Vec<Value>,
}

/// A delivered message together with its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub message: Value,
    pub sender: Value,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
    closed: Mutex<bool>,
    capacity: usize,
}

/// Bounded FIFO queue.
///
/// Safe for one concurrent producer and one concurrent consumer. Use
/// [`Mailbox::split`] to hand the two ends to different threads; the halves
/// are not `Clone`, so a second producer cannot exist.
pub struct Mailbox<T> {
    shared: Arc<Shared<T>>,
}

/// Producing half of a split [`Mailbox`].
pub struct Deliverer<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half of a split [`Mailbox`].
pub struct Recipient<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Shared<T> {
    fn deliver(&self, item: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        drop(queue);
        self.ready.notify_one();
        Ok(())
    }

    fn receive(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                closed: Mutex::new(false),
                capacity,
            }),
        }
    }

    /// Enqueue `item`, handing it back if the mailbox is full.
    pub fn deliver(&self, item: T) -> Result<(), T> {
        self.shared.deliver(item)
    }

    pub fn receive(&self) -> Option<T> {
        self.shared.receive()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Visit every pending item in delivery order.
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut T)) {
        for item in self.shared.queue.lock().iter_mut() {
            f(item);
        }
    }

    pub fn split(self) -> (Deliverer<T>, Recipient<T>) {
        let deliverer = Deliverer {
            shared: self.shared.clone(),
        };
        let recipient = Recipient {
            shared: self.shared,
        };
        (deliverer, recipient)
    }
}

impl<T: Clone> Clone for Mailbox<T> {
    /// Copies the pending items into an independent mailbox.
    fn clone(&self) -> Self {
        let copy = Self::new(self.shared.capacity);
        *copy.shared.queue.lock() = self.shared.queue.lock().clone();
        copy
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl<T> Deliverer<T> {
    pub fn deliver(&self, item: T) -> Result<(), T> {
        self.shared.deliver(item)
    }
}

impl<T> Drop for Deliverer<T> {
    fn drop(&mut self) {
        *self.shared.closed.lock() = true;
        // take the queue lock so a receiver between its check and its wait
        // cannot miss the wakeup
        let _queue = self.shared.queue.lock();
        self.shared.ready.notify_all();
    }
}

impl<T> Recipient<T> {
    pub fn receive(&self) -> Option<T> {
        self.shared.receive()
    }

    /// Wait for the next item. Returns `None` once the deliverer is gone and
    /// the queue is drained.
    pub fn receive_blocking(&self) -> Option<T> {
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if *self.shared.closed.lock() {
                return None;
            }
            self.shared.ready.wait(&mut queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order() {
        let mailbox = Mailbox::new(4);
        for i in 0..3 {
            mailbox.deliver(i).unwrap();
        }
        assert_eq!(mailbox.len(), 3);
        assert_eq!(mailbox.receive(), Some(0));
        assert_eq!(mailbox.receive(), Some(1));
        assert_eq!(mailbox.receive(), Some(2));
        assert_eq!(mailbox.receive(), None);
    }

    #[test]
    fn full_mailbox_returns_item() {
        let mailbox = Mailbox::new(1);
        mailbox.deliver("a").unwrap();
        assert_eq!(mailbox.deliver("b"), Err("b"));
        assert_eq!(mailbox.receive(), Some("a"));
        assert!(mailbox.deliver("b").is_ok());
    }

    #[test]
    fn for_each_mut_rewrites_items() {
        let mailbox = Mailbox::new(4);
        mailbox.deliver(1).unwrap();
        mailbox.deliver(2).unwrap();
        mailbox.for_each_mut(|item| *item *= 10);
        assert_eq!(mailbox.receive(), Some(10));
        assert_eq!(mailbox.receive(), Some(20));
    }

    #[test]
    fn clone_is_independent() {
        let mailbox = Mailbox::new(4);
        mailbox.deliver(1).unwrap();
        let copy = mailbox.clone();
        assert_eq!(mailbox.receive(), Some(1));
        assert_eq!(copy.receive(), Some(1));
        assert!(copy.is_empty());
    }

    #[test]
    fn single_producer_single_consumer_across_threads() {
        const COUNT: usize = 10_000;
        let (deliverer, recipient) = Mailbox::new(16).split();

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                let mut item = i;
                loop {
                    match deliverer.deliver(item) {
                        Ok(()) => break,
                        Err(back) => {
                            item = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut received = Vec::with_capacity(COUNT);
        while let Some(item) = recipient.receive_blocking() {
            received.push(item);
        }
        producer.join().unwrap();

        assert_eq!(received, (0..COUNT).collect::<Vec<_>>());
    }
}
