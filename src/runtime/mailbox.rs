//! Per-actor FIFO mailbox
//!
//! A mailbox hands events one at a time to an injected processing function.
//! Flushing runs on whichever thread enqueued the event that found the mailbox
//! idle. The queue lock is released while an event is processed, so an
//! enqueue issued from inside processing only appends.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Processing function invoked for every dequeued item
pub type ProcessFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct MailboxState<T> {
    queue: VecDeque<T>,
    started: bool,
    flushing: bool,
}

/// Single-consumer event queue with a start/flush/clear lifecycle
pub struct Mailbox<T> {
    state: Mutex<MailboxState<T>>,
    process: ProcessFn<T>,
}

impl<T: Send> Mailbox<T> {
    /// Create an idle mailbox around a processing function
    pub fn new(process: ProcessFn<T>) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                started: false,
                flushing: false,
            }),
            process,
        }
    }

    /// Append an item, flushing synchronously if the mailbox is idle and started
    pub fn enqueue(&self, item: T) {
        let should_flush = {
            let mut state = self.state.lock();
            state.queue.push_back(item);
            if state.started && !state.flushing {
                state.flushing = true;
                true
            } else {
                false
            }
        };

        if should_flush {
            self.flush();
        }
    }

    /// Mark the mailbox active and drain anything already queued
    pub fn start(&self) {
        let should_flush = {
            let mut state = self.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            if !state.flushing && !state.queue.is_empty() {
                state.flushing = true;
                true
            } else {
                false
            }
        };

        if should_flush {
            self.flush();
        }
    }

    /// Drop pending items; an item already being processed is unaffected
    pub fn clear(&self) {
        self.state.lock().queue.clear();
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no items are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        state.flushing = false;
                        return;
                    }
                }
            };
            (self.process)(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, OnceLock, Weak};

    type Log = Arc<Mutex<Vec<String>>>;

    fn reentrant_mailbox(log: Log, nested: Vec<(u32, Vec<u32>)>) -> Arc<Mailbox<u32>> {
        let slot: Arc<OnceLock<Weak<Mailbox<u32>>>> = Arc::new(OnceLock::new());
        let handle = slot.clone();
        let mailbox = Arc::new(Mailbox::new(Box::new(move |item: u32| {
            log.lock().push(format!("begin {item}"));
            if let Some(mailbox) = handle.get().and_then(Weak::upgrade) {
                for (trigger, follow_ups) in &nested {
                    if *trigger == item {
                        for follow_up in follow_ups {
                            mailbox.enqueue(*follow_up);
                        }
                    }
                }
            }
            log.lock().push(format!("end {item}"));
        })));
        let _ = slot.set(Arc::downgrade(&mailbox));
        mailbox
    }

    #[test]
    fn test_items_wait_until_start() {
        let log: Log = Arc::default();
        let mailbox = reentrant_mailbox(log.clone(), vec![]);
        mailbox.enqueue(1);
        mailbox.enqueue(2);
        assert!(log.lock().is_empty());
        assert_eq!(mailbox.len(), 2);

        mailbox.start();
        assert_eq!(*log.lock(), vec!["begin 1", "end 1", "begin 2", "end 2"]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_enqueue_during_processing_does_not_reenter() {
        let log: Log = Arc::default();
        let mailbox = reentrant_mailbox(log.clone(), vec![(1, vec![2])]);
        mailbox.start();
        mailbox.enqueue(1);
        assert_eq!(*log.lock(), vec!["begin 1", "end 1", "begin 2", "end 2"]);
    }

    #[test]
    fn test_clear_only_drops_pending_items() {
        let log: Log = Arc::default();
        let slot: Arc<OnceLock<Weak<Mailbox<u32>>>> = Arc::new(OnceLock::new());
        let handle = slot.clone();
        let inner_log = log.clone();
        let mailbox = Arc::new(Mailbox::new(Box::new(move |item: u32| {
            inner_log.lock().push(item.to_string());
            if item == 1 {
                if let Some(mailbox) = handle.get().and_then(Weak::upgrade) {
                    mailbox.enqueue(2);
                    mailbox.clear();
                    mailbox.enqueue(3);
                }
            }
        })));
        let _ = slot.set(Arc::downgrade(&mailbox));

        mailbox.start();
        mailbox.enqueue(1);
        assert_eq!(*log.lock(), vec!["1", "3"]);
    }

    proptest! {
        #[test]
        fn test_processing_preserves_enqueue_order(items in proptest::collection::vec(0u32..1000, 0..64)) {
            let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
            let sink = seen.clone();
            let mailbox = Mailbox::new(Box::new(move |item: u32| sink.lock().push(item)));
            let (before, after) = items.split_at(items.len() / 2);
            for item in before {
                mailbox.enqueue(*item);
            }
            mailbox.start();
            for item in after {
                mailbox.enqueue(*item);
            }
            prop_assert_eq!(seen.lock().clone(), items);
        }
    }
}
