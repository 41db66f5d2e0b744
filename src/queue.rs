use std::{collections::VecDeque, sync::Mutex};
use tokio::sync::Semaphore;

///
/// A blocking FIFO work queue with graceful-end and hard-cancel
/// semantics, shared between one producer side and any number of
/// concurrent consumers.
///
/// `end` lets consumers drain the items already queued before they
/// observe completion; `cancel` discards queued items and completes the
/// consumers immediately. Both are terminal: once the queue is closed,
/// `put` refuses new items.
///
#[derive(Debug)]
pub struct CancelableQueue<T> {
    items: Mutex<VecDeque<T>>,
    permits: Semaphore,
}

impl<T> CancelableQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
        }
    }

    ///
    /// Appends an item to the tail of the queue and wakes one waiting
    /// consumer. Returns `false` if the queue has been ended or
    /// cancelled, in which case the item is dropped.
    ///
    pub fn put(&self, item: T) -> bool {
        match self.items.lock() {
            Ok(mut items) => {
                // Check under the lock so a concurrent cancel either sees
                // this item and discards it, or has already closed us.
                if self.permits.is_closed() {
                    return false;
                }
                items.push_back(item);
            }
            Err(_) => return false,
        }
        self.permits.add_permits(1);
        true
    }

    ///
    /// Removes and returns the item at the head of the queue, suspending
    /// the caller until an item is available. Returns `None` once the
    /// queue has ended and drained, or immediately after a cancel.
    ///
    pub async fn get(&self) -> Option<T> {
        loop {
            match self.permits.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    // A cancel may have discarded the items between the
                    // wakeup and this pop; if so, wait again.
                    if let Some(item) = self.items.lock().ok()?.pop_front() {
                        return Some(item);
                    }
                }
                // The queue is closed: hand out whatever is left, then
                // report completion.
                Err(_) => return self.items.lock().ok()?.pop_front(),
            }
        }
    }

    ///
    /// Closes the queue gracefully: items already queued are still
    /// handed to consumers, after which `get` returns `None`.
    ///
    pub fn end(&self) {
        self.permits.close();
    }

    ///
    /// Closes the queue immediately, discarding any queued items.
    /// Waiting consumers observe completion right away.
    ///
    pub fn cancel(&self) {
        match self.items.lock() {
            Ok(mut items) => {
                self.permits.close();
                items.clear();
            }
            Err(_) => self.permits.close(),
        }
    }

    /// Returns `true` once the queue has been ended or cancelled.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Returns the number of items currently queued.
    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CancelableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
