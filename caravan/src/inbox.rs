//! Lock-free response inbox.
//!
//! Executor completions may arrive from any thread. They are pushed onto
//! a Treiber stack without locks; the queue worker detaches the whole
//! stack in one swap and walks it newest-first to rebuild its ordered
//! send list. Only the push CAS races; the drain is single-consumer.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// A multi-producer, single-consumer intrusive stack.
pub(crate) struct ResponseStack<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> ResponseStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a value. Safe from any thread.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: node is exclusively ours until the CAS succeeds.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detach the whole stack and return its values newest-first.
    pub fn take_all(&self) -> Vec<T> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut out = Vec::new();
        while !head.is_null() {
            // Safety: the swap made this chain exclusively ours.
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            out.push(node.value);
        }
        out
    }
}

impl<T> Drop for ResponseStack<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

// Safety: values are moved through the stack whole; the head pointer is
// the only shared state and is managed with atomics.
unsafe impl<T: Send> Send for ResponseStack<T> {}
unsafe impl<T: Send> Sync for ResponseStack<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn take_all_is_lifo() {
        let stack = ResponseStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.take_all(), vec![3, 2, 1]);
        assert!(stack.take_all().is_empty());
    }

    #[test]
    fn push_after_drain() {
        let stack = ResponseStack::new();
        stack.push(1);
        stack.take_all();
        stack.push(2);
        assert_eq!(stack.take_all(), vec![2]);
    }

    #[test]
    fn concurrent_pushes_all_arrive() {
        let stack = Arc::new(ResponseStack::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    stack.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut values = stack.take_all();
        values.sort_unstable();
        assert_eq!(values.len(), 4000);
        assert_eq!(values, (0..4000).collect::<Vec<_>>());
    }

    #[test]
    fn drop_releases_pending() {
        let stack = ResponseStack::new();
        stack.push(String::from("pending"));
        drop(stack);
    }
}
