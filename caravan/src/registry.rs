//! Process-wide queue registry.
//!
//! Tracks every live queue's socket and owning controller so that
//! controller teardown can shut queues down from outside their worker.
//! Passed in at construction rather than living as an ambient singleton.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

struct QueueEntry {
    fd: RawFd,
    ctrl: Option<u32>,
}

/// Registry of live queues, keyed by queue id.
pub struct QueueRegistry {
    queues: Mutex<HashMap<u32, QueueEntry>>,
    next_id: AtomicU32,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Register a new queue's socket; returns its allocated id.
    pub(crate) fn insert(&self, fd: RawFd) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queues
            .lock()
            .expect("queue registry poisoned")
            .insert(id, QueueEntry { fd, ctrl: None });
        id
    }

    /// Associate a queue with its owning controller at install time.
    pub(crate) fn set_ctrl(&self, id: u32, ctrl: u32) {
        if let Some(entry) = self
            .queues
            .lock()
            .expect("queue registry poisoned")
            .get_mut(&id)
        {
            entry.ctrl = Some(ctrl);
        }
    }

    /// Remove a queue. Must happen before its socket is closed so a
    /// concurrent controller delete never shuts a recycled descriptor.
    pub(crate) fn remove(&self, id: u32) {
        self.queues
            .lock()
            .expect("queue registry poisoned")
            .remove(&id);
    }

    /// Shut down the socket of every queue owned by `ctrl`. The owning
    /// workers observe the close and release the queues.
    pub fn delete_ctrl(&self, ctrl: u32) {
        let queues = self.queues.lock().expect("queue registry poisoned");
        for entry in queues.values() {
            if entry.ctrl == Some(ctrl) {
                // Safety: the fd stays valid while its entry is present.
                unsafe {
                    libc::shutdown(entry.fd, libc::SHUT_RDWR);
                }
            }
        }
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        self.queues.lock().expect("queue registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let registry = QueueRegistry::new();
        let a = registry.insert(-1);
        let b = registry.insert(-1);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.remove(a);
        assert_eq!(registry.len(), 1);
        registry.remove(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry = QueueRegistry::new();
        registry.remove(42);
        assert!(registry.is_empty());
    }
}
