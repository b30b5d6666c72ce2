//! Copy-on-write listener registry
//!
//! Shared base of every concrete transport mapping. Mutations build a new
//! immutable snapshot and swap it in atomically, so fan-out iterates one
//! point-in-time snapshot and never holds a lock while invoking listener
//! code. A listener may therefore add or remove listeners (itself included)
//! from inside `process_message` without deadlocking.
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::address::TransportAddress;
use crate::transport::state::TransportStateReference;
use crate::transport::TransportListener;

type Snapshot = Arc<Vec<Arc<dyn TransportListener>>>;

pub struct ListenerRegistry {
    snapshot: ArcSwap<Vec<Arc<dyn TransportListener>>>,
    // Serializes writers; readers go straight to the snapshot.
    write_lock: Mutex<()>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn lock_writers(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a listener. No-op if this exact listener (pointer
    /// identity) is already present.
    pub fn add(&self, listener: Arc<dyn TransportListener>) {
        let _guard = self.lock_writers();
        let current = self.snapshot.load_full();
        if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(listener);
        self.snapshot.store(Arc::new(next));
    }

    /// Removes a listener. No-op if absent.
    pub fn remove(&self, listener: &Arc<dyn TransportListener>) {
        let _guard = self.lock_writers();
        let current = self.snapshot.load_full();
        if !current.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return;
        }
        let next: Vec<_> = current
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Delivers one message to every listener in the current snapshot, in
    /// insertion order, synchronously on the calling task.
    ///
    /// Listener panics are not caught: a misbehaving listener aborts the
    /// receive loop that called this.
    pub fn fire_process_message(
        &self,
        peer: &TransportAddress,
        message: &[u8],
        state_ref: &TransportStateReference,
    ) {
        let snapshot: Snapshot = self.snapshot.load_full();
        for listener in snapshot.iter() {
            listener.process_message(peer, message, state_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::state::TransportHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingListener {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Vec<u8>> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl TransportListener for RecordingListener {
        fn process_message(
            &self,
            _peer: &TransportAddress,
            message: &[u8],
            _state_ref: &TransportStateReference,
        ) {
            self.seen.lock().unwrap().push(message.to_vec());
        }
    }

    fn fire(registry: &ListenerRegistry, message: &[u8]) {
        let peer: TransportAddress = "udp:127.0.0.1:2001".parse().unwrap();
        let state_ref = TransportStateReference::new(None, TransportHandle::None);
        registry.fire_process_message(&peer, message, &state_ref);
    }

    #[test]
    fn test_add_is_idempotent_by_identity() {
        let registry = ListenerRegistry::new();
        let listener = RecordingListener::new();
        registry.add(listener.clone());
        registry.add(listener.clone());
        assert_eq!(registry.len(), 1);

        fire(&registry, b"once");
        assert_eq!(listener.seen(), vec![b"once".to_vec()]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = ListenerRegistry::new();
        let present = RecordingListener::new();
        let absent = RecordingListener::new();
        registry.add(present.clone());

        registry.remove(&(absent as Arc<dyn TransportListener>));
        assert_eq!(registry.len(), 1);

        registry.remove(&(present.clone() as Arc<dyn TransportListener>));
        assert!(registry.is_empty());
        fire(&registry, b"gone");
        assert!(present.seen().is_empty());
    }

    #[test]
    fn test_listener_added_later_misses_earlier_messages() {
        let registry = ListenerRegistry::new();
        let early = RecordingListener::new();
        registry.add(early.clone());

        fire(&registry, b"first");

        let late = RecordingListener::new();
        registry.add(late.clone());
        fire(&registry, b"second");

        assert_eq!(early.seen(), vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(late.seen(), vec![b"second".to_vec()]);
    }

    #[test]
    fn test_reentrant_removal_during_fanout() {
        struct SelfRemoving {
            registry: Arc<ListenerRegistry>,
            this: Mutex<Option<Arc<dyn TransportListener>>>,
            calls: AtomicUsize,
        }

        impl TransportListener for SelfRemoving {
            fn process_message(
                &self,
                _peer: &TransportAddress,
                _message: &[u8],
                _state_ref: &TransportStateReference,
            ) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(this) = self.this.lock().unwrap().take() {
                    self.registry.remove(&this);
                }
            }
        }

        let registry = Arc::new(ListenerRegistry::new());
        let listener = Arc::new(SelfRemoving {
            registry: registry.clone(),
            this: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        *listener.this.lock().unwrap() =
            Some(listener.clone() as Arc<dyn TransportListener>);
        registry.add(listener.clone());

        fire(&registry, b"ping");
        fire(&registry, b"ping");
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    // Snapshot isolation: concurrent registration never corrupts an
    // in-progress fan-out, and a listener never observes a message whose
    // fan-out finished strictly before it was added.
    #[test]
    fn test_concurrent_adds_during_fanout() {
        let registry = Arc::new(ListenerRegistry::new());
        let anchor = RecordingListener::new();
        registry.add(anchor.clone());

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let mut added = Vec::new();
                for _ in 0..1000 {
                    let listener = RecordingListener::new();
                    registry.add(listener.clone());
                    added.push(listener);
                }
                added
            })
        };

        let mut fired = Vec::new();
        for i in 0u32..200 {
            let message = i.to_be_bytes().to_vec();
            fire(&registry, &message);
            fired.push(message);
        }

        let added = writer.join().expect("writer thread panicked");
        assert_eq!(registry.len(), 1001);

        // The anchor saw every message in order.
        assert_eq!(anchor.seen(), fired);
        // Every concurrently added listener saw a contiguous suffix of the
        // fired sequence.
        for listener in added {
            let seen = listener.seen();
            if seen.is_empty() {
                continue;
            }
            let start = fired
                .iter()
                .position(|m| m == &seen[0])
                .expect("listener saw an unknown message");
            assert_eq!(&fired[start..start + seen.len()], &seen[..]);
        }
    }
}
