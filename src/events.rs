//! Listener registration and dispatch.
//!
//! Both the client and the session registry notify callers of lifecycle and
//! data events through listener sets. The set is copied before iteration so
//! a listener may unsubscribe (itself or another) during dispatch, and each
//! listener's failure is isolated: one panicking listener must not terminate
//! delivery to the others or unwind into the protocol machinery.

use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Registry<T> = Mutex<HashMap<u64, Callback<T>>>;

/// A set of listeners for one event type.
pub struct ListenerSet<T> {
    listeners: Arc<Registry<T>>,
    next_id: AtomicU64,
}

/// Handle returned from listener registration.
///
/// Call [`unsubscribe`](Self::unsubscribe) to detach the listener. Dropping
/// the handle without unsubscribing leaves the listener attached.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Detaches the listener this handle was returned for.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl<T> ListenerSet<T> {
    /// Creates an empty listener set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a listener and returns its unsubscribe handle.
    pub fn add<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, Arc::new(listener));
        }

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.listeners);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    if let Ok(mut listeners) = listeners.lock() {
                        listeners.remove(&id);
                    }
                }
            })),
        }
    }

    /// Delivers `event` to every listener registered at call time.
    ///
    /// The set is snapshotted before iteration; panics are caught per
    /// listener and logged.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = match self.listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };

        for listener in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("listener panicked during event dispatch");
            }
        }
    }

    /// Number of currently attached listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Whether no listeners are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn emit_reaches_all_listeners() {
        let set = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _subs: Vec<_> = (0..3)
            .map(|_| {
                let hits = Arc::clone(&hits);
                set.add(move |_: &u32| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        set.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribe_detaches() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let sub = set.add(|_| {});
        assert_eq!(set.len(), 1);
        sub.unsubscribe();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let set = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = set.add(|_: &u32| panic!("boom"));
        let hits_clone = Arc::clone(&hits);
        let _good = set.add(move |_: &u32| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        set.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_during_dispatch_is_safe() {
        let set: Arc<ListenerSet<u32>> = Arc::new(ListenerSet::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let sub = {
            let slot = Arc::clone(&slot);
            set.add(move |_| {
                // Removes itself mid-dispatch.
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(sub);

        set.emit(&1);
        assert_eq!(set.len(), 0);
    }
}
