//! Change detection for the unseen count and the subscriber registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Emitted when the unseen count differs from the previous observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NewMailDetected {
    /// Unseen messages at the time of the poll.
    pub unseen_count: u32,
}

/// Remembers the last unseen count and reports changes.
///
/// The first observation always counts as a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeNotifier {
    last_unseen: Option<u32>,
}

impl ChangeNotifier {
    /// Creates a notifier that has seen nothing yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { last_unseen: None }
    }

    /// Last observed count; `None` until the first observation.
    #[must_use]
    pub const fn last_unseen(&self) -> Option<u32> {
        self.last_unseen
    }

    /// Records `unseen` and returns an event if it differs from the
    /// previous value. Decreases count as changes.
    pub fn observe(&mut self, unseen: u32) -> Option<NewMailDetected> {
        if self.last_unseen == Some(unseen) {
            return None;
        }
        self.last_unseen = Some(unseen);
        Some(NewMailDetected {
            unseen_count: unseen,
        })
    }
}

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&NewMailDetected) + Send + Sync>;

/// Callbacks for [`NewMailDetected`], run in registration order.
#[derive(Default)]
pub struct Subscribers {
    handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Subscribers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&NewMailDetected) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every callback with `event` on the current task and returns
    /// how many ran.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panicking callback propagates to the caller.
    pub fn dispatch(&self, event: &NewMailDetected) -> usize {
        let handlers: Vec<Handler> = self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Handler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn emissions(counts: &[u32]) -> Vec<u32> {
        let mut notifier = ChangeNotifier::new();
        counts
            .iter()
            .filter_map(|&c| notifier.observe(c))
            .map(|e| e.unseen_count)
            .collect()
    }

    #[test]
    fn first_observation_emits() {
        let mut notifier = ChangeNotifier::new();
        assert_eq!(notifier.last_unseen(), None);
        assert_eq!(notifier.observe(0), Some(NewMailDetected { unseen_count: 0 }));
        assert_eq!(notifier.last_unseen(), Some(0));
    }

    #[test]
    fn repeated_count_is_silent() {
        let mut notifier = ChangeNotifier::new();
        notifier.observe(4);
        assert_eq!(notifier.observe(4), None);
    }

    #[test]
    fn sequence_with_drop() {
        assert_eq!(emissions(&[0, 0, 3, 3, 0]), vec![0, 3, 0]);
    }

    #[test]
    fn dispatch_in_registration_order() {
        let subscribers = Subscribers::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = Arc::clone(&log);
            subscribers.subscribe(move |e| log.lock().unwrap().push((name, e.unseen_count)));
        }

        let ran = subscribers.dispatch(&NewMailDetected { unseen_count: 2 });
        assert_eq!(ran, 2);
        assert_eq!(*log.lock().unwrap(), vec![("first", 2), ("second", 2)]);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let subscribers = Subscribers::new();
        let id = subscribers.subscribe(|_| {});
        subscribers.subscribe(|_| {});
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn dispatch_without_subscribers_is_lost() {
        let subscribers = Subscribers::new();
        assert!(subscribers.is_empty());
        assert_eq!(subscribers.dispatch(&NewMailDetected { unseen_count: 1 }), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let subscribers = Arc::new(Subscribers::new());
        let slot = Arc::new(Mutex::new(None));
        let id = {
            let registry = Arc::clone(&subscribers);
            let slot = Arc::clone(&slot);
            subscribers.subscribe(move |_| {
                if let Some(id) = slot.lock().unwrap().take() {
                    registry.unsubscribe(id);
                }
            })
        };
        *slot.lock().unwrap() = Some(id);

        subscribers.dispatch(&NewMailDetected { unseen_count: 1 });
        assert!(subscribers.is_empty());
    }

    proptest! {
        #[test]
        fn emits_once_per_adjacent_change(counts in proptest::collection::vec(0u32..4, 0..50)) {
            let expected: Vec<u32> = counts
                .iter()
                .enumerate()
                .filter(|(i, c)| *i == 0 || counts[i - 1] != **c)
                .map(|(_, c)| *c)
                .collect();
            prop_assert_eq!(emissions(&counts), expected);
        }
    }
}
