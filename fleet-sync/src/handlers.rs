//! Keyed observer lists.
//!
//! Handlers are looked up when an event is dispatched, not captured when a
//! channel is opened, so replacing or removing a handler takes effect for
//! the very next event.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type Handler<A> = Box<dyn Fn(&A) + Send>;

/// Handlers registered under a key `K`, called with an `A`.
pub(crate) struct HandlerTable<K, A> {
    next_id: u64,
    entries: Vec<(HandlerId, K, Handler<A>)>,
}

impl<K, A> Default for HandlerTable<K, A> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<K: PartialEq, A> HandlerTable<K, A> {
    pub(crate) fn insert<F>(&mut self, key: K, handler: F) -> HandlerId
    where
        F: Fn(&A) + Send + 'static,
    {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.entries.push((id, key, Box::new(handler)));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _, _)| *entry != id);
        self.entries.len() != before
    }

    /// Call every handler registered under `key`, in registration order.
    /// Returns how many ran.
    pub(crate) fn dispatch(&self, key: &K, arg: &A) -> usize {
        let mut called = 0;
        for (_, _, handler) in self.entries.iter().filter(|(_, k, _)| k == key) {
            handler(arg);
            called += 1;
        }
        called
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K, A> fmt::Debug for HandlerTable<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("handlers", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_by_key() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table: HandlerTable<&str, u32> = HandlerTable::default();
        let h = hits.clone();
        table.insert("a", move |n| {
            h.fetch_add(*n as usize, Ordering::SeqCst);
        });
        table.insert("b", |_| panic!("wrong key"));

        assert_eq!(table.dispatch(&"a", &3), 1);
        assert_eq!(table.dispatch(&"c", &3), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_removed_handler_not_called() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table: HandlerTable<(), ()> = HandlerTable::default();
        let h = hits.clone();
        let id = table.insert((), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(table.remove(id));
        assert!(!table.remove(id));
        table.dispatch(&(), &());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 0);
    }
}
