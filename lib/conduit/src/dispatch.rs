use crate::vector::VectorMessage;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

/// I/O modes governing what happens to the reply of an outbound vector
/// message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoMode {
    /// Wait for the reply before returning to the caller.
    Block,
    /// Return immediately; the reply is stored for later retrieval.
    Async,
    /// Return immediately; the reply is handed to a callback.
    Callback,
    /// Return immediately; the reply, if any, is dropped.
    Discard,
}

/// Invoked by the dispatching thread while it holds the endpoint mutex.
/// Callbacks must be short and must not call back into the endpoint; a
/// callback that needs the endpoint should push the message onto its own
/// queue and handle it after the dispatch cycle returns.
pub type ReplyCallback = Box<dyn FnOnce(VectorMessage) + Send>;

/// Per-vector pending state for an outstanding outbound message.
pub(crate) enum Pending {
    AwaitedEmpty,
    AwaitedReady(VectorMessage),
    Callback(ReplyCallback),
}

/// What the correlation table decided to do with an incoming message. The
/// callback itself is returned so the caller can invoke it with the table
/// lock released.
pub(crate) enum Delivery {
    Stored,
    Dispatch(ReplyCallback, VectorMessage),
    Discarded,
}

/// Correlation table keyed by the local send vector. A single map of tagged
/// variants, so an incoming reply is classified against awaited and callback
/// entries in one lookup.
pub(crate) struct Table {
    entries: HashMap<u64, Pending>,
}

impl Table {
    #[inline]
    pub fn new() -> Table {
        Table {
            entries: HashMap::new(),
        }
    }

    /// Number of outstanding entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Registers pending state for a vector about to be sent. Must happen
    /// before the frame is committed to the outbound queue.
    #[inline]
    pub fn register(&mut self, vector: u64, entry: Pending) {
        self.entries.insert(vector, entry);
    }

    /// Classifies an incoming message by its `rvector`. An awaited entry
    /// stores the message (a later duplicate overwrites an unclaimed one), a
    /// callback entry is removed and handed back for invocation, and an
    /// absent entry means discard.
    pub fn deposit(&mut self, message: VectorMessage) -> Delivery {
        match self.entries.entry(message.rvector) {
            Entry::Occupied(mut slot) => match slot.get() {
                Pending::Callback(_) => match slot.remove() {
                    Pending::Callback(callback) => Delivery::Dispatch(callback, message),
                    _ => unreachable!(),
                },
                _ => {
                    slot.insert(Pending::AwaitedReady(message));
                    Delivery::Stored
                }
            },
            Entry::Vacant(_) => Delivery::Discarded,
        }
    }

    /// True when a stored reply is waiting for the given vector.
    #[inline]
    pub fn is_ready(&self, vector: u64) -> bool {
        match self.entries.get(&vector) {
            Some(Pending::AwaitedReady(_)) => true,
            _ => false,
        }
    }

    /// Removes and returns the stored reply for the given vector, if one has
    /// arrived.
    pub fn take_ready(&mut self, vector: u64) -> Option<VectorMessage> {
        if !self.is_ready(vector) {
            return None;
        }

        match self.entries.remove(&vector) {
            Some(Pending::AwaitedReady(message)) => Some(message),
            _ => unreachable!(),
        }
    }

    /// Drops the entry for the given vector regardless of its state.
    #[inline]
    pub fn remove(&mut self, vector: u64) -> bool {
        self.entries.remove(&vector).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn message(vector: u64, rvector: u64) -> VectorMessage {
        VectorMessage {
            vector,
            rvector,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_deposit_without_entry_discards() {
        let mut table = Table::new();

        match table.deposit(message(1, 42)) {
            Delivery::Discarded => (),
            _ => panic!("Expected the message to be discarded"),
        }

        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_awaited_store_and_take() {
        let mut table = Table::new();

        table.register(5, Pending::AwaitedEmpty);

        assert!(!table.is_ready(5));
        assert!(table.take_ready(5).is_none());
        assert_eq!(table.len(), 1);

        match table.deposit(message(100, 5)) {
            Delivery::Stored => (),
            _ => panic!("Expected the message to be stored"),
        }

        assert!(table.is_ready(5));

        let stored = table.take_ready(5).unwrap();

        assert_eq!(stored.vector, 100);
        assert_eq!(stored.rvector, 5);
        assert_eq!(table.len(), 0);
        assert!(table.take_ready(5).is_none());
    }

    #[test]
    fn test_duplicate_reply_overwrites_stored() {
        let mut table = Table::new();

        table.register(5, Pending::AwaitedEmpty);
        table.deposit(message(100, 5));
        table.deposit(message(101, 5));

        assert_eq!(table.take_ready(5).unwrap().vector, 101);
    }

    #[test]
    fn test_callback_dispatch_removes_entry() {
        let mut table = Table::new();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();

        table.register(
            7,
            Pending::Callback(Box::new(move |message| {
                fired_clone.store(message.vector, Ordering::SeqCst);
            })),
        );

        match table.deposit(message(200, 7)) {
            Delivery::Dispatch(callback, message) => callback(message),
            _ => panic!("Expected a callback dispatch"),
        }

        assert_eq!(fired.load(Ordering::SeqCst), 200);
        assert_eq!(table.len(), 0);

        // A second reply to the same vector finds no entry anymore.
        match table.deposit(message(201, 7)) {
            Delivery::Discarded => (),
            _ => panic!("Expected the duplicate to be discarded"),
        }
    }

    #[test]
    fn test_remove_abandons_any_state() {
        let mut table = Table::new();

        table.register(1, Pending::AwaitedEmpty);
        table.register(2, Pending::Callback(Box::new(|_| ())));

        assert!(table.remove(1));
        assert!(table.remove(2));
        assert!(!table.remove(3));
        assert_eq!(table.len(), 0);
    }
}
