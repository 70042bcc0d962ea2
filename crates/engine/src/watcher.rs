//! Watch events: a bounded queue between commits and subscribers.
//!
//! The commit path pushes one event per record into a bounded ring; a drain
//! thread fans the events out to subscriber channels. A full ring drops the
//! *oldest* event rather than blocking the committing writer.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::debug;

/// What a committed record did to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// A live write (including TTL refreshes).
    Put,
    /// A tombstone.
    Delete,
}

/// One committed change, delivered to watch subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Whether the key was written or deleted.
    pub action: WatchAction,
    /// The key the record was committed under.
    pub key: Vec<u8>,
    /// The committed value; empty for deletes.
    pub value: Vec<u8>,
    /// Batch the record was committed in. All events of one commit share it.
    pub batch_id: u64,
}

struct WatcherState {
    queue: VecDeque<Event>,
    subscribers: Vec<(u64, mpsc::Sender<Event>)>,
    next_subscriber_id: u64,
    shutdown: bool,
    dropped: u64,
}

/// Bounded drop-oldest event queue plus its subscriber registry.
pub(crate) struct Watcher {
    state: Mutex<WatcherState>,
    ready: Condvar,
    capacity: usize,
}

impl Watcher {
    pub fn new(capacity: usize) -> Self {
        Watcher {
            state: Mutex::new(WatcherState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                shutdown: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an event from the commit path. Never blocks: a full queue
    /// sheds its oldest event instead.
    pub fn put_event(&self, event: Event) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            state.dropped += 1;
            debug!(
                target: "vellum::watch",
                total_dropped = state.dropped,
                "watch queue full, dropped oldest event"
            );
        }
        state.queue.push_back(event);
        self.ready.notify_one();
    }

    /// Register a new subscriber and hand back its receiving end.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        let mut state = self.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push((id, tx));
        rx
    }

    /// Stop the drain thread once the queue is empty.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.ready.notify_all();
    }

    fn drain_loop(&self) {
        loop {
            let (events, subscribers) = {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.shutdown {
                    self.ready.wait(&mut state);
                }
                if state.queue.is_empty() && state.shutdown {
                    // Dropping the senders disconnects every receiver, so
                    // subscribers observe the close instead of blocking
                    state.subscribers.clear();
                    return;
                }
                let events: Vec<Event> = state.queue.drain(..).collect();
                (events, state.subscribers.clone())
            };

            // Deliver outside the lock so a slow subscriber cannot stall
            // the commit path.
            let mut disconnected = Vec::new();
            for event in events {
                for (id, tx) in &subscribers {
                    if tx.send(event.clone()).is_err() && !disconnected.contains(id) {
                        disconnected.push(*id);
                    }
                }
            }

            if !disconnected.is_empty() {
                let mut state = self.state.lock();
                state
                    .subscribers
                    .retain(|(id, _)| !disconnected.contains(id));
            }
        }
    }
}

/// Spawn the drain thread for `watcher`.
pub(crate) fn spawn_drain(watcher: std::sync::Arc<Watcher>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("vellum-watch".to_string())
        .spawn(move || watcher.drain_loop())
        .expect("failed to spawn watcher drain thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(key: &[u8], batch_id: u64) -> Event {
        Event {
            action: WatchAction::Put,
            key: key.to_vec(),
            value: b"v".to_vec(),
            batch_id,
        }
    }

    #[test]
    fn test_events_reach_subscriber() {
        let watcher = Arc::new(Watcher::new(16));
        let rx = watcher.subscribe();
        let handle = spawn_drain(Arc::clone(&watcher));

        watcher.put_event(event(b"a", 1));
        watcher.put_event(event(b"b", 1));

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.key, b"a");
        assert_eq!(second.key, b"b");
        assert_eq!(first.batch_id, second.batch_id);

        watcher.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let watcher = Watcher::new(2);
        watcher.put_event(event(b"a", 1));
        watcher.put_event(event(b"b", 2));
        watcher.put_event(event(b"c", 3));

        let state = watcher.state.lock();
        let keys: Vec<_> = state.queue.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(state.dropped, 1);
    }

    #[test]
    fn test_close_drains_pending_events() {
        let watcher = Arc::new(Watcher::new(16));
        let rx = watcher.subscribe();

        watcher.put_event(event(b"a", 1));
        let handle = spawn_drain(Arc::clone(&watcher));
        watcher.close();
        handle.join().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap().key, b"a");
        assert!(rx.recv().is_err(), "channel closes after drain exits");
    }

    #[test]
    fn test_disconnected_subscriber_is_pruned() {
        let watcher = Arc::new(Watcher::new(16));
        let rx_dead = watcher.subscribe();
        let rx_live = watcher.subscribe();
        drop(rx_dead);

        let handle = spawn_drain(Arc::clone(&watcher));
        watcher.put_event(event(b"a", 1));
        assert_eq!(
            rx_live.recv_timeout(Duration::from_secs(5)).unwrap().key,
            b"a"
        );

        // The dead subscriber is removed after the failed delivery
        for _ in 0..100 {
            if watcher.state.lock().subscribers.len() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(watcher.state.lock().subscribers.len(), 1);

        watcher.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_put_event_after_close_is_ignored() {
        let watcher = Watcher::new(4);
        watcher.close();
        watcher.put_event(event(b"a", 1));
        assert!(watcher.state.lock().queue.is_empty());
    }
}
