//! In-memory bus double for exercising broker components without a network.
//!
//! Implements exact-subject delivery with queue-group competing-consumer
//! semantics: subscribers sharing a group receive messages round-robin, so a
//! published message reaches exactly one member per group. Plain
//! subscriptions receive every message.

use crate::{Connection, Connector, TransportError, TransportResult, WireMessage, DISCONNECTED};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Subscription {
    subject: String,
    queue_group: Option<String>,
    sender: Sender<WireMessage>,
    stopped: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: Mutex<Vec<Subscription>>,
    round_robin: Mutex<HashMap<(String, String), usize>>,
}

/// A process-local pub/sub bus shared by any number of connections
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection identified by `name` (reported as its connected
    /// server while the connection is live)
    pub fn connect(&self, name: &str) -> Arc<MemoryConnection> {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        Arc::new(MemoryConnection {
            bus: self.clone(),
            name: name.to_string(),
            inbox_tx,
            inbox_rx,
            stopped: Arc::new(AtomicBool::new(false)),
            subscribed: Mutex::new(HashSet::new()),
            fail_publishes: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
        })
    }

    /// Inject a message onto the bus from outside any connection
    pub fn publish(&self, subject: &str, payload: &[u8], reply_to: Option<&str>) {
        self.deliver(subject, payload, reply_to);
    }

    /// Live subscriptions for a subject, for tests that need to wait until a
    /// consumer is listening before publishing
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.subject == subject && !s.stopped.load(Ordering::SeqCst))
            .count()
    }

    fn deliver(&self, subject: &str, payload: &[u8], reply_to: Option<&str>) {
        let message = WireMessage {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload: payload.to_vec(),
        };

        let subscriptions = self.inner.subscriptions.lock();
        let mut groups: HashMap<&str, Vec<&Subscription>> = HashMap::new();

        for sub in subscriptions
            .iter()
            .filter(|s| s.subject == subject && !s.stopped.load(Ordering::SeqCst))
        {
            match &sub.queue_group {
                None => {
                    let _ = sub.sender.send(message.clone());
                }
                Some(group) => groups.entry(group).or_default().push(sub),
            }
        }

        let mut round_robin = self.inner.round_robin.lock();
        for (group, members) in groups {
            let counter = round_robin
                .entry((subject.to_string(), group.to_string()))
                .or_insert(0);
            let target = members[*counter % members.len()];
            *counter += 1;
            let _ = target.sender.send(message.clone());
        }
    }
}

/// One connection to a [`MemoryBus`]
pub struct MemoryConnection {
    bus: MemoryBus,
    name: String,
    inbox_tx: Sender<WireMessage>,
    inbox_rx: Receiver<WireMessage>,
    stopped: Arc<AtomicBool>,
    subscribed: Mutex<HashSet<String>>,
    fail_publishes: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryConnection {
    /// Make every subsequent publish fail, as a dead transport would
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Everything successfully published on this connection, in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Non-blocking receive, for draining in tests
    pub fn try_receive(&self) -> Option<WireMessage> {
        self.inbox_rx.try_recv().ok()
    }
}

impl Connection for MemoryConnection {
    fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> TransportResult<()> {
        let mut subscribed = self.subscribed.lock();
        if !subscribed.insert(subject.to_string()) {
            return Ok(());
        }

        self.bus.inner.subscriptions.lock().push(Subscription {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender: self.inbox_tx.clone(),
            stopped: self.stopped.clone(),
        });

        Ok(())
    }

    fn receive(&self) -> TransportResult<WireMessage> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(TransportError::Stopped);
            }
            match self.inbox_rx.recv_timeout(Duration::from_millis(25)) {
                Ok(message) => return Ok(message),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Stopped),
            }
        }
    }

    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        reply_to: Option<&str>,
    ) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        self.published
            .lock()
            .push((subject.to_string(), payload.to_vec()));
        self.bus.deliver(subject, payload, reply_to);

        Ok(())
    }

    fn connected_server(&self) -> String {
        if self.stopped.load(Ordering::SeqCst) {
            DISCONNECTED.to_string()
        } else {
            self.name.clone()
        }
    }

    fn force_reconnect(&self) {
        // memory connections have nothing to reconnect
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out connections to a shared [`MemoryBus`]
pub struct MemoryConnector {
    bus: MemoryBus,
    name: String,
}

impl MemoryConnector {
    pub fn new(bus: MemoryBus, name: impl Into<String>) -> Self {
        Self {
            bus,
            name: name.into(),
        }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        Ok(self.bus.connect(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_subscribers_all_receive() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        let b = bus.connect("b");
        a.subscribe("stats", None).unwrap();
        b.subscribe("stats", None).unwrap();

        bus.publish("stats", b"snapshot", None);

        assert_eq!(a.try_receive().unwrap().payload, b"snapshot");
        assert_eq!(b.try_receive().unwrap().payload, b"snapshot");
    }

    #[test]
    fn test_queue_group_delivers_to_exactly_one_member() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        let b = bus.connect("b");
        a.subscribe("work", Some("prod_collective")).unwrap();
        b.subscribe("work", Some("prod_collective")).unwrap();

        for i in 0..10 {
            bus.publish("work", format!("m{}", i).as_bytes(), None);
        }

        let mut received = 0;
        while a.try_receive().is_some() {
            received += 1;
        }
        while b.try_receive().is_some() {
            received += 1;
        }

        // every message delivered exactly once across the group
        assert_eq!(received, 10);
    }

    #[test]
    fn test_unrelated_subjects_are_not_delivered() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        a.subscribe("one", None).unwrap();

        bus.publish("two", b"x", None);
        assert!(a.try_receive().is_none());
    }

    #[test]
    fn test_failed_publish_reports_disconnected() {
        let bus = MemoryBus::new();
        let a = bus.connect("a");
        a.set_fail_publishes(true);

        let result = a.publish("subject", b"x", None);
        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert!(a.published().is_empty());
    }
}
