//! # Processor - Generic Routing Engine
//!
//! ## Purpose
//! One `Processor` consumes messages from its side of the bridge, rewrites
//! federation headers, and pushes routing instructions onto the peer
//! processor's inbox. The two sides differ only in server discovery,
//! subscription subject/queue-group, and the rewrite they perform, so that
//! behavior lives behind [`ProcessorLogic`] and everything else is shared
//! driver code.
//!
//! ## Threads
//! Each processor runs two dedicated, supervised OS threads:
//! - **consume loop**: `receive()` → decode → gate → rewrite → enqueue on the
//!   peer's inbox. A bad message never kills the loop.
//! - **inbox handler**: pops instructions pushed by the peer and publishes
//!   them. A failed publish requeues the instruction for at-least-once
//!   redelivery, forces a reconnect, and fails the unit so the supervisor
//!   restarts it; a broken transport must not silently drop traffic.

pub mod collective;
pub mod federation;

pub use collective::CollectiveLogic;
pub use federation::FederationLogic;

use crate::config::BrokerConfig;
use crate::supervisor::{supervise, Supervised};
use crate::{unix_now, BrokerResult, ThreadRegistry};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use protocol::{Envelope, RoutingInstruction, SeenByHop};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport::{BackoffPolicy, Connection, Connector, WireMessage, DISCONNECTED};
use tracing::{debug, error, info, warn};

/// Subscription target for one side of the bridge. Instances sharing the
/// cluster-scoped queue group form a competing-consumer group, so each
/// inbound message reaches exactly one broker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub subject: String,
    pub queue_group: Option<String>,
}

/// Everything a rewrite needs to know about its surroundings
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// `<cluster>:<instance>` identity recorded in seen-by hops
    pub instance_id: String,
    /// Connected server on the side the message arrived from
    pub inbound_server: String,
    /// Connected server on the side the instruction will leave through
    pub outbound_server: String,
    /// This broker's collective-facing subject, the reply address handed to
    /// the local fleet
    pub collective_subject: String,
}

impl ProcessContext {
    /// The hop record this broker instance contributes to a traceable message
    pub fn hop(&self) -> SeenByHop {
        SeenByHop::new(
            self.inbound_server.clone(),
            self.instance_id.clone(),
            self.outbound_server.clone(),
        )
    }
}

/// Side-specific behavior of a processor
pub trait ProcessorLogic: Send + Sync + 'static {
    /// Side name, used for thread names, log fields and stats
    fn side(&self) -> &'static str;

    /// Resolve the transport endpoints for this side. An empty list is a
    /// fatal configuration fault.
    fn servers(&self, config: &BrokerConfig) -> BrokerResult<Vec<String>>;

    /// Subject and queue group this side subscribes with
    fn queue_spec(&self, cluster: &str) -> QueueSpec;

    /// Pre-check gate evaluated before `process`; failing messages are
    /// silently dropped
    fn should_process(&self, envelope: &Envelope) -> bool;

    /// Rewrite the envelope and produce the routing instruction for the peer
    fn process(
        &self,
        envelope: Envelope,
        ctx: &ProcessContext,
    ) -> BrokerResult<RoutingInstruction>;
}

/// Live stats snapshot for one processor
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub source: String,
    pub received: u64,
    pub sent: u64,
    pub last_message: u64,
    pub connected_server: String,
    pub work_queue: usize,
}

/// Anything that can report processor stats to the stats service
pub trait StatsSource: Send + Sync {
    fn stats_snapshot(&self) -> ProcessorStats;
}

#[derive(Default)]
struct StatsCounters {
    received: u64,
    sent: u64,
    last_message: u64,
}

/// Shared slot holding a side's live connection. The consume thread fills it
/// after connecting; the inbox handler, the peer processor and the stats
/// service read from it.
#[derive(Clone, Default)]
pub struct ConnectionCell(Arc<Mutex<Option<Arc<dyn Connection>>>>);

impl ConnectionCell {
    pub fn set(&self, connection: Arc<dyn Connection>) {
        *self.0.lock() = Some(connection);
    }

    pub fn get(&self) -> Option<Arc<dyn Connection>> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().take();
    }

    pub fn connected_server(&self) -> String {
        self.get()
            .map(|c| c.connected_server())
            .unwrap_or_else(|| DISCONNECTED.to_string())
    }
}

/// Generic processor driver parameterized by side logic
pub struct Processor<L: ProcessorLogic> {
    logic: L,
    cluster: String,
    instance_id: String,
    connector: Arc<dyn Connector>,
    connection: ConnectionCell,
    peer_connection: ConnectionCell,
    inbox: Receiver<RoutingInstruction>,
    requeue: Sender<RoutingInstruction>,
    outbox: Sender<RoutingInstruction>,
    stats: Mutex<StatsCounters>,
    backoff: BackoffPolicy,
    stopped: Arc<AtomicBool>,
}

impl<L: ProcessorLogic> Processor<L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logic: L,
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
        connection: ConnectionCell,
        peer_connection: ConnectionCell,
        inbox: Receiver<RoutingInstruction>,
        requeue: Sender<RoutingInstruction>,
        outbox: Sender<RoutingInstruction>,
    ) -> Self {
        Self {
            logic,
            cluster: config.cluster.clone(),
            instance_id: config.instance_id(),
            connector,
            connection,
            peer_connection,
            inbox,
            requeue,
            outbox,
            stats: Mutex::new(StatsCounters::default()),
            backoff: BackoffPolicy::default(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn and register the two supervised worker threads
    pub fn start(self: &Arc<Self>, registry: &ThreadRegistry) -> BrokerResult<()> {
        let consumer_name = format!("{}_consumer", self.logic.side());
        let processor = self.clone();
        let name = consumer_name.clone();
        let handle = std::thread::Builder::new()
            .name(consumer_name.clone())
            .spawn(move || supervise(&name, processor.backoff, || processor.run_consumer()))?;
        registry.record(&consumer_name, handle)?;

        let inbox_name = format!("{}_inbox", self.logic.side());
        let processor = self.clone();
        let name = inbox_name.clone();
        let handle = std::thread::Builder::new()
            .name(inbox_name.clone())
            .spawn(move || supervise(&name, processor.backoff, || processor.run_inbox()))?;
        registry.record(&inbox_name, handle)?;

        Ok(())
    }

    /// Stop both loops and the live connection
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(connection) = self.connection.get() {
            connection.stop();
        }
    }

    /// One supervised pass of the consume loop: connect, subscribe, consume
    /// until the connection dies or the processor stops
    fn run_consumer(&self) -> BrokerResult<Supervised> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(Supervised::Stop);
        }

        let connection = match self.connector.connect() {
            Ok(c) => c,
            Err(e) => {
                return if self.stopped.load(Ordering::SeqCst) {
                    Ok(Supervised::Stop)
                } else {
                    Err(e.into())
                };
            }
        };
        self.connection.set(connection.clone());

        let spec = self.logic.queue_spec(&self.cluster);
        while let Err(e) = connection.subscribe(&spec.subject, spec.queue_group.as_deref()) {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(Supervised::Stop);
            }
            warn!(
                side = self.logic.side(),
                subject = %spec.subject,
                error = %e,
                "subscribe failed, retrying"
            );
            std::thread::sleep(Duration::from_secs(1));
        }

        info!(
            side = self.logic.side(),
            subject = %spec.subject,
            queue_group = spec.queue_group.as_deref().unwrap_or("none"),
            "consuming"
        );

        loop {
            match connection.receive() {
                Ok(message) => self.handle_message(message),
                Err(e) => {
                    let stopping = self.stopped.load(Ordering::SeqCst);
                    connection.stop();
                    self.connection.clear();
                    return if stopping {
                        Ok(Supervised::Stop)
                    } else {
                        Err(e.into())
                    };
                }
            }
        }
    }

    /// Handle one inbound message. Never propagates an error: a single bad
    /// message must not kill the consumer.
    fn handle_message(&self, message: WireMessage) {
        {
            let mut stats = self.stats.lock();
            stats.received += 1;
            stats.last_message = unix_now();
        }

        let envelope = match Envelope::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    side = self.logic.side(),
                    subject = %message.subject,
                    error = %e,
                    "discarding undecodable message"
                );
                return;
            }
        };

        if !self.logic.should_process(&envelope) {
            debug!(
                side = self.logic.side(),
                subject = %message.subject,
                "dropping message that failed pre-checks"
            );
            return;
        }

        let ctx = ProcessContext {
            instance_id: self.instance_id.clone(),
            inbound_server: self.connection.connected_server(),
            outbound_server: self.peer_connection.connected_server(),
            collective_subject: protocol::collective_subject(&self.cluster),
        };

        match self.logic.process(envelope, &ctx) {
            Ok(instruction) => {
                debug!(
                    side = self.logic.side(),
                    req = %instruction.req,
                    targets = instruction.targets.len(),
                    "routed"
                );
                if self.outbox.send(instruction).is_err() {
                    warn!(
                        side = self.logic.side(),
                        "peer inbox is gone, dropping instruction"
                    );
                }
            }
            Err(e) => {
                warn!(
                    side = self.logic.side(),
                    error = %e,
                    "failed to process message"
                );
            }
        }
    }

    /// One supervised pass of the inbox handler: drain instructions pushed by
    /// the peer and publish them in order
    fn run_inbox(&self) -> BrokerResult<Supervised> {
        // wait for the consume thread to establish a connection
        let connection = loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(Supervised::Stop);
            }
            match self.connection.get() {
                Some(connection) => break connection,
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        };

        loop {
            let instruction = match self.inbox.recv_timeout(Duration::from_millis(500)) {
                Ok(instruction) => instruction,
                Err(RecvTimeoutError::Timeout) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return Ok(Supervised::Stop);
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(Supervised::Stop),
            };

            for target in &instruction.targets {
                if let Err(e) = connection.publish(target, instruction.data.as_bytes(), None) {
                    error!(
                        side = self.logic.side(),
                        target = %target,
                        req = %instruction.req,
                        error = %e,
                        "publish failed, requeueing instruction for redelivery"
                    );
                    let _ = self.requeue.send(instruction.clone());
                    connection.force_reconnect();
                    return Err(e.into());
                }
                self.stats.lock().sent += 1;
            }

            debug!(
                side = self.logic.side(),
                req = %instruction.req,
                targets = instruction.targets.len(),
                "delivered"
            );
        }
    }
}

impl<L: ProcessorLogic> StatsSource for Processor<L> {
    fn stats_snapshot(&self) -> ProcessorStats {
        let counters = self.stats.lock();
        ProcessorStats {
            source: self.logic.side().to_string(),
            received: counters.received,
            sent: counters.sent,
            last_message: counters.last_message,
            connected_server: self.connection.connected_server(),
            work_queue: self.inbox.len(),
        }
    }
}
