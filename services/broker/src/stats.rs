//! # Stats Service
//!
//! ## Purpose
//! Makes a broker instance observable: a loopback HTTP endpoint serving
//! `GET /stats`, a publisher that pushes the same snapshot onto the
//! federation bus every ten seconds, and a passive observe mode that
//! aggregates the snapshots of every instance in a cluster.
//!
//! Operators watch broker health exclusively through this service and the
//! logs; there is no synchronous error channel back to message senders.

use crate::config::BrokerConfig;
use crate::processor::{ConnectionCell, StatsSource};
use crate::supervisor::{supervise, Supervised};
use crate::{unix_now, BrokerResult, ThreadRegistry};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport::{BackoffPolicy, Connection, Connector};
use tracing::{debug, error, info, warn};

/// How often a broker instance publishes its snapshot onto the federation bus
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodic publisher plus optional HTTP listener for one broker instance
pub struct StatsService {
    cluster: String,
    instance: String,
    stats_port: Option<u16>,
    registry: Arc<ThreadRegistry>,
    sources: Vec<Arc<dyn StatsSource>>,
    publisher_connection: ConnectionCell,
    interval: Duration,
    requests: AtomicU64,
    stopped: AtomicBool,
}

impl StatsService {
    pub fn new(
        config: &BrokerConfig,
        registry: Arc<ThreadRegistry>,
        sources: Vec<Arc<dyn StatsSource>>,
        publisher_connection: ConnectionCell,
    ) -> Self {
        Self {
            cluster: config.cluster.clone(),
            instance: config.instance.clone(),
            stats_port: config.stats_port,
            registry,
            sources,
            publisher_connection,
            interval: STATS_INTERVAL,
            requests: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Override the publish interval, for tests and dashboards that want a
    /// faster cadence
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the publisher thread and, when a port is configured, the HTTP
    /// listener. Both are recorded in the broker's thread registry.
    pub fn start(self: &Arc<Self>) -> BrokerResult<()> {
        let service = self.clone();
        let handle = std::thread::Builder::new()
            .name("stats_publisher".to_string())
            .spawn(move || {
                supervise("stats_publisher", BackoffPolicy::default(), || {
                    service.run_publisher()
                })
            })?;
        self.registry.record("stats_publisher", handle)?;

        if let Some(port) = self.stats_port {
            let service = self.clone();
            let handle = std::thread::Builder::new()
                .name("stats_http".to_string())
                .spawn(move || run_http(service, port))?;
            self.registry.record("stats_http", handle)?;
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Current snapshot: broker health, both processors' live stats, and the
    /// HTTP request counter
    pub fn snapshot(&self) -> Value {
        let mut processors = serde_json::Map::new();
        for source in &self.sources {
            let stats = source.stats_snapshot();
            processors.insert(
                stats.source.clone(),
                serde_json::to_value(&stats).unwrap_or(Value::Null),
            );
        }

        json!({
            "cluster": self.cluster,
            "instance": self.instance,
            "ok": self.registry.ok(),
            "threads": self.registry.status(),
            "processors": processors,
            "requests": self.requests.load(Ordering::Relaxed),
            "timestamp": unix_now(),
        })
    }

    /// One supervised pass of the publisher loop
    fn run_publisher(&self) -> BrokerResult<Supervised> {
        loop {
            if self.sleep_interruptibly(self.interval) {
                return Ok(Supervised::Stop);
            }

            // nothing to publish on until the broker has connected its
            // federation side
            let connection = match self.publisher_connection.get() {
                Some(connection) => connection,
                None => {
                    debug!("federation side not connected yet, skipping stats publish");
                    continue;
                }
            };

            let snapshot = self.snapshot();
            connection.publish(
                &protocol::stats_subject(&self.cluster),
                snapshot.to_string().as_bytes(),
                None,
            )?;

            debug!(instance = %self.instance, "published stats snapshot");
        }
    }

    /// Sleep in short slices so stop() is honored promptly; true when stopped
    fn sleep_interruptibly(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.stopped.load(Ordering::SeqCst) {
                return true;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Serve `GET /stats` on loopback until the process exits
fn run_http(service: Arc<StatsService>, port: u16) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build stats listener runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let make_svc = make_service_fn(move |_conn| {
            let service = service.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, service.clone())
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!("stats listener on http://{}", addr);

        if let Err(e) = server.await {
            error!("stats listener failed: {}", e);
        }
    });
}

async fn handle_request(
    req: Request<Body>,
    service: Arc<StatsService>,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::from("Method not allowed"))
            .unwrap());
    }

    match req.uri().path() {
        "/stats" => {
            service.requests.fetch_add(1, Ordering::Relaxed);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(service.snapshot().to_string()))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not found"))
            .unwrap()),
    }
}

/// Passive observe mode: aggregates the stats snapshots of every broker
/// instance in a cluster, keyed by instance name.
pub struct StatsObserver {
    connection: Arc<dyn Connection>,
    latest: Arc<Mutex<HashMap<String, Value>>>,
    stopped: Arc<AtomicBool>,
}

impl StatsObserver {
    /// Connect, subscribe to the cluster's stats subject (no queue group, so
    /// every observer sees every snapshot) and start collecting
    pub fn start(connector: &dyn Connector, cluster: &str) -> BrokerResult<Self> {
        let connection = connector.connect()?;
        connection.subscribe(&protocol::stats_subject(cluster), None)?;

        let latest: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let collector_connection = connection.clone();
        let collector_latest = latest.clone();
        let collector_stopped = stopped.clone();
        std::thread::Builder::new()
            .name("stats_observer".to_string())
            .spawn(move || {
                while !collector_stopped.load(Ordering::SeqCst) {
                    let message = match collector_connection.receive() {
                        Ok(message) => message,
                        Err(_) => break,
                    };
                    match serde_json::from_slice::<Value>(&message.payload) {
                        Ok(snapshot) => {
                            match snapshot.get("instance").and_then(Value::as_str) {
                                Some(instance) => {
                                    collector_latest
                                        .lock()
                                        .insert(instance.to_string(), snapshot);
                                }
                                None => debug!("stats snapshot without an instance name"),
                            }
                        }
                        Err(e) => warn!(error = %e, "discarding undecodable stats snapshot"),
                    }
                }
            })?;

        Ok(Self {
            connection,
            latest,
            stopped,
        })
    }

    /// Latest snapshot per instance
    pub fn latest(&self) -> HashMap<String, Value> {
        self.latest.lock().clone()
    }

    /// Yield the aggregated map once per second until the callback returns
    /// false or the observer is stopped
    pub fn observe<F>(&self, mut callback: F)
    where
        F: FnMut(&HashMap<String, Value>) -> bool,
    {
        while !self.stopped.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
            let snapshot = self.latest();
            if !callback(&snapshot) {
                break;
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.connection.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorStats;
    use transport::testing::{MemoryBus, MemoryConnector};

    struct FakeSource(&'static str);

    impl StatsSource for FakeSource {
        fn stats_snapshot(&self) -> ProcessorStats {
            ProcessorStats {
                source: self.0.to_string(),
                received: 5,
                sent: 4,
                last_message: 1_700_000_000,
                connected_server: "nats1:4222".to_string(),
                work_queue: 1,
            }
        }
    }

    fn test_config() -> BrokerConfig {
        let mut config: BrokerConfig = toml::from_str(r#"cluster = "prod""#).unwrap();
        config.instance = "fed1".to_string();
        config
    }

    #[test]
    fn test_snapshot_merges_health_and_processor_stats() {
        let service = StatsService::new(
            &test_config(),
            Arc::new(ThreadRegistry::new()),
            vec![
                Arc::new(FakeSource("collective")),
                Arc::new(FakeSource("federation")),
            ],
            ConnectionCell::default(),
        );

        let snapshot = service.snapshot();
        assert_eq!(snapshot["cluster"], "prod");
        assert_eq!(snapshot["instance"], "fed1");
        assert_eq!(snapshot["ok"], true);
        assert_eq!(snapshot["processors"]["collective"]["received"], 5);
        assert_eq!(snapshot["processors"]["federation"]["sent"], 4);
        assert_eq!(snapshot["requests"], 0);
        assert!(snapshot["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_publisher_pushes_snapshots_onto_the_stats_subject() {
        let bus = MemoryBus::new();
        let listener = bus.connect("listener");
        listener
            .subscribe("choria.federation.prod.stats", None)
            .unwrap();

        let cell = ConnectionCell::default();
        cell.set(bus.connect("federation-nats"));

        let service = Arc::new(
            StatsService::new(
                &test_config(),
                Arc::new(ThreadRegistry::new()),
                vec![Arc::new(FakeSource("collective"))],
                cell,
            )
            .with_interval(Duration::from_millis(50)),
        );
        service.start().unwrap();

        let mut received = None;
        for _ in 0..50 {
            if let Some(message) = listener.try_receive() {
                received = Some(message);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        service.stop();

        let message = received.expect("no stats snapshot published");
        let snapshot: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(snapshot["instance"], "fed1");
        assert_eq!(snapshot["processors"]["collective"]["received"], 5);
    }

    #[test]
    fn test_observer_aggregates_instances() {
        let bus = MemoryBus::new();
        let observer =
            StatsObserver::start(&MemoryConnector::new(bus.clone(), "observer"), "prod")
                .unwrap();

        bus.publish(
            "choria.federation.prod.stats",
            br#"{"instance":"fed1","ok":true}"#,
            None,
        );
        bus.publish(
            "choria.federation.prod.stats",
            br#"{"instance":"fed2","ok":false}"#,
            None,
        );
        bus.publish("choria.federation.prod.stats", b"not json", None);

        let mut latest = HashMap::new();
        for _ in 0..50 {
            latest = observer.latest();
            if latest.len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        observer.stop();

        assert_eq!(latest.len(), 2);
        assert_eq!(latest["fed1"]["ok"], true);
        assert_eq!(latest["fed2"]["ok"], false);
    }
}
