//! # Broker Orchestrator
//!
//! Owns the two processors, the two hand-off queues between them, and the
//! named-thread registry behind the health checks. `start()` is non-blocking:
//! all connecting and consuming happens on the supervised worker threads.

use crate::config::BrokerConfig;
use crate::processor::{
    CollectiveLogic, ConnectionCell, FederationLogic, Processor, ProcessorLogic, StatsSource,
};
use crate::stats::StatsService;
use crate::{BrokerResult, ThreadRegistry};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use transport::{Connector, NetConnector, TransportOptions};
use tracing::info;

/// A single federation broker instance
pub struct FederationBroker {
    config: BrokerConfig,
    registry: Arc<ThreadRegistry>,
    collective_connector: Arc<dyn Connector>,
    federation_connector: Arc<dyn Connector>,
    collective: Mutex<Option<Arc<Processor<CollectiveLogic>>>>,
    federation: Mutex<Option<Arc<Processor<FederationLogic>>>>,
    stats: Mutex<Option<Arc<StatsService>>>,
    started: AtomicBool,
}

impl FederationBroker {
    /// Build a broker connecting to the configured buses. Configuration
    /// faults (empty server lists, bad TLS material) fail here, before any
    /// thread is spawned.
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        config.validate()?;

        let tls = config
            .tls
            .as_ref()
            .map(|settings| settings.build_connector())
            .transpose()?;

        let mut collective_options =
            TransportOptions::new("collective", CollectiveLogic.servers(&config)?);
        collective_options.tls = tls.clone();

        let mut federation_options =
            TransportOptions::new("federation", FederationLogic.servers(&config)?);
        federation_options.tls = tls;

        Ok(Self::assemble(
            config,
            Arc::new(NetConnector::new(collective_options)),
            Arc::new(NetConnector::new(federation_options)),
        ))
    }

    /// Build a broker over caller-provided connectors. Used by tests and
    /// embedders that bring their own bus.
    pub fn with_connectors(
        config: BrokerConfig,
        collective: Arc<dyn Connector>,
        federation: Arc<dyn Connector>,
    ) -> BrokerResult<Self> {
        config.validate()?;
        Ok(Self::assemble(config, collective, federation))
    }

    fn assemble(
        config: BrokerConfig,
        collective_connector: Arc<dyn Connector>,
        federation_connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(ThreadRegistry::new()),
            collective_connector,
            federation_connector,
            collective: Mutex::new(None),
            federation: Mutex::new(None),
            stats: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Wire the queues, spawn both processors and the stats service.
    /// Returns immediately; a second call is a no-op.
    pub fn start(&self) -> BrokerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // each processor's outbox is the other's inbox
        let (collective_to_federation_tx, collective_to_federation_rx) = unbounded();
        let (federation_to_collective_tx, federation_to_collective_rx) = unbounded();

        let collective_cell = ConnectionCell::default();
        let federation_cell = ConnectionCell::default();

        let collective = Arc::new(Processor::new(
            CollectiveLogic,
            &self.config,
            self.collective_connector.clone(),
            collective_cell.clone(),
            federation_cell.clone(),
            federation_to_collective_rx,
            federation_to_collective_tx.clone(),
            collective_to_federation_tx.clone(),
        ));

        let federation = Arc::new(Processor::new(
            FederationLogic,
            &self.config,
            self.federation_connector.clone(),
            federation_cell.clone(),
            collective_cell,
            collective_to_federation_rx,
            collective_to_federation_tx,
            federation_to_collective_tx,
        ));

        collective.start(&self.registry)?;
        federation.start(&self.registry)?;

        let stats = Arc::new(StatsService::new(
            &self.config,
            self.registry.clone(),
            vec![
                collective.clone() as Arc<dyn StatsSource>,
                federation.clone() as Arc<dyn StatsSource>,
            ],
            federation_cell,
        ));
        stats.start()?;

        *self.collective.lock() = Some(collective);
        *self.federation.lock() = Some(federation);
        *self.stats.lock() = Some(stats);

        info!(
            cluster = %self.config.cluster,
            instance = %self.config.instance,
            "federation broker started"
        );

        Ok(())
    }

    /// Stop both processors and the stats service; no in-flight work is
    /// interrupted, workers wind down at their next blocking point
    pub fn stop(&self) {
        if let Some(collective) = self.collective.lock().as_ref() {
            collective.stop();
        }
        if let Some(federation) = self.federation.lock().as_ref() {
            federation.stop();
        }
        if let Some(stats) = self.stats.lock().as_ref() {
            stats.stop();
        }
        info!(instance = %self.config.instance, "federation broker stopping");
    }

    /// True when the broker started and every registered worker thread is
    /// still alive
    pub fn ok(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.registry.ok()
    }

    /// Per-thread liveness, for diagnostics
    pub fn thread_status(&self) -> HashMap<String, bool> {
        self.registry.status()
    }

    /// Current stats snapshot, once started
    pub fn stats_snapshot(&self) -> Option<Value> {
        self.stats.lock().as_ref().map(|stats| stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::testing::{MemoryBus, MemoryConnector};

    fn test_broker() -> FederationBroker {
        let mut config: BrokerConfig = toml::from_str(r#"cluster = "prod""#).unwrap();
        config.instance = "fed1".to_string();

        FederationBroker::with_connectors(
            config,
            Arc::new(MemoryConnector::new(MemoryBus::new(), "collective-nats")),
            Arc::new(MemoryConnector::new(MemoryBus::new(), "federation-nats")),
        )
        .unwrap()
    }

    #[test]
    fn test_not_ok_before_start() {
        let broker = test_broker();
        assert!(!broker.ok());
        assert!(broker.stats_snapshot().is_none());
    }

    #[test]
    fn test_start_registers_workers_and_is_idempotent() {
        let broker = test_broker();
        broker.start().unwrap();
        broker.start().unwrap();

        let status = broker.thread_status();
        for name in [
            "collective_consumer",
            "collective_inbox",
            "federation_consumer",
            "federation_inbox",
            "stats_publisher",
        ] {
            assert_eq!(status.get(name), Some(&true), "missing worker {}", name);
        }
        assert!(broker.ok());

        broker.stop();
    }

    #[test]
    fn test_new_requires_server_lists() {
        let config: BrokerConfig = toml::from_str(r#"cluster = "prod""#).unwrap();
        assert!(FederationBroker::new(config).is_err());
    }
}
