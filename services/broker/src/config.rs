//! # Broker Configuration
//!
//! One `BrokerConfig` is loaded from TOML at startup and passed down into the
//! broker, which hands slices of it to each processor and the stats service.
//! There is no process-wide configuration singleton.
//!
//! ```toml
//! cluster = "prod"
//! instance = "fed1"
//! stats_port = 8222
//!
//! [collective]
//! servers = ["nats-collective1:4222", "nats-collective2:4222"]
//!
//! [federation]
//! servers = ["nats-federation1:4222"]
//!
//! [tls]
//! cert = "/etc/broker/cert.pem"
//! key = "/etc/broker/key.pem"
//! ca = "/etc/broker/ca.pem"
//! ```

use crate::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Transport endpoints for one side of the bridge
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SideConfig {
    /// Endpoints tried in order on every (re)connect
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Paths to the credentials this broker presents on both buses. The broker
/// builds one TLS context from these and passes it unmodified into every
/// transport connection; issuance and validation policy live elsewhere.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl TlsSettings {
    /// Build the TLS context handed to the transport adapters
    pub fn build_connector(&self) -> BrokerResult<native_tls::TlsConnector> {
        let cert = std::fs::read(&self.cert)?;
        let key = std::fs::read(&self.key)?;
        let ca = std::fs::read(&self.ca)?;

        let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
        let ca = native_tls::Certificate::from_pem(&ca)?;

        Ok(native_tls::TlsConnector::builder()
            .identity(identity)
            .add_root_certificate(ca)
            .build()?)
    }
}

/// Main broker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker cluster name; instances sharing it form one queue group
    pub cluster: String,

    /// Unique name of this instance within the cluster
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Collective-side bus endpoints
    #[serde(default)]
    pub collective: SideConfig,

    /// Federation-side bus endpoints
    #[serde(default)]
    pub federation: SideConfig,

    /// Loopback port for `GET /stats`; no listener when unset
    #[serde(default)]
    pub stats_port: Option<u16>,

    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_instance() -> String {
    format!("instance-{}", std::process::id())
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> BrokerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| BrokerError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the parts every deployment must get right. Server lists are
    /// validated by the side that resolves them, so configurations used with
    /// injected connections stay valid without them.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.cluster.is_empty() {
            return Err(BrokerError::Config("cluster name must not be empty".into()));
        }
        if self.instance.is_empty() {
            return Err(BrokerError::Config(
                "instance name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// `<cluster>:<instance>`, the identity recorded in seen-by hops
    pub fn instance_id(&self) -> String {
        format!("{}:{}", self.cluster, self.instance)
    }
}
