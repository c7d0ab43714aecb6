//! tesserad.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_consensus::{AddNodeOptions, DEFAULT_CONSENSUS_PORT, DEFAULT_PKI_NAMESPACE};
use tessera_curator::DEFAULT_NODE_PREFIX;
use tessera_pki::Backoff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding `tessera.redb`.
    pub data_dir: PathBuf,
    /// Name this replica campaigns for leadership under.
    pub holder: String,
    pub lease_ttl_secs: u64,
    pub node_prefix: String,
    /// Deadline for each curator operation.
    pub deadline_ms: u64,
    pub consensus_port: u16,
    /// Host the bootstrap node advertises to consensus peers instead of
    /// its node ID.
    pub external_address: Option<String>,
    pub pki_namespace: String,
    pub crl_backoff: BackoffConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tessera"),
            holder: "tesserad".to_string(),
            lease_ttl_secs: 15,
            node_prefix: DEFAULT_NODE_PREFIX.to_string(),
            deadline_ms: 10_000,
            consensus_port: DEFAULT_CONSENSUS_PORT,
            external_address: None,
            pki_namespace: DEFAULT_PKI_NAMESPACE.to_string(),
            crl_backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 2_000,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tessera.redb")
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn crl_backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.crl_backoff.initial_ms),
            max: Duration::from_millis(self.crl_backoff.max_ms),
        }
    }

    pub fn add_node_options(&self) -> AddNodeOptions {
        AddNodeOptions {
            external_address: self.external_address.clone(),
            external_port: Some(self.consensus_port),
        }
    }
}
