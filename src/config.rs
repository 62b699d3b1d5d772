//! Configuration management for the ledger harness
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::ledger::{EmulatorConfig, HashAlgorithm};
use crate::link::{ContractDeploymentSpec, DeployTarget, Dependency, DeploymentPlan};
use crate::types::Address;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    pub service_account: ServiceAccountConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

/// Retry, polling and gas parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub max_sequence_attempts: u32,
    pub resync_backoff_ms: u64,
    pub poll_initial_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_max_wait_secs: u64,
    pub default_gas_limit: u64,
    pub deploy_gas_limit: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_sequence_attempts: 3,
            resync_backoff_ms: 250,
            poll_initial_interval_ms: 100,
            poll_max_interval_ms: 2_000,
            poll_max_wait_secs: 30,
            default_gas_limit: 100,
            deploy_gas_limit: 9_999,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Emulator,
    Testnet,
    Mainnet,
}

impl Network {
    /// Address of a standard contract pre-deployed on this network
    pub fn well_known(&self, contract: &str) -> Option<Address> {
        let index = match (contract, self) {
            ("FungibleToken", Network::Emulator) => 0xee82856bf20e2aa6,
            ("FungibleToken", Network::Testnet) => 0x9a0766d93b6608b7,
            ("FungibleToken", Network::Mainnet) => 0xf233dcee88fe0abe,
            _ => return None,
        };
        Some(Address::from_index(index))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub network: Network,
    /// Blocks after its reference block before a transaction expires
    pub expiry_window: u64,
    /// Status queries a transaction stays pending before it seals
    pub seal_after_polls: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            network: Network::Emulator,
            expiry_window: 600,
            seal_after_polls: 1,
        }
    }
}

impl LedgerConfig {
    pub fn emulator_config(&self) -> EmulatorConfig {
        EmulatorConfig {
            expiry_window: self.expiry_window,
            seal_after_polls: Some(self.seal_after_polls),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceAccountConfig {
    /// Environment variable holding the hex Ed25519 secret
    pub private_key_env: String,
    #[serde(default)]
    pub key_index: u32,
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: HashAlgorithm,
}

fn default_hash_algorithm() -> HashAlgorithm {
    HashAlgorithm::Sha3_256
}

impl ServiceAccountConfig {
    /// Hex secret from the configured environment variable
    pub fn private_key(&self) -> Result<String> {
        env::var(&self.private_key_env).with_context(|| {
            format!(
                "Service account key not set: export {} with a hex Ed25519 secret",
                self.private_key_env
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub contracts: Vec<ContractConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContractConfig {
    pub name: String,
    /// Source path, relative to the configuration file
    pub source: PathBuf,
    /// Placeholder -> `contract:<Name>`, `network:<Name>` or a hex address
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    /// `new` (default), `service`, or a hex address
    #[serde(default)]
    pub target: Option<String>,
}

impl Settings {
    /// Path named by `HARNESS_CONFIG`, or `config/default.toml`
    pub fn config_path() -> PathBuf {
        env::var("HARNESS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"))
    }

    /// Load settings from [`Settings::config_path`]
    pub fn load() -> Result<Self> {
        Self::from_path(&Self::config_path())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.harness.max_sequence_attempts == 0 {
            anyhow::bail!("harness.max_sequence_attempts must be at least 1");
        }
        if self.harness.poll_initial_interval_ms == 0 {
            anyhow::bail!("harness.poll_initial_interval_ms must be positive");
        }
        if self.harness.poll_initial_interval_ms > self.harness.poll_max_interval_ms {
            anyhow::bail!("harness.poll_initial_interval_ms exceeds poll_max_interval_ms");
        }

        let mut names = HashSet::new();
        for contract in &self.deployment.contracts {
            if contract.name.is_empty() {
                anyhow::bail!("Deployment contract with empty name");
            }
            if !names.insert(contract.name.as_str()) {
                anyhow::bail!("Contract {} is configured more than once", contract.name);
            }
            for (placeholder, value) in &contract.bindings {
                parse_binding(value, self.ledger.network).with_context(|| {
                    format!("Contract {} binding {}", contract.name, placeholder)
                })?;
            }
        }

        if self.ledger.network != Network::Emulator {
            tracing::warn!(
                "Network {:?} configured; rehearsals still run against the in-process emulator",
                self.ledger.network
            );
        }

        Ok(())
    }

    /// Build the deployment plan, reading sources relative to `base_dir`
    pub fn deployment_plan(&self, base_dir: &Path, service: Address) -> Result<DeploymentPlan> {
        let mut specs = Vec::with_capacity(self.deployment.contracts.len());

        for contract in &self.deployment.contracts {
            let path = base_dir.join(&contract.source);
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read source of {}: {:?}", contract.name, path))?;

            let mut spec = ContractDeploymentSpec::new(contract.name.clone(), &source)
                .with_context(|| format!("Invalid source for {}", contract.name))?;

            for (placeholder, value) in &contract.bindings {
                spec = match parse_binding(value, self.ledger.network)? {
                    Dependency::Contract(name) => spec.depends_on(placeholder.clone(), name),
                    Dependency::Address(address) => spec.bind_address(placeholder.clone(), address),
                };
            }

            let target = match contract.target.as_deref() {
                None | Some("new") => DeployTarget::default(),
                Some("service") => DeployTarget::ExistingAccount(service),
                Some(address) => DeployTarget::ExistingAccount(
                    address
                        .parse()
                        .with_context(|| format!("Invalid target for {}", contract.name))?,
                ),
            };
            specs.push(spec.with_target(target));
        }

        Ok(DeploymentPlan::new(specs)?)
    }
}

/// Parse a configured binding value
pub fn parse_binding(value: &str, network: Network) -> Result<Dependency> {
    if let Some(name) = value.strip_prefix("contract:") {
        return Ok(Dependency::Contract(name.trim().to_string()));
    }
    if let Some(name) = value.strip_prefix("network:") {
        let name = name.trim();
        return network
            .well_known(name)
            .map(Dependency::Address)
            .with_context(|| format!("No well-known {} contract on {:?}", name, network));
    }
    let address = value
        .parse()
        .with_context(|| format!("Invalid binding value {:?}", value))?;
    Ok(Dependency::Address(address))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
