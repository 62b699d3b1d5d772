//! Deployment specs and the ordered, immutable deployment plan built from them

use super::graph::DependencyGraph;
use super::template::{Binding, Bindings, ResolvedScript, SlotKind, Template};
use crate::error::LinkError;
use crate::ledger::{HashAlgorithm, SignatureAlgorithm, KEY_WEIGHT_THRESHOLD};
use crate::types::Address;

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// What a placeholder in a contract source links to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Another contract in the same plan, linked once it is deployed
    Contract(String),
    /// A contract already on the ledger
    Address(Address),
}

/// Key installed on an account created for a contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccountKey {
    pub public_key: Vec<u8>,
    pub sign_algo: SignatureAlgorithm,
    pub hash_algo: HashAlgorithm,
    pub weight: u32,
}

impl NewAccountKey {
    pub fn ed25519(public_key: Vec<u8>, hash_algo: HashAlgorithm) -> Self {
        Self {
            public_key,
            sign_algo: SignatureAlgorithm::Ed25519,
            hash_algo,
            weight: KEY_WEIGHT_THRESHOLD,
        }
    }
}

/// Where a contract is deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployTarget {
    /// Create a fresh account holding these keys (possibly none)
    NewAccount(Vec<NewAccountKey>),
    /// Add the contract to an existing account, which must authorize it
    ExistingAccount(Address),
}

impl Default for DeployTarget {
    fn default() -> Self {
        DeployTarget::NewAccount(Vec::new())
    }
}

/// One contract to deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractDeploymentSpec {
    pub name: String,
    pub source: Template,
    /// Placeholder -> dependency
    pub bindings: BTreeMap<String, Dependency>,
    pub target: DeployTarget,
}

impl ContractDeploymentSpec {
    pub fn new(name: impl Into<String>, source: &str) -> Result<Self, LinkError> {
        Ok(Self {
            name: name.into(),
            source: Template::parse(source)?,
            bindings: BTreeMap::new(),
            target: DeployTarget::default(),
        })
    }

    /// Link `placeholder` to another contract of the plan
    pub fn depends_on(mut self, placeholder: impl Into<String>, contract: impl Into<String>) -> Self {
        self.bindings
            .insert(placeholder.into(), Dependency::Contract(contract.into()));
        self
    }

    /// Link `placeholder` to an already deployed contract
    pub fn bind_address(mut self, placeholder: impl Into<String>, address: Address) -> Self {
        self.bindings
            .insert(placeholder.into(), Dependency::Address(address));
        self
    }

    pub fn with_target(mut self, target: DeployTarget) -> Self {
        self.target = target;
        self
    }

    /// Names of plan contracts this one references
    pub fn contract_dependencies(&self) -> impl Iterator<Item = &str> {
        self.bindings.values().filter_map(|dep| match dep {
            Dependency::Contract(name) => Some(name.as_str()),
            Dependency::Address(_) => None,
        })
    }

    /// Resolve the source against the addresses deployed so far
    pub fn link(&self, deployed: &BTreeMap<String, Address>) -> Result<ResolvedScript, LinkError> {
        let mut bindings = Bindings::new();
        for (placeholder, dependency) in &self.bindings {
            let address = match dependency {
                Dependency::Address(address) => *address,
                Dependency::Contract(contract) => {
                    *deployed
                        .get(contract)
                        .ok_or_else(|| LinkError::UnresolvedPlaceholder {
                            placeholder: placeholder.clone(),
                        })?
                }
            };
            bindings.insert(placeholder.clone(), Binding::Address(address));
        }
        self.source.resolve(&bindings)
    }
}

/// Contracts in an order where every dependency precedes its dependents
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    specs: Vec<ContractDeploymentSpec>,
}

impl DeploymentPlan {
    /// Validate every spec's bindings and order the specs.
    ///
    /// Fails before anything is submitted if a slot is unbound, a binding is
    /// unused, a dependency is unknown, or the dependency graph has a cycle.
    pub fn new(specs: Vec<ContractDeploymentSpec>) -> Result<Self, LinkError> {
        let mut seen = HashSet::new();
        let mut graph = DependencyGraph::new();

        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(LinkError::DuplicateContract(spec.name.clone()));
            }

            spec.source.check_bindings(
                spec.bindings
                    .keys()
                    .map(|placeholder| (placeholder.as_str(), SlotKind::Address)),
            )?;

            graph.add_contract(spec.name.clone());
            for dependency in spec.contract_dependencies() {
                graph.add_dependency(spec.name.clone(), dependency);
            }
        }

        let order = graph.order()?;
        debug!("Deployment order: {}", order.join(", "));

        let mut by_name: BTreeMap<String, ContractDeploymentSpec> =
            specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        let specs = order
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect();

        Ok(Self { specs })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContractDeploymentSpec> {
        self.specs.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
