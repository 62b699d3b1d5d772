//! Address linking for multi-contract deployments
//!
//! The linker:
//! 1. Parses contract and script sources into templates with typed slots
//! 2. Resolves slots against concrete addresses
//! 3. Orders contracts so every dependency is deployed before its dependents

pub mod graph;
pub mod plan;
pub mod template;

pub use graph::DependencyGraph;
pub use plan::{ContractDeploymentSpec, DeployTarget, Dependency, DeploymentPlan, NewAccountKey};
pub use template::{resolve, Binding, Bindings, ResolvedScript, SlotKind, Template};
