//! Ledger harness - links, deploys, signs and submits smart-contract transactions
//!
//! Contract sources reference each other through address placeholders. The
//! harness orders a deployment plan so dependencies land first, links each
//! source against the addresses deployed before it, and drives every
//! transaction through sequence allocation, multi-role signing, submission
//! and polling.

pub mod config;
pub mod error;
pub mod events;
pub mod harness;
pub mod ledger;
pub mod link;
pub mod metrics;
pub mod signer;
pub mod templates;
pub mod tx;
pub mod types;

pub use error::{HarnessError, HarnessResult, LinkError};
pub use harness::{DeployedContract, ExecutionReport, Harness, Operation};
