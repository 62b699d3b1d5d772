//! Sequential deployment of a linked contract plan

use super::Harness;
use crate::error::{HarnessError, HarnessResult};
use crate::events::created_account;
use crate::link::{ContractDeploymentSpec, DeployTarget, DeploymentPlan, ResolvedScript};
use crate::templates::{self, encode_account_key};
use crate::tx::{ExecutionResult, TransactionOutcome, TransactionRequest};
use crate::types::{Address, TransactionId, Value};

use std::collections::BTreeMap;
use tracing::{error, info};
use uuid::Uuid;

/// A contract the harness deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedContract {
    pub name: String,
    pub address: Address,
    pub transaction_id: TransactionId,
}

impl Harness {
    /// Deploy every contract of `plan` in order.
    ///
    /// Each source is linked against the addresses deployed before it. The
    /// first failure stops the run and is reported with the contract's name;
    /// contracts deployed before it stay deployed.
    pub async fn deploy(&self, plan: &DeploymentPlan) -> HarnessResult<Vec<DeployedContract>> {
        let run_id = Uuid::new_v4();
        info!(
            "Deployment {} starting: {}",
            run_id,
            plan.names().join(" -> ")
        );

        let mut addresses = BTreeMap::new();
        let mut deployed = Vec::with_capacity(plan.len());

        for spec in plan.iter() {
            let contract = self
                .deploy_contract(run_id, spec, &addresses)
                .await
                .map_err(|e| {
                    error!("Deployment {}: {} failed: {}", run_id, spec.name, e);
                    HarnessError::Deployment {
                        contract: spec.name.clone(),
                        source: Box::new(e),
                    }
                })?;

            addresses.insert(contract.name.clone(), contract.address);
            deployed.push(contract);
        }

        info!(
            "Deployment {} finished: {} contracts",
            run_id,
            deployed.len()
        );
        Ok(deployed)
    }

    async fn deploy_contract(
        &self,
        run_id: Uuid,
        spec: &ContractDeploymentSpec,
        deployed: &BTreeMap<String, Address>,
    ) -> HarnessResult<DeployedContract> {
        let source = spec.link(deployed)?;
        let code = Value::String(hex::encode(source.as_str()));
        let name = Value::String(spec.name.clone());
        let service = self.service_key;

        let (script, arguments, authorizer) = match &spec.target {
            DeployTarget::NewAccount(keys) => (
                templates::CREATE_ACCOUNT,
                vec![
                    Value::Array(keys.iter().map(encode_account_key).collect()),
                    name,
                    code,
                ],
                service.address,
            ),
            DeployTarget::ExistingAccount(address) => {
                (templates::ADD_CONTRACT, vec![name, code], *address)
            }
        };

        let request = TransactionRequest {
            script: ResolvedScript::from_source(script)?,
            arguments,
            proposer: service,
            payer: service.address,
            authorizers: vec![authorizer],
            gas_limit: self.config.deploy_gas_limit,
            required_authorizers: 1,
        };

        let mut submission = self.sender.send(&request).await?;
        let id = submission.handle.id;
        let max_wait = self.submission.policy().max_wait;
        let outcome = self.submission.poll(&mut submission.handle, max_wait).await;
        self.settle(&submission.reservation, &outcome).await;

        let events = match outcome {
            TransactionOutcome::Sealed(ExecutionResult::Success { events }) => events,
            TransactionOutcome::Sealed(ExecutionResult::Failure { reason, .. }) => {
                return Err(HarnessError::TransactionFailed { id, reason })
            }
            TransactionOutcome::Expired => return Err(HarnessError::TransactionExpired { id }),
            TransactionOutcome::Unknown => return Err(HarnessError::OutcomeUnknown { id }),
        };

        let address = match &spec.target {
            DeployTarget::NewAccount(_) => {
                created_account(&events).ok_or_else(|| HarnessError::TransactionFailed {
                    id,
                    reason: "no account was created".to_string(),
                })?
            }
            DeployTarget::ExistingAccount(address) => *address,
        };

        crate::metrics::record_contract_deployed();
        info!(
            "Deployment {}: {} deployed to {} (transaction {})",
            run_id, spec.name, address, id
        );

        Ok(DeployedContract {
            name: spec.name.clone(),
            address,
            transaction_id: id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::ledger::{Emulator, EmulatorConfig, HashAlgorithm, LedgerClient};
    use crate::link::NewAccountKey;
    use crate::signer::KeyringSigner;
    use std::sync::Arc;

    const TOKEN: &str = "pub contract Token {}";
    const SHOP: &str = "import Token from {{Token}}\npub contract Shop {}";

    fn setup() -> (Harness, Emulator) {
        let signing_key = KeyringSigner::generate_key();
        let emulator = Emulator::new(
            EmulatorConfig::default(),
            NewAccountKey::ed25519(
                KeyringSigner::public_key_of(&signing_key),
                HashAlgorithm::Sha3_256,
            ),
        );
        let keyring = KeyringSigner::new();
        keyring.add_key(emulator.service_key(), signing_key, HashAlgorithm::Sha3_256);

        let config = HarnessConfig {
            poll_initial_interval_ms: 1,
            poll_max_interval_ms: 5,
            ..HarnessConfig::default()
        };
        let harness = Harness::new(
            Arc::new(emulator.clone()),
            Arc::new(keyring),
            emulator.service_key(),
            config,
        );
        (harness, emulator)
    }

    #[tokio::test]
    async fn test_dependents_link_to_deployed_addresses() {
        let (harness, emulator) = setup();
        let plan = DeploymentPlan::new(vec![
            ContractDeploymentSpec::new("Shop", SHOP)
                .unwrap()
                .depends_on("Token", "Token"),
            ContractDeploymentSpec::new("Token", TOKEN).unwrap(),
        ])
        .unwrap();

        let deployed = harness.deploy(&plan).await.unwrap();
        assert_eq!(deployed[0].name, "Token");
        assert_eq!(deployed[1].name, "Shop");

        let shop = emulator
            .get_account(deployed[1].address)
            .await
            .unwrap();
        let source = &shop.contracts["Shop"];
        assert!(source.contains(&format!("import Token from {}", deployed[0].address)));
    }

    #[tokio::test]
    async fn test_existing_account_target() {
        let (harness, emulator) = setup();
        let service = harness.service_key().address;
        let plan = DeploymentPlan::new(vec![ContractDeploymentSpec::new("Token", TOKEN)
            .unwrap()
            .with_target(DeployTarget::ExistingAccount(service))])
        .unwrap();

        let deployed = harness.deploy(&plan).await.unwrap();
        assert_eq!(deployed[0].address, service);
        assert!(emulator
            .account(service)
            .unwrap()
            .contracts
            .contains_key("Token"));

        // A second deployment of the same name fails on the ledger and names the contract
        let err = harness.deploy(&plan).await.unwrap_err();
        match err {
            HarnessError::Deployment { contract, source } => {
                assert_eq!(contract, "Token");
                assert!(matches!(*source, HarnessError::TransactionFailed { .. }));
            }
            other => panic!("expected deployment error, got {:?}", other),
        }
    }
}
