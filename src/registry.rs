//! A chain-scoped registry of named contract deployments.
//!
//! Deployment scripts want one-shot semantics: deploy a contract the first
//! time they run and silently reuse it afterwards. The registry keeps the
//! name to address mapping in memory and round-trips through JSON so a
//! caller can carry it between runs however it likes, nothing is persisted
//! here.

use crate::client::Web3;
use crate::error::BrokerError;
use crate::types::SendTxOption;
use clarity::{Address, PrivateKey, Uint256};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout as future_timeout;

/// A single named contract deployment
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub address: Address,
    /// the creation transaction, absent for contracts adopted from elsewhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<Uint256>,
}

/// Named deployments for one chain. Names are unique, re-registering a
/// name is only accepted when it points at the same address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRegistry {
    chain_id: u64,
    deployments: BTreeMap<String, Deployment>,
}

impl DeploymentRegistry {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            deployments: BTreeMap::new(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.deployments.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Deployment> {
        self.deployments.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    /// Records a deployment. Registering an already-known name succeeds
    /// only if the address matches, anything else is a caller mistake.
    pub fn register(
        &mut self,
        name: &str,
        address: Address,
        tx_hash: Option<Uint256>,
    ) -> Result<(), BrokerError> {
        if let Some(existing) = self.deployments.get(name) {
            if existing.address == address {
                return Ok(());
            }
            return Err(BrokerError::BadInput(format!(
                "Deployment {name} already registered at {} (attempted {address})",
                existing.address
            )));
        }
        self.deployments.insert(
            name.to_string(),
            Deployment {
                name: name.to_string(),
                address,
                tx_hash,
            },
        );
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, BrokerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, BrokerError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One-shot deployment: returns the registered address for `name` if one
/// exists, otherwise deploys `bytecode`, waits for the receipt, records
/// the new address under `name` and returns it. Safe to call on every
/// startup.
pub async fn ensure_deployed(
    web3: &Web3,
    registry: &mut DeploymentRegistry,
    name: &str,
    bytecode: Vec<u8>,
    eth_private_key: PrivateKey,
    options: Vec<SendTxOption>,
    wait_timeout: Duration,
) -> Result<Address, BrokerError> {
    if let Some(existing) = registry.get(name) {
        debug!("{} already deployed at {}, skipping", name, existing.address);
        return Ok(existing.address);
    }

    // refuse to mix chains in one registry
    let chain_id = web3.eth_chainid().await?;
    if chain_id != registry.chain_id() {
        return Err(BrokerError::BadInput(format!(
            "Registry is for chain {} but the node reports chain {}",
            registry.chain_id(),
            chain_id
        )));
    }

    let txid = web3
        .deploy_contract(bytecode, 0u8.into(), eth_private_key, options)
        .await?;
    let receipt = future_timeout(
        wait_timeout,
        web3.wait_for_transaction(txid, wait_timeout, None),
    )
    .await??;
    let address = receipt.contract_address.ok_or_else(|| {
        BrokerError::BadResponse("Deployment receipt carries no contract address".to_string())
    })?;
    registry.register(name, address, Some(txid))?;
    debug!("deployed {} at {}", name, address);
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(fill: u8) -> Address {
        Address::from_slice(&[fill; 20]).unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = DeploymentRegistry::new(31337);
        assert!(!registry.is_registered("Store"));
        registry.register("Store", addr(0x11), None).unwrap();
        assert!(registry.is_registered("Store"));
        assert_eq!(registry.get("Store").unwrap().address, addr(0x11));
        assert_eq!(registry.chain_id(), 31337);
    }

    #[test]
    fn reregistering_same_address_is_idempotent() {
        let mut registry = DeploymentRegistry::new(1);
        registry.register("Store", addr(0x11), None).unwrap();
        registry
            .register("Store", addr(0x11), Some(5u8.into()))
            .unwrap();
        // the original record wins
        assert_eq!(registry.get("Store").unwrap().tx_hash, None);
    }

    #[test]
    fn conflicting_address_is_rejected() {
        let mut registry = DeploymentRegistry::new(1);
        registry.register("Store", addr(0x11), None).unwrap();
        let err = registry.register("Store", addr(0x22), None).unwrap_err();
        assert!(matches!(err, BrokerError::BadInput(_)), "{err}");
        assert_eq!(registry.get("Store").unwrap().address, addr(0x11));
    }

    #[test]
    fn json_round_trip() {
        let mut registry = DeploymentRegistry::new(1);
        registry
            .register("Store", addr(0x11), Some(7u8.into()))
            .unwrap();
        registry.register("TokenA", addr(0x22), None).unwrap();
        let json = registry.to_json().unwrap();
        let restored = DeploymentRegistry::from_json(&json).unwrap();
        assert_eq!(registry, restored);
    }
}
